// src/config/model.rs

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::Deserialize;

use crate::pipeline::{DEFAULT_MAX_CONCURRENT_OPERATION_COUNT, PipelineOptions};
use crate::types::PipelineAlgorithm;

/// Configuration exactly as read from a TOML file, before validation.
///
/// ```toml
/// [config]
/// max_hold_wait_ms = 1000
///
/// [default]
/// max_concurrent_operation_count = 8
///
/// [pipeline.uploads]
/// algorithm = "commit"
/// max_concurrent_operation_count = 4
/// previous_names = ["legacy-uploads"]
/// ```
///
/// All sections are optional at this stage; [`ConfigFile`] is what the rest
/// of the crate consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub config: ConfigSection,

    #[serde(default)]
    pub default: DefaultSection,

    /// All pipelines from `[pipeline.<name>]`, keyed by name.
    #[serde(default)]
    pub pipeline: BTreeMap<String, PipelineConfig>,
}

/// Validated configuration.
///
/// Only obtainable through `ConfigFile::try_from(RawConfigFile)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub config: ConfigSection,
    pub default: DefaultSection,
    pub pipeline: BTreeMap<String, PipelineConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        config: ConfigSection,
        default: DefaultSection,
        pipeline: BTreeMap<String, PipelineConfig>,
    ) -> Self {
        Self {
            config,
            default,
            pipeline,
        }
    }
}

/// `[config]` section: runtime behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// Longest time the runtime sleeps before re-checking held operations.
    #[serde(default = "default_max_hold_wait_ms")]
    pub max_hold_wait_ms: u64,
}

fn default_max_hold_wait_ms() -> u64 {
    1000
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            max_hold_wait_ms: default_max_hold_wait_ms(),
        }
    }
}

impl ConfigSection {
    pub fn max_hold_wait(&self) -> Duration {
        Duration::from_millis(self.max_hold_wait_ms)
    }
}

/// `[default]` section: values for pipelines that do not set their own.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultSection {
    /// If `None`, pipelines run up to 8 operations at once. Zero means
    /// unbounded.
    #[serde(default)]
    pub max_concurrent_operation_count: Option<usize>,
}

/// `[pipeline.<name>]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    /// `"commit"` (default) or `"flat"`.
    #[serde(default)]
    pub algorithm: PipelineAlgorithm,

    #[serde(default)]
    pub max_concurrent_operation_count: Option<usize>,

    /// Names this pipeline was registered under before a rename. Stored
    /// operations of a previous name are adopted.
    #[serde(default)]
    pub previous_names: Vec<String>,

    /// Allow restoring a pipeline whose stored algorithm differs.
    #[serde(default)]
    pub migrate_algorithm: bool,
}

impl PipelineConfig {
    pub fn effective_max_concurrent_operation_count(&self, defaults: &DefaultSection) -> usize {
        self.max_concurrent_operation_count
            .or(defaults.max_concurrent_operation_count)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_OPERATION_COUNT)
    }

    /// Options used to construct the pipeline.
    pub fn options(&self, defaults: &DefaultSection) -> PipelineOptions {
        PipelineOptions {
            algorithm: self.algorithm,
            max_concurrent_operation_count: self.effective_max_concurrent_operation_count(defaults),
            previous_names: self.previous_names.iter().cloned().collect::<BTreeSet<_>>(),
            migrate_algorithm: self.migrate_algorithm,
        }
    }
}
