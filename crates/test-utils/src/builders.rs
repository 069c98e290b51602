#![allow(dead_code)]

use std::collections::BTreeMap;

use cloudpipe::config::{ConfigFile, ConfigSection, DefaultSection, PipelineConfig, RawConfigFile};
use cloudpipe::{Operation, PipelineAlgorithm};
use uuid::Uuid;

/// Builder for `Operation` to simplify test setup.
pub struct OperationBuilder {
    op: Operation,
}

impl OperationBuilder {
    pub fn new() -> Self {
        Self {
            op: Operation::new(),
        }
    }

    pub fn with_uuid(uuid: Uuid) -> Self {
        Self {
            op: Operation::with_uuid(uuid),
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.op.set_priority(priority);
        self
    }

    pub fn after(mut self, dependency: &Operation) -> Self {
        self.op.add_dependency(dependency.uuid());
        self
    }

    pub fn after_uuid(mut self, dependency: Uuid) -> Self {
        self.op.add_dependency(dependency);
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.op.set_payload(payload.to_vec());
        self
    }

    pub fn build(self) -> Operation {
        self.op
    }
}

impl Default for OperationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `ConfigFile`.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                config: ConfigSection::default(),
                default: DefaultSection::default(),
                pipeline: BTreeMap::new(),
            },
        }
    }

    pub fn with_pipeline(mut self, name: &str, pipeline: PipelineConfig) -> Self {
        self.config.pipeline.insert(name.to_string(), pipeline);
        self
    }

    pub fn max_hold_wait_ms(mut self, ms: u64) -> Self {
        self.config.config.max_hold_wait_ms = ms;
        self
    }

    pub fn default_max_concurrent(mut self, count: usize) -> Self {
        self.config.default.max_concurrent_operation_count = Some(count);
        self
    }

    /// The unvalidated config, for tests that expect validation to fail.
    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `PipelineConfig`.
pub struct PipelineConfigBuilder {
    pipeline: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn new() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
        }
    }

    pub fn algorithm(mut self, algorithm: PipelineAlgorithm) -> Self {
        self.pipeline.algorithm = algorithm;
        self
    }

    pub fn flat(self) -> Self {
        self.algorithm(PipelineAlgorithm::Flat)
    }

    pub fn max_concurrent(mut self, count: usize) -> Self {
        self.pipeline.max_concurrent_operation_count = Some(count);
        self
    }

    pub fn previous_name(mut self, name: &str) -> Self {
        self.pipeline.previous_names.push(name.to_string());
        self
    }

    pub fn migrate_algorithm(mut self, val: bool) -> Self {
        self.pipeline.migrate_algorithm = val;
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.pipeline
    }
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
