// src/config/validate.rs

use std::collections::BTreeMap;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{CloudpipeError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::CloudpipeError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.config, raw.default, raw.pipeline))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_pipelines(cfg)?;
    validate_global_config(cfg)?;
    validate_pipeline_names(cfg)?;
    Ok(())
}

fn ensure_has_pipelines(cfg: &RawConfigFile) -> Result<()> {
    if cfg.pipeline.is_empty() {
        return Err(CloudpipeError::ConfigError(
            "config must contain at least one [pipeline.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_global_config(cfg: &RawConfigFile) -> Result<()> {
    if cfg.config.max_hold_wait_ms == 0 {
        return Err(CloudpipeError::ConfigError(
            "[config].max_hold_wait_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

/// Every pipeline name and previous name must identify exactly one pipeline.
fn validate_pipeline_names(cfg: &RawConfigFile) -> Result<()> {
    // name or alias -> owning pipeline
    let mut owners: BTreeMap<&str, &str> = BTreeMap::new();

    for name in cfg.pipeline.keys() {
        if name.trim().is_empty() {
            return Err(CloudpipeError::ConfigError(
                "pipeline names must not be empty".to_string(),
            ));
        }
        owners.insert(name.as_str(), name.as_str());
    }

    for (name, pipeline) in cfg.pipeline.iter() {
        for previous in pipeline.previous_names.iter() {
            if previous == name {
                return Err(CloudpipeError::ConfigError(format!(
                    "pipeline '{name}' lists its own name in `previous_names`"
                )));
            }
            if let Some(owner) = owners.insert(previous.as_str(), name.as_str()) {
                return Err(CloudpipeError::DuplicatePipeline(format!(
                    "'{previous}' is used by both '{owner}' and '{name}'"
                )));
            }
        }
    }

    Ok(())
}
