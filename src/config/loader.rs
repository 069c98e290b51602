// src/config/loader.rs

//! Reading `Cloudpipe.toml`.
//!
//! The config path comes from `--config`, then `CLOUDPIPE_CONFIG`, then
//! `Cloudpipe.toml` in the working directory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Environment variable consulted when no `--config` flag is given.
pub const CONFIG_ENV_VAR: &str = "CLOUDPIPE_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "Cloudpipe.toml";

/// Read and deserialize a config file. Pipelines are not validated.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    debug!(path = %path.display(), "reading config");
    load_from_str(&fs::read_to_string(path)?)
}

pub fn load_from_str(contents: &str) -> Result<RawConfigFile> {
    Ok(toml::from_str(contents)?)
}

/// Read a config file and validate it into a [`ConfigFile`].
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    ConfigFile::try_from(load_from_path(path)?)
}

/// Pick the config path from the CLI flag and the env var value.
///
/// Blank values count as unset.
pub fn resolve_config_path(cli_path: Option<&str>, env_value: Option<&str>) -> PathBuf {
    cli_path
        .or(env_value)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map_or_else(default_config_path, PathBuf::from)
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_FILE)
}
