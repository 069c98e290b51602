// src/config/mod.rs

//! Configuration loading and validation for cloudpipe.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Locate and load a config file from disk (`loader.rs`).
//! - Validate pipeline names, aliases and global settings (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{
    CONFIG_ENV_VAR, default_config_path, load_and_validate, load_from_path, load_from_str,
    resolve_config_path,
};
pub use model::{ConfigFile, ConfigSection, DefaultSection, PipelineConfig, RawConfigFile};
