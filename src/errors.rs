// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::types::PipelineAlgorithm;

#[derive(Error, Debug)]
pub enum CloudpipeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(
        "Pipeline '{pipeline}' changed algorithm from {previous} to {current} without `migrate_algorithm = true`"
    )]
    AlgorithmChanged {
        pipeline: String,
        previous: PipelineAlgorithm,
        current: PipelineAlgorithm,
    },

    #[error("Pipeline already registered: {0}")]
    DuplicatePipeline(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Cycle detected in operation dependencies: {0}")]
    DependencyCycle(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Storage error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Corrupt stored row: {0}")]
    CorruptRow(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, CloudpipeError>;
