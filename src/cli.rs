// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `cloudpipe`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "cloudpipe",
    version,
    about = "Inspect durable cloud-sync operation pipelines.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// If omitted, `CLOUDPIPE_CONFIG` or `Cloudpipe.toml` in the current
    /// working directory is used.
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Path to the SQLite operation store.
    #[arg(long, value_name = "PATH", default_value = "cloudpipe.db")]
    pub db: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CLOUDPIPE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate the config and print it; don't open the store.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
