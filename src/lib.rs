// src/lib.rs

pub mod cli;
pub mod commit;
pub mod config;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod logging;
pub mod operation;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod types;

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::config::loader::{CONFIG_ENV_VAR, load_and_validate, resolve_config_path};
use crate::config::model::ConfigFile;
use crate::pipeline::{ChannelDelegate, Pipeline};
use crate::registry::Registry;
use crate::store::SqliteStore;

pub use crate::commit::{Commit, Transaction};
pub use crate::operation::Operation;
pub use crate::types::{OperationStatus, PipelineAlgorithm};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the SQLite operation store
/// - registration and restore of every configured pipeline
///
/// Restored operations are reported, not dispatched.
pub fn run(args: CliArgs) -> Result<()> {
    let config_path = resolve_config_path(
        args.config.as_deref(),
        std::env::var(CONFIG_ENV_VAR).ok().as_deref(),
    );
    let cfg = load_and_validate(&config_path)?;
    debug!(config = %config_path.display(), "config loaded");

    if args.dry_run {
        print!("{}", render_dry_run(&cfg));
        debug!("dry-run complete (store not opened)");
        return Ok(());
    }

    let store = SqliteStore::open(&args.db)?;
    let registry = Registry::new(store);

    // Nothing is dispatched during restore; the receiver is never read.
    let (delegate, _started) = ChannelDelegate::new();
    let pipelines = registry.register_configured(&cfg, Arc::new(delegate))?;
    info!(count = pipelines.len(), db = %args.db, "pipelines restored");

    print!("{}", render_report(&pipelines));
    Ok(())
}

/// Configuration summary printed by `--dry-run`.
pub fn render_dry_run(cfg: &ConfigFile) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "cloudpipe dry-run");
    let _ = writeln!(out, "  config.max_hold_wait_ms = {}", cfg.config.max_hold_wait_ms);
    let _ = writeln!(out);

    let _ = writeln!(out, "pipelines ({}):", cfg.pipeline.len());
    for (name, pipeline) in cfg.pipeline.iter() {
        let _ = writeln!(out, "  - {name}");
        let _ = writeln!(out, "      algorithm: {}", pipeline.algorithm);
        let _ = writeln!(
            out,
            "      max_concurrent_operation_count: {}",
            pipeline.effective_max_concurrent_operation_count(&cfg.default)
        );
        if !pipeline.previous_names.is_empty() {
            let _ = writeln!(out, "      previous_names: {:?}", pipeline.previous_names);
        }
        if pipeline.migrate_algorithm {
            let _ = writeln!(out, "      migrate_algorithm: true");
        }
    }
    out
}

/// Human-readable dump of restored pipelines: graphs, statuses and holds.
pub fn render_report(pipelines: &[Pipeline]) -> String {
    let mut out = String::new();

    for pipeline in pipelines {
        let _ = writeln!(
            out,
            "pipeline {} ({}, max {} concurrent, {} graphs)",
            pipeline.name(),
            pipeline.algorithm(),
            pipeline.max_concurrent_operation_count(),
            pipeline.graph_count()
        );

        for (idx, ops) in pipeline.graph_operations().iter().enumerate() {
            let snapshot = pipeline.snapshot_for_graph_index(idx).unwrap_or_default();
            let _ = writeln!(out, "  graph {idx} (snapshot {snapshot}):");
            for op in ops {
                let _ = write!(
                    out,
                    "    - {} {:?} priority={}",
                    op.uuid(),
                    op.status(),
                    op.priority()
                );
                if !op.dependencies().is_empty() {
                    let deps: Vec<String> = op.dependencies().iter().map(ToString::to_string).collect();
                    let _ = write!(out, " after=[{}]", deps.join(", "));
                }
                if let Some(until) = pipeline.latest_hold(&op.uuid()) {
                    let _ = write!(out, " held_until={}", until.to_rfc3339());
                }
                let _ = writeln!(out);
            }
        }
    }

    out
}
