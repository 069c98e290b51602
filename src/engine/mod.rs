// src/engine/mod.rs

//! Async runtime around the registry.
//!
//! The scheduler has no timer of its own: it only runs a pass when
//! something changes. This module supplies the missing clock. The runtime
//! event loop reacts to:
//! - explicit recheck requests (one pipeline or all of them)
//! - the earliest hold date among queued operations expiring
//! - shutdown signals
//!
//! The loop itself is implemented in [`runtime`].

use std::time::Duration;

/// Runtime options for the async shell.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// Upper bound on how long the loop sleeps between passes, even when the
    /// next hold date is further away (or there is none).
    pub max_hold_wait: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_hold_wait: Duration::from_millis(1000),
        }
    }
}

/// Events flowing into the runtime.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Run a scheduling pass on one pipeline, or on every pipeline.
    Recheck { pipeline: Option<String> },
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

pub mod runtime;

pub use runtime::Runtime;
