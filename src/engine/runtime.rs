// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::registry::Registry;

use super::{RuntimeEvent, RuntimeOptions};

/// Drives scheduling passes for every registered pipeline.
///
/// Each loop iteration waits for either a `RuntimeEvent` or the next hold
/// expiry (capped by `max_hold_wait`), then rechecks the affected
/// pipelines. Dispatch happens through each pipeline's delegate.
pub struct Runtime {
    registry: Arc<Registry>,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    options: RuntimeOptions,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(
        registry: Arc<Registry>,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            registry,
            event_rx,
            options,
        }
    }

    /// Main event loop.
    ///
    /// Returns when shutdown is requested or every sender is dropped.
    pub async fn run(mut self) -> Result<()> {
        info!("cloudpipe runtime started");

        loop {
            let wait = self.next_wakeup();

            let event = tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(e) => e,
                    None => {
                        info!("runtime event channel closed; exiting");
                        break;
                    }
                },
                _ = tokio::time::sleep(wait) => RuntimeEvent::Recheck { pipeline: None },
            };

            debug!(?event, "runtime received event");

            match event {
                RuntimeEvent::Recheck { pipeline: None } => self.registry.recheck_all(),
                RuntimeEvent::Recheck {
                    pipeline: Some(name),
                } => match self.registry.pipeline(&name) {
                    Some(pipeline) => pipeline.recheck(),
                    None => warn!(pipeline = %name, "recheck requested for unknown pipeline"),
                },
                RuntimeEvent::ShutdownRequested => {
                    info!("shutdown requested; stopping runtime");
                    break;
                }
            }
        }

        info!("runtime exiting");
        Ok(())
    }

    /// Time until the earliest hold expires, bounded by `max_hold_wait`.
    fn next_wakeup(&self) -> Duration {
        let now = Utc::now();
        let max = self.options.max_hold_wait;

        match self.registry.next_hold_expiry(now) {
            Some(at) => {
                let until = (at - now).to_std().unwrap_or(Duration::ZERO);
                until.min(max)
            }
            None => max,
        }
    }
}
