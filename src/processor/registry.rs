//! Ownership of the processor's consumer tasks.
//!
//! The handle is the only place that knows whether the consumers are still
//! running; the health endpoint asks it instead of consulting shared state.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ProcessorStats, StatsSnapshot};
use crate::transport::Source;

/// Liveness of one consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerStatus {
    Running,
    Stopped,
}

pub struct ProcessorHandle {
    cancel: CancellationToken,
    tasks: HashMap<Source, JoinHandle<()>>,
    stats: Arc<ProcessorStats>,
}

impl ProcessorHandle {
    pub(crate) fn new(cancel: CancellationToken, stats: Arc<ProcessorStats>) -> Self {
        Self {
            cancel,
            tasks: HashMap::new(),
            stats,
        }
    }

    pub(crate) fn register(&mut self, source: Source, task: JoinHandle<()>) {
        if let Some(previous) = self.tasks.insert(source, task) {
            previous.abort();
        }
    }

    /// Status of every registered consumer, command stream first.
    pub fn liveness(&self) -> Vec<(Source, ConsumerStatus)> {
        let mut out: Vec<_> = self
            .tasks
            .iter()
            .map(|(source, task)| {
                let status = if task.is_finished() {
                    ConsumerStatus::Stopped
                } else {
                    ConsumerStatus::Running
                };
                (*source, status)
            })
            .collect();
        out.sort_by_key(|(source, _)| *source as u8);
        out
    }

    /// True while every consumer loop is running.
    pub fn is_alive(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.values().all(|task| !task.is_finished())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Token that stops the consumers when cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop consuming, then wait for in-flight deliveries to settle.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (source, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(%source, error = %e, "consumer task ended abnormally");
            }
        }
        info!("processor stopped");
    }
}
