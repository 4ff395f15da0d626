//! Job-execution collaborator.
//!
//! The gatekeeper never drives an engine directly. [`EngineDispatcher`]
//! reads the queue behind an [`EngineSink`] and turns `INITIALIZING` into
//! [`JobEngine::submit`] and `CANCELING` into [`JobEngine::cancel`]. The
//! queue is bounded: a busy engine slows publishing down, it never loses a
//! message. Engine failures come back through the status stream as
//! `SYSTEM_ERROR`.

pub mod process;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{EngineError, TransportError};
use crate::models::{EngineParams, RunMessage, RunState, StatusUpdate};
use crate::transport::channel::ChannelIngress;
use crate::transport::{OutputSink, Route, Routed};

pub use process::ProcessEngine;

/// Everything an engine needs to start a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    pub run_id: String,
    pub workflow_url: String,
    pub workflow_type: String,
    pub workflow_type_version: String,
    pub params_blob: String,
    pub engine_params: EngineParams,
}

impl From<&RunMessage> for RunParams {
    fn from(msg: &RunMessage) -> Self {
        Self {
            run_id: msg.run_id.clone(),
            workflow_url: msg.workflow_url.clone(),
            workflow_type: msg.workflow_type.clone(),
            workflow_type_version: msg.workflow_type_version.clone(),
            params_blob: msg.params_blob.clone(),
            engine_params: msg.engine_params.clone(),
        }
    }
}

/// Engine-side identity of a submitted run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunHandle {
    pub run_id: String,
    pub engine_id: String,
}

#[async_trait]
pub trait JobEngine: Send + Sync {
    async fn submit(&self, params: &RunParams) -> Result<RunHandle, EngineError>;
    async fn cancel(&self, handle: &RunHandle) -> Result<(), EngineError>;
}

/// Output sink that queues engine and notification messages for an
/// [`EngineDispatcher`]. Informational status messages are not queued.
#[derive(Clone)]
pub struct EngineSink {
    tx: mpsc::Sender<Routed>,
}

/// Create an engine queue holding at most `capacity` messages.
pub fn engine_queue(capacity: usize) -> (EngineSink, mpsc::Receiver<Routed>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EngineSink { tx }, rx)
}

#[async_trait]
impl OutputSink for EngineSink {
    async fn publish(&self, routed: &Routed) -> Result<(), TransportError> {
        if routed.route == Route::Status {
            return Ok(());
        }
        self.tx
            .send(routed.clone())
            .await
            .map_err(|_| TransportError::Publish {
                run_id: routed.message.run_id.clone(),
                state: routed.message.state,
                reason: "engine dispatcher stopped".into(),
            })
    }
}

/// Drives a [`JobEngine`] from the engine queue.
pub struct EngineDispatcher {
    engine: Arc<dyn JobEngine>,
    handles: DashMap<String, RunHandle>,
    status: ChannelIngress<StatusUpdate>,
}

impl EngineDispatcher {
    pub fn new(engine: Arc<dyn JobEngine>, status: ChannelIngress<StatusUpdate>) -> Self {
        Self {
            engine,
            handles: DashMap::new(),
            status,
        }
    }

    /// Number of runs with a live engine handle.
    pub fn active(&self) -> usize {
        self.handles.len()
    }

    /// React to one accepted message.
    pub async fn dispatch(&self, routed: &Routed) {
        let msg = &routed.message;
        match (routed.route, msg.state) {
            (Route::Engine, RunState::Initializing) => {
                match self.engine.submit(&RunParams::from(msg)).await {
                    Ok(handle) => {
                        info!(run_id = %msg.run_id, engine_id = %handle.engine_id, "run submitted");
                        self.handles.insert(msg.run_id.clone(), handle);
                    }
                    Err(e) => self.report_failure(&msg.run_id, e).await,
                }
            }
            (Route::Engine, RunState::Canceling) => {
                let handle = self.handles.get(&msg.run_id).map(|h| h.value().clone());
                let result = match handle {
                    Some(handle) => self.engine.cancel(&handle).await,
                    None => Err(EngineError::UnknownHandle {
                        run_id: msg.run_id.clone(),
                    }),
                };
                match result {
                    Ok(()) => info!(run_id = %msg.run_id, "cancel requested"),
                    Err(e) => self.report_failure(&msg.run_id, e).await,
                }
            }
            (Route::Notification, _) => {
                if self.handles.remove(&msg.run_id).is_some() {
                    debug!(run_id = %msg.run_id, state = %msg.state, "engine handle released");
                }
            }
            _ => {}
        }
    }

    /// Feed a `SYSTEM_ERROR` back through the status stream. Sent from its
    /// own task: the status stream may be waiting on the engine queue.
    async fn report_failure(&self, run_id: &str, err: EngineError) {
        error!(run_id, error = %err, "engine call failed");
        self.handles.remove(run_id);
        let status = self.status.clone();
        let update = StatusUpdate::new(run_id, RunState::SystemError);
        tokio::spawn(async move {
            let run_id = update.run_id.clone();
            if let Err(e) = status.send(update).await {
                warn!(run_id = %run_id, error = %e, "could not report engine failure");
            }
        });
    }

    /// Consume the engine queue until `cancel` fires or every sink is gone.
    pub fn spawn(self, mut rx: mpsc::Receiver<Routed>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let routed = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(routed) => routed,
                        None => break,
                    },
                };
                self.dispatch(&routed).await;
            }
            debug!("engine dispatcher stopped");
        })
    }
}
