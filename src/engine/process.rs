//! Engine adapter that runs one shell command per run.
//!
//! The command runs under `sh -c` with the run described in `GATEKEEPER_*`
//! environment variables and as JSON on stdin. Progress is reported on the
//! status stream: `RUNNING` once spawned, then `COMPLETE` or
//! `EXECUTOR_ERROR` on exit, or `CANCELED` after [`JobEngine::cancel`].

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{JobEngine, RunHandle, RunParams};
use crate::errors::EngineError;
use crate::models::{RunState, StatusUpdate};
use crate::transport::channel::{AckOutcome, ChannelIngress};

pub struct ProcessEngine {
    command: String,
    status: ChannelIngress<StatusUpdate>,
    running: Arc<DashMap<String, CancellationToken>>,
}

impl ProcessEngine {
    pub fn new(command: impl Into<String>, status: ChannelIngress<StatusUpdate>) -> Self {
        Self {
            command: command.into(),
            status,
            running: Arc::new(DashMap::new()),
        }
    }

    /// Number of child processes still running.
    pub fn running(&self) -> usize {
        self.running.len()
    }
}

/// Send one status update and wait until the processor has decided on it.
async fn report(
    status: &ChannelIngress<StatusUpdate>,
    run_id: &str,
    state: RunState,
) -> Option<AckOutcome> {
    match status.send(StatusUpdate::new(run_id, state)).await {
        Ok(receipt) => receipt.outcome().await,
        Err(e) => {
            warn!(run_id, %state, error = %e, "status report failed");
            None
        }
    }
}

#[async_trait]
impl JobEngine for ProcessEngine {
    async fn submit(&self, params: &RunParams) -> Result<RunHandle, EngineError> {
        let submit_failed = |reason: String| EngineError::SubmitFailed {
            run_id: params.run_id.clone(),
            reason,
        };

        let payload = serde_json::to_vec(params).map_err(|e| submit_failed(e.to_string()))?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .env("GATEKEEPER_RUN_ID", &params.run_id)
            .env("GATEKEEPER_WORKFLOW_URL", &params.workflow_url)
            .env("GATEKEEPER_WORKFLOW_TYPE", &params.workflow_type)
            .env("GATEKEEPER_WORKFLOW_TYPE_VERSION", &params.workflow_type_version)
            .env(
                "GATEKEEPER_REVISION",
                params.engine_params.revision.as_deref().unwrap_or(""),
            )
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| submit_failed(format!("spawn `{}`: {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                // Commands that never read stdin may already have exited.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(run_id = %params.run_id, "run command closed stdin early");
                }
                Err(e) => return Err(submit_failed(format!("write params: {}", e))),
            }
        }

        let engine_id = child
            .id()
            .map(|pid| format!("pid-{}", pid))
            .unwrap_or_else(|| format!("run-{}", uuid::Uuid::new_v4()));
        let cancel = CancellationToken::new();
        self.running.insert(params.run_id.clone(), cancel.clone());

        let run_id = params.run_id.clone();
        let status = self.status.clone();
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            // RUNNING must be settled before the exit report races it.
            report(&status, &run_id, RunState::Running).await;

            let final_state = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(run_id = %run_id, error = %e, "kill failed");
                    }
                    RunState::Canceled
                }
                exit = child.wait() => match exit {
                    Ok(code) if code.success() => RunState::Complete,
                    Ok(code) => {
                        info!(run_id = %run_id, code = ?code.code(), "run exited with failure");
                        RunState::ExecutorError
                    }
                    Err(e) => {
                        warn!(run_id = %run_id, error = %e, "wait on run failed");
                        RunState::ExecutorError
                    }
                },
            };
            running.remove(&run_id);
            let outcome = report(&status, &run_id, final_state).await;
            debug!(run_id = %run_id, state = %final_state, ?outcome, "run finished");
        });

        Ok(RunHandle {
            run_id: params.run_id.clone(),
            engine_id,
        })
    }

    async fn cancel(&self, handle: &RunHandle) -> Result<(), EngineError> {
        match self.running.get(&handle.run_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(EngineError::CancelFailed {
                run_id: handle.run_id.clone(),
                reason: format!("{} is not running", handle.engine_id),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EngineParams;
    use crate::transport::channel;
    use futures::StreamExt;

    fn params(run_id: &str) -> RunParams {
        RunParams {
            run_id: run_id.into(),
            workflow_url: "https://example.com/wf".into(),
            workflow_type: "NEXTFLOW".into(),
            workflow_type_version: "23.04".into(),
            params_blob: "{}".into(),
            engine_params: EngineParams::default(),
        }
    }

    #[tokio::test]
    async fn test_successful_command_reports_running_then_complete() {
        let (status, mut stream) = channel::channel(4);
        let engine = ProcessEngine::new("test \"$GATEKEEPER_RUN_ID\" = r1", status);

        let handle = engine.submit(&params("r1")).await.unwrap();
        assert_eq!(handle.run_id, "r1");

        let running = stream.next().await.unwrap();
        assert_eq!(running.payload.state, RunState::Running);
        running.commit().await.unwrap();

        let done = stream.next().await.unwrap();
        assert_eq!(done.payload.state, RunState::Complete);
        done.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_command_reports_executor_error() {
        let (status, mut stream) = channel::channel(4);
        let engine = ProcessEngine::new("exit 3", status);
        engine.submit(&params("r1")).await.unwrap();

        stream.next().await.unwrap().commit().await.unwrap();
        let done = stream.next().await.unwrap();
        assert_eq!(done.payload.state, RunState::ExecutorError);
    }

    #[tokio::test]
    async fn test_cancel_kills_child_and_reports_canceled() {
        let (status, mut stream) = channel::channel(4);
        let engine = ProcessEngine::new("sleep 30", status);
        let handle = engine.submit(&params("r1")).await.unwrap();

        stream.next().await.unwrap().commit().await.unwrap();
        engine.cancel(&handle).await.unwrap();

        let done = stream.next().await.unwrap();
        assert_eq!(done.payload.state, RunState::Canceled);
        assert_eq!(engine.running(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_run_fails() {
        let (status, _stream) = channel::channel(4);
        let engine = ProcessEngine::new("true", status);
        let handle = RunHandle {
            run_id: "nope".into(),
            engine_id: "pid-1".into(),
        };
        assert!(matches!(
            engine.cancel(&handle).await,
            Err(EngineError::CancelFailed { .. })
        ));
    }
}
