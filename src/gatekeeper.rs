//! Gatekeeper service: validates one inbound message against the stored run
//! and the transition policy, and applies it with a version-guarded write.
//!
//! Two entry points because the two inbound streams differ in payload:
//! command messages carry full run metadata and may create a run, status
//! updates carry only `run_id` + `state` and never create one.
//!
//! Rejections are returned as [`Verdict::Rejected`]; only store outages are
//! errors. Nothing is written on rejection.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::errors::{ErrorKind, GatekeeperError, StoreError};
use crate::models::{Run, RunMessage, RunState, StatusUpdate};
use crate::policy;
use crate::store::RunStateStore;

/// Why a message was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The policy has no transition from the stored state.
    InvalidTransition { from: RunState, proposed: RunState },
    /// No stored run, and the message cannot create one.
    UnknownRun,
    /// Another writer advanced the run first.
    VersionConflict,
}

impl Rejection {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::UnknownRun => ErrorKind::UnknownRun,
            Self::VersionConflict => ErrorKind::VersionConflict,
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTransition { from, proposed } => {
                write!(f, "no transition from {} to {}", from, proposed)
            }
            Self::UnknownRun => f.write_str("unknown run"),
            Self::VersionConflict => f.write_str("version conflict"),
        }
    }
}

/// Outcome of validating one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Applied. Carries the message to forward, with the resolved state,
    /// and the stored version it produced (`None` once the run was deleted).
    Accepted {
        message: RunMessage,
        version: Option<u64>,
    },
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn accepted(self) -> Option<RunMessage> {
        match self {
            Self::Accepted { message, .. } => Some(message),
            Self::Rejected(_) => None,
        }
    }
}

/// Result of one read-check-write pass.
enum Attempt {
    Done(Verdict),
    Conflict,
}

/// Orchestrates the transition policy and the run state store.
#[derive(Clone)]
pub struct Gatekeeper {
    store: Arc<dyn RunStateStore>,
    conflict_retries: u32,
}

impl Gatekeeper {
    pub fn new(store: Arc<dyn RunStateStore>) -> Self {
        Self {
            store,
            conflict_retries: 0,
        }
    }

    /// Retry a conflicting write with a fresh read, at most once.
    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries.min(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStateStore> {
        &self.store
    }

    /// Drive a run this gatekeeper just wrote to `SYSTEM_ERROR` by deleting
    /// it at the written version. Returns `false` if another writer has
    /// already moved the run on.
    pub async fn abandon(&self, run_id: &str, version: u64) -> Result<bool, GatekeeperError> {
        match self.store.delete_if_version(run_id, version).await {
            Ok(()) => {
                debug!(run_id, version, "run abandoned as system error");
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(source) => Err(GatekeeperError::StoreUnavailable {
                run_id: run_id.to_string(),
                source,
            }),
        }
    }

    /// Validate a full command message. An unknown run is created when the
    /// message is `QUEUED`; any other state for an unknown run is rejected.
    pub async fn validate_full_message(
        &self,
        msg: &RunMessage,
    ) -> Result<Verdict, GatekeeperError> {
        self.settle(&msg.run_id, || self.attempt_full(msg)).await
    }

    /// Validate a state-only status update. Never creates a run; the
    /// forwarded message is rebuilt from the stored record.
    pub async fn validate_state_only(
        &self,
        update: &StatusUpdate,
    ) -> Result<Verdict, GatekeeperError> {
        self.settle(&update.run_id, || self.attempt_state_only(update))
            .await
    }

    async fn settle<F, Fut>(&self, run_id: &str, attempt: F) -> Result<Verdict, GatekeeperError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Attempt, StoreError>>,
    {
        let mut retries_left = self.conflict_retries;
        loop {
            match attempt().await {
                Ok(Attempt::Done(verdict)) => return Ok(verdict),
                Ok(Attempt::Conflict) if retries_left > 0 => {
                    retries_left -= 1;
                    debug!(run_id, "version conflict, retrying with a fresh read");
                }
                Ok(Attempt::Conflict) => {
                    return Ok(Verdict::Rejected(Rejection::VersionConflict));
                }
                Err(source) => {
                    return Err(GatekeeperError::StoreUnavailable {
                        run_id: run_id.to_string(),
                        source,
                    });
                }
            }
        }
    }

    async fn attempt_full(&self, msg: &RunMessage) -> Result<Attempt, StoreError> {
        match self.store.get(&msg.run_id).await? {
            None if msg.state == RunState::Queued => {
                match self.store.create(Run::from_message(msg)).await {
                    Ok(run) => {
                        debug!(run_id = %run.run_id, version = run.version, "run created");
                        Ok(Attempt::Done(Verdict::Accepted {
                            message: msg.clone(),
                            version: Some(run.version),
                        }))
                    }
                    Err(e) if e.is_conflict() => Ok(Attempt::Conflict),
                    Err(e) => Err(e),
                }
            }
            None => Ok(Attempt::Done(Verdict::Rejected(Rejection::UnknownRun))),
            Some(stored) => {
                self.transition(&stored, msg.state, msg.timestamp, |next| {
                    msg.clone().with_state(next)
                })
                .await
            }
        }
    }

    async fn attempt_state_only(&self, update: &StatusUpdate) -> Result<Attempt, StoreError> {
        match self.store.get(&update.run_id).await? {
            None => Ok(Attempt::Done(Verdict::Rejected(Rejection::UnknownRun))),
            Some(stored) => {
                self.transition(&stored, update.state, update.timestamp, |next| {
                    RunMessage::from_run(&stored, next, update.timestamp)
                })
                .await
            }
        }
    }

    /// Apply the policy to a stored run and commit the result: delete on a
    /// terminal state, update otherwise, both guarded by the read version.
    async fn transition(
        &self,
        stored: &Run,
        proposed: RunState,
        timestamp: chrono::DateTime<chrono::Utc>,
        forward: impl FnOnce(RunState) -> RunMessage,
    ) -> Result<Attempt, StoreError> {
        let Some(next) = policy::next_state(stored.state, proposed) else {
            return Ok(Attempt::Done(Verdict::Rejected(
                Rejection::InvalidTransition {
                    from: stored.state,
                    proposed,
                },
            )));
        };

        let written = if next.is_terminal() {
            self.store
                .delete_if_version(&stored.run_id, stored.version)
                .await
                .map(|_| None)
        } else {
            self.store
                .compare_and_update(
                    &stored.run_id,
                    stored.version,
                    Box::new(move |run| {
                        run.state = next;
                        run.last_updated = timestamp;
                    }),
                )
                .await
                .map(|run| Some(run.version))
        };

        match written {
            Ok(version) => {
                debug!(run_id = %stored.run_id, from = %stored.state, to = %next, "transition applied");
                Ok(Attempt::Done(Verdict::Accepted {
                    message: forward(next),
                    version,
                }))
            }
            Err(e) if e.is_conflict() => Ok(Attempt::Conflict),
            Err(e) => Err(e),
        }
    }
}
