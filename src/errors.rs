//! Typed error hierarchy for the gatekeeper.
//!
//! - `StoreError`: run state store failures (conflicts, missing rows, I/O)
//! - `GatekeeperError`: failures that escape validation (store unavailable)
//! - `TransportError`: acknowledgment and publish failures
//! - `EngineError`: job-execution collaborator failures
//!
//! `ErrorKind` is the closed classification used for logging severity and
//! for the HTTP status mapping.

use thiserror::Error;

use crate::models::RunState;

/// Errors from a run state store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run {run_id} already exists")]
    AlreadyExists { run_id: String },

    #[error("Version conflict on run {run_id}: expected {expected}, found {found:?}")]
    Conflict {
        run_id: String,
        expected: u64,
        /// Stored version at the time of the write, `None` if the row is gone.
        found: Option<u64>,
    },

    #[error("Run store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists { .. })
    }
}

/// Errors that escape the gatekeeper service. Rejections are not errors.
#[derive(Debug, Error)]
pub enum GatekeeperError {
    #[error("Store unavailable while validating run {run_id}: {source}")]
    StoreUnavailable {
        run_id: String,
        #[source]
        source: StoreError,
    },
}

/// Errors from the message transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to acknowledge delivery: {0}")]
    Ack(String),

    #[error("Failed to publish {state} for run {run_id}: {reason}")]
    Publish {
        run_id: String,
        state: RunState,
        reason: String,
    },

    #[error("Malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the job-execution collaborator.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to submit run {run_id}: {reason}")]
    SubmitFailed { run_id: String, reason: String },

    #[error("Failed to cancel run {run_id}: {reason}")]
    CancelFailed { run_id: String, reason: String },

    #[error("No engine handle for run {run_id}")]
    UnknownHandle { run_id: String },
}

/// Closed classification of everything that can go wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidTransition,
    UnknownRun,
    VersionConflict,
    StoreUnavailable,
    NotFound,
    BadRequest,
}

impl ErrorKind {
    /// HTTP status code for this kind.
    pub fn status_code(self) -> u16 {
        match self {
            Self::InvalidTransition => 422,
            Self::UnknownRun => 404,
            Self::VersionConflict => 409,
            Self::StoreUnavailable => 503,
            Self::NotFound => 404,
            Self::BadRequest => 400,
        }
    }

    /// Only store outages warrant operator attention.
    pub fn is_incident(self) -> bool {
        matches!(self, Self::StoreUnavailable)
    }
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyExists { .. } | Self::Conflict { .. } => ErrorKind::VersionConflict,
            Self::Unavailable(_) => ErrorKind::StoreUnavailable,
        }
    }
}

impl GatekeeperError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_conflict_carries_versions() {
        let err = StoreError::Conflict {
            run_id: "run-7".into(),
            expected: 3,
            found: Some(4),
        };
        match &err {
            StoreError::Conflict {
                expected, found, ..
            } => {
                assert_eq!(*expected, 3);
                assert_eq!(*found, Some(4));
            }
            _ => panic!("Expected Conflict"),
        }
        assert!(err.to_string().contains("run-7"));
        assert!(err.is_conflict());
    }

    #[test]
    fn already_exists_counts_as_conflict() {
        let err = StoreError::AlreadyExists {
            run_id: "r".into(),
        };
        assert!(err.is_conflict());
        assert_eq!(err.kind(), ErrorKind::VersionConflict);
    }

    #[test]
    fn unavailable_is_the_only_incident() {
        let err = StoreError::Unavailable(anyhow::anyhow!("disk gone"));
        assert!(!err.is_conflict());
        assert!(err.kind().is_incident());
        for kind in [
            ErrorKind::InvalidTransition,
            ErrorKind::UnknownRun,
            ErrorKind::VersionConflict,
            ErrorKind::NotFound,
            ErrorKind::BadRequest,
        ] {
            assert!(!kind.is_incident());
        }
    }

    #[test]
    fn status_codes_are_total() {
        assert_eq!(ErrorKind::InvalidTransition.status_code(), 422);
        assert_eq!(ErrorKind::UnknownRun.status_code(), 404);
        assert_eq!(ErrorKind::VersionConflict.status_code(), 409);
        assert_eq!(ErrorKind::StoreUnavailable.status_code(), 503);
        assert_eq!(ErrorKind::NotFound.status_code(), 404);
        assert_eq!(ErrorKind::BadRequest.status_code(), 400);
    }

    #[test]
    fn gatekeeper_error_wraps_store_error() {
        let err = GatekeeperError::StoreUnavailable {
            run_id: "r".into(),
            source: StoreError::Unavailable(anyhow::anyhow!("timeout")),
        };
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::AlreadyExists { run_id: "x".into() });
        assert_std_error(&TransportError::Ack("closed".into()));
        assert_std_error(&EngineError::UnknownHandle { run_id: "x".into() });
    }
}
