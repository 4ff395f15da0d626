//! Shared run types: the state enumeration, the persisted `Run` record and
//! the two inbound message shapes (full command messages and state-only
//! status updates).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Unknown,
    Queued,
    Initializing,
    Running,
    Canceling,
    Canceled,
    Complete,
    ExecutorError,
    SystemError,
}

impl RunState {
    pub const ALL: [RunState; 9] = [
        Self::Unknown,
        Self::Queued,
        Self::Initializing,
        Self::Running,
        Self::Canceling,
        Self::Canceled,
        Self::Complete,
        Self::ExecutorError,
        Self::SystemError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Queued => "QUEUED",
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
            Self::Complete => "COMPLETE",
            Self::ExecutorError => "EXECUTOR_ERROR",
            Self::SystemError => "SYSTEM_ERROR",
        }
    }

    /// Terminal states end a run; the stored record is deleted on entry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::Complete | Self::ExecutorError | Self::SystemError
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| format!("Invalid run state: {}", s))
    }
}

/// Engine launch parameters carried with the initial command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineParams {
    #[serde(default)]
    pub container_override: Vec<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub resume_id: Option<String>,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub launch_dir: Option<String>,
    #[serde(default)]
    pub project_dir: Option<String>,
}

/// A tracked, non-terminal run as persisted in the run state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: String,
    pub workflow_url: String,
    pub workflow_type: String,
    pub workflow_type_version: String,
    pub params_blob: String,
    pub engine_params: EngineParams,
    pub state: RunState,
    pub last_updated: DateTime<Utc>,
    pub version: u64,
}

impl Run {
    /// Build a new record from a full command message. The store assigns the
    /// final version on create.
    pub fn from_message(msg: &RunMessage) -> Self {
        Self {
            run_id: msg.run_id.clone(),
            workflow_url: msg.workflow_url.clone(),
            workflow_type: msg.workflow_type.clone(),
            workflow_type_version: msg.workflow_type_version.clone(),
            params_blob: msg.params_blob.clone(),
            engine_params: msg.engine_params.clone(),
            state: msg.state,
            last_updated: msg.timestamp,
            version: 0,
        }
    }
}

/// Full command message: the shape of the command input stream and of
/// every message published downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMessage {
    pub run_id: String,
    pub state: RunState,
    #[serde(default)]
    pub workflow_url: String,
    #[serde(default)]
    pub workflow_type: String,
    #[serde(default)]
    pub workflow_type_version: String,
    #[serde(default)]
    pub params_blob: String,
    #[serde(default)]
    pub engine_params: EngineParams,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl RunMessage {
    /// Synthesize a message from a stored run and a newly resolved state.
    pub fn from_run(run: &Run, state: RunState, timestamp: DateTime<Utc>) -> Self {
        Self {
            run_id: run.run_id.clone(),
            state,
            workflow_url: run.workflow_url.clone(),
            workflow_type: run.workflow_type.clone(),
            workflow_type_version: run.workflow_type_version.clone(),
            params_blob: run.params_blob.clone(),
            engine_params: run.engine_params.clone(),
            timestamp,
        }
    }

    /// Same message carrying a different state.
    pub fn with_state(mut self, state: RunState) -> Self {
        self.state = state;
        self
    }

    /// Minimal message used for system-error notifications when nothing but
    /// the run id is known.
    pub fn bare(run_id: &str, state: RunState, timestamp: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            state,
            workflow_url: String::new(),
            workflow_type: String::new(),
            workflow_type_version: String::new(),
            params_blob: String::new(),
            engine_params: EngineParams::default(),
            timestamp,
        }
    }
}

/// State-only update from the externally reported status stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub run_id: String,
    pub state: RunState,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(run_id: impl Into<String>, state: RunState) -> Self {
        Self {
            run_id: run_id.into(),
            state,
            timestamp: Utc::now(),
        }
    }
}

/// A message that belongs to exactly one run.
pub trait RunScoped {
    fn run_id(&self) -> &str;
}

impl RunScoped for RunMessage {
    fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl RunScoped for StatusUpdate {
    fn run_id(&self) -> &str {
        &self.run_id
    }
}
