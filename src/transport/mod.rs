//! Message transport contract.
//!
//! The gatekeeper never talks to a broker directly. Inbound messages arrive
//! as [`Delivery`] values pairing a payload with an acknowledgment handle;
//! accepted messages leave through an [`OutputSink`], tagged with the
//! [`Route`] downstream consumers subscribe to.
//!
//! | Module    | Provides                                               |
//! |-----------|--------------------------------------------------------|
//! | `channel` | in-process ingress with awaitable ack receipts         |
//! | `tcp`     | JSON-lines TCP ingress, `ACK n` / `NACK n` replies      |
//! | `sink`    | broadcast, JSON-lines file and fan-out output sinks    |

pub mod channel;
pub mod sink;
pub mod tcp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::TransportError;
use crate::models::{RunMessage, RunState};

/// Which inbound stream a delivery came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Command,
    Status,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Status => "status",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acknowledgment handle supplied by the transport with each delivery.
///
/// `commit` marks the delivery processed; `reject` hands it back to the
/// transport's own drop / dead-letter / redeliver policy.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn commit(&self) -> Result<(), TransportError>;
    async fn reject(&self) -> Result<(), TransportError>;
}

/// A delivered message and its acknowledgment handle.
pub struct Delivery<M> {
    pub payload: M,
    ack: Box<dyn Acknowledge>,
}

impl<M> Delivery<M> {
    pub fn new(payload: M, ack: impl Acknowledge + 'static) -> Self {
        Self {
            payload,
            ack: Box::new(ack),
        }
    }

    pub async fn commit(&self) -> Result<(), TransportError> {
        self.ack.commit().await
    }

    pub async fn reject(&self) -> Result<(), TransportError> {
        self.ack.reject().await
    }
}

impl<M: std::fmt::Debug> std::fmt::Debug for Delivery<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// Downstream consumer group an accepted message is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Job-execution adapter: start or cancel work.
    Engine,
    /// Notification sinks: the run has ended.
    Notification,
    /// Informational state changes.
    Status,
}

impl Route {
    pub fn for_state(state: RunState) -> Self {
        match state {
            RunState::Initializing | RunState::Canceling => Self::Engine,
            s if s.is_terminal() => Self::Notification,
            _ => Self::Status,
        }
    }
}

/// An accepted message with its route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routed {
    pub route: Route,
    pub message: RunMessage,
}

impl Routed {
    pub fn new(message: RunMessage) -> Self {
        Self {
            route: Route::for_state(message.state),
            message,
        }
    }
}

/// Publishes accepted messages downstream. The output channel is never the
/// input channel.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn publish(&self, routed: &Routed) -> Result<(), TransportError>;
}
