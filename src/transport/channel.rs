//! In-process transport over tokio channels.
//!
//! Producers hold a [`ChannelIngress`] and get an [`AckReceipt`] per message
//! that resolves once the processor commits or rejects it.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use super::{Acknowledge, Delivery};
use crate::errors::TransportError;

/// Final disposition of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Committed,
    Rejected,
}

/// Acknowledgment handle that reports the outcome over a oneshot channel.
/// Only the first commit/reject counts.
pub struct OneshotAck {
    tx: Mutex<Option<oneshot::Sender<AckOutcome>>>,
}

impl OneshotAck {
    pub fn pair() -> (Self, AckReceipt) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            AckReceipt { rx },
        )
    }

    fn resolve(&self, outcome: AckOutcome) -> Result<(), TransportError> {
        let sender = self
            .tx
            .lock()
            .map_err(|_| TransportError::Ack("ack lock poisoned".into()))?
            .take()
            .ok_or_else(|| TransportError::Ack("delivery already acknowledged".into()))?;
        // The producer may have stopped waiting; the outcome still stands.
        let _ = sender.send(outcome);
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for OneshotAck {
    async fn commit(&self) -> Result<(), TransportError> {
        self.resolve(AckOutcome::Committed)
    }

    async fn reject(&self) -> Result<(), TransportError> {
        self.resolve(AckOutcome::Rejected)
    }
}

/// Awaitable acknowledgment outcome held by the producer.
#[derive(Debug)]
pub struct AckReceipt {
    rx: oneshot::Receiver<AckOutcome>,
}

impl AckReceipt {
    /// `None` if the delivery was dropped without being acknowledged.
    pub async fn outcome(self) -> Option<AckOutcome> {
        self.rx.await.ok()
    }
}

/// Producer side of an in-process stream.
pub struct ChannelIngress<M> {
    tx: mpsc::Sender<Delivery<M>>,
}

impl<M> Clone for ChannelIngress<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Send + 'static> ChannelIngress<M> {
    pub fn from_sender(tx: mpsc::Sender<Delivery<M>>) -> Self {
        Self { tx }
    }

    /// Deliver `payload`, waiting for channel capacity.
    pub async fn send(&self, payload: M) -> Result<AckReceipt, TransportError> {
        let (ack, receipt) = OneshotAck::pair();
        self.tx
            .send(Delivery::new(payload, ack))
            .await
            .map_err(|_| TransportError::Ack("processor input closed".into()))?;
        Ok(receipt)
    }

    /// Raw sender for adapters that bring their own acknowledgment handles.
    pub fn sender(&self) -> mpsc::Sender<Delivery<M>> {
        self.tx.clone()
    }
}

/// Create a bounded in-process stream.
pub fn channel<M: Send + 'static>(
    capacity: usize,
) -> (ChannelIngress<M>, ReceiverStream<Delivery<M>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelIngress::from_sender(tx), ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_commit_resolves_receipt() {
        let (ingress, mut stream) = channel::<String>(4);
        let receipt = ingress.send("hello".to_string()).await.unwrap();

        let delivery = stream.next().await.unwrap();
        assert_eq!(delivery.payload, "hello");
        delivery.commit().await.unwrap();
        assert_eq!(receipt.outcome().await, Some(AckOutcome::Committed));
    }

    #[tokio::test]
    async fn test_second_ack_is_an_error() {
        let (ack, receipt) = OneshotAck::pair();
        ack.reject().await.unwrap();
        assert!(ack.commit().await.is_err());
        assert_eq!(receipt.outcome().await, Some(AckOutcome::Rejected));
    }

    #[tokio::test]
    async fn test_dropped_delivery_has_no_outcome() {
        let (ingress, mut stream) = channel::<u32>(1);
        let receipt = ingress.send(7).await.unwrap();
        drop(stream.next().await);
        assert_eq!(receipt.outcome().await, None);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (ingress, stream) = channel::<u32>(1);
        drop(stream);
        assert!(ingress.send(1).await.is_err());
    }
}
