use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, broadcast};

use super::{OutputSink, Routed};
use crate::errors::TransportError;

/// Fans accepted messages out to in-process subscribers.
///
/// Publishing with no subscribers is not an error.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Routed>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Routed> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl OutputSink for BroadcastSink {
    async fn publish(&self, routed: &Routed) -> Result<(), TransportError> {
        let _ = self.tx.send(routed.clone());
        Ok(())
    }
}

/// Appends each accepted message as one JSON line.
pub struct JsonlSink {
    file: Mutex<tokio::fs::File>,
}

impl JsonlSink {
    pub async fn open(path: &Path) -> Result<Self, TransportError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl OutputSink for JsonlSink {
    async fn publish(&self, routed: &Routed) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(routed)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Publishes to every inner sink. All sinks are attempted; the first
/// failure is returned.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn OutputSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl OutputSink for FanoutSink {
    async fn publish(&self, routed: &Routed) -> Result<(), TransportError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(routed).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunMessage, RunState};
    use crate::transport::Route;

    fn routed(state: RunState) -> Routed {
        Routed::new(RunMessage::bare("r1", state, chrono::Utc::now()))
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.publish(&routed(RunState::Initializing)).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.route, Route::Engine);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_ok() {
        let sink = BroadcastSink::new(8);
        assert!(sink.publish(&routed(RunState::Running)).await.is_ok());
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/accepted.jsonl");
        let sink = JsonlSink::open(&path).await.unwrap();
        sink.publish(&routed(RunState::Queued)).await.unwrap();
        sink.publish(&routed(RunState::Complete)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Routed> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].route, Route::Notification);
        assert_eq!(lines[1].message.state, RunState::Complete);
    }

    struct FailingSink;

    #[async_trait]
    impl OutputSink for FailingSink {
        async fn publish(&self, routed: &Routed) -> Result<(), TransportError> {
            Err(TransportError::Publish {
                run_id: routed.message.run_id.clone(),
                state: routed.message.state,
                reason: "broker down".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_fanout_tries_every_sink() {
        let broadcast = BroadcastSink::new(8);
        let mut rx = broadcast.subscribe();
        let fanout = FanoutSink::new()
            .with(Arc::new(FailingSink))
            .with(Arc::new(broadcast.clone()));

        let err = fanout.publish(&routed(RunState::Running)).await.unwrap_err();
        assert!(matches!(err, TransportError::Publish { .. }));
        assert!(rx.recv().await.is_ok());
    }
}
