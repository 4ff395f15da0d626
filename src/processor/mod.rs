//! Stream merge processor.
//!
//! Consumes the command stream (full [`RunMessage`]s) and the status stream
//! (state-only [`StatusUpdate`]s), validates each delivery through the
//! [`Gatekeeper`], publishes accepted messages to one [`OutputSink`] and
//! acknowledges every delivery on the stream it came from.
//!
//! Each stream fans out to a fixed set of worker lanes keyed by `run_id`.
//! Deliveries for one run stay in arrival order on their lane; a slow store
//! round-trip for one run only holds up the runs that hash to the same lane.

pub mod registry;

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{ErrorKind, GatekeeperError};
use crate::gatekeeper::{Gatekeeper, Rejection, Verdict};
use crate::models::{RunMessage, RunScoped, RunState, StatusUpdate};
use crate::transport::{Delivery, OutputSink, Routed, Source};

pub use registry::{ConsumerStatus, ProcessorHandle};

/// Upper bound on worker lanes per stream.
pub const MAX_LANES: usize = 1024;

/// Deliveries buffered per lane before the consumer waits.
const LANE_DEPTH: usize = 8;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted(RunMessage),
    Rejected(Rejection),
    /// Validation or publish failed; the delivery was rejected and a
    /// system-error notification was attempted.
    Failed,
}

/// Running totals, readable without locking.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub errors: u64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Accepted(_) => &self.accepted,
            Outcome::Rejected(_) => &self.rejected,
            Outcome::Failed => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct StreamMergeProcessor {
    gatekeeper: Gatekeeper,
    sink: Arc<dyn OutputSink>,
    lanes: usize,
    stats: Arc<ProcessorStats>,
}

impl StreamMergeProcessor {
    /// `lanes` is the number of deliveries handled concurrently per stream,
    /// clamped to `1..=MAX_LANES`.
    pub fn new(gatekeeper: Gatekeeper, sink: Arc<dyn OutputSink>, lanes: usize) -> Self {
        Self {
            gatekeeper,
            sink,
            lanes: lanes.clamp(1, MAX_LANES),
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        Arc::clone(&self.stats)
    }

    pub fn gatekeeper(&self) -> &Gatekeeper {
        &self.gatekeeper
    }

    /// Validate, publish and acknowledge one command-stream delivery.
    pub async fn handle_command(&self, delivery: Delivery<RunMessage>) -> Outcome {
        let run_id = delivery.payload.run_id.clone();
        let result = self.gatekeeper.validate_full_message(&delivery.payload).await;
        let fallback = || {
            delivery
                .payload
                .clone()
                .with_state(RunState::SystemError)
        };
        self.settle(&delivery, Source::Command, &run_id, result, fallback)
            .await
    }

    /// Validate, publish and acknowledge one status-stream delivery.
    pub async fn handle_status(&self, delivery: Delivery<StatusUpdate>) -> Outcome {
        let run_id = delivery.payload.run_id.clone();
        let result = self.gatekeeper.validate_state_only(&delivery.payload).await;
        let fallback = || RunMessage::bare(&run_id, RunState::SystemError, Utc::now());
        self.settle(&delivery, Source::Status, &run_id, result, fallback)
            .await
    }

    async fn settle<M>(
        &self,
        delivery: &Delivery<M>,
        source: Source,
        run_id: &str,
        result: Result<Verdict, GatekeeperError>,
        system_error: impl FnOnce() -> RunMessage,
    ) -> Outcome {
        let outcome = match result {
            Ok(Verdict::Accepted { message, version }) => {
                let routed = Routed::new(message);
                match self.sink.publish(&routed).await {
                    Ok(()) => {
                        if let Err(e) = delivery.commit().await {
                            warn!(run_id, %source, error = %e, "commit failed after publish");
                        }
                        info!(
                            run_id,
                            %source,
                            state = %routed.message.state,
                            route = ?routed.route,
                            "message accepted"
                        );
                        Outcome::Accepted(routed.message)
                    }
                    Err(e) => {
                        error!(run_id, %source, error = %e, "publish failed for accepted message");
                        if let Some(version) = version {
                            self.abandon(run_id, version).await;
                        }
                        self.fail(delivery, source, run_id, system_error).await
                    }
                }
            }
            Ok(Verdict::Rejected(rejection)) => {
                if let Err(e) = delivery.reject().await {
                    warn!(run_id, %source, error = %e, "reject failed");
                }
                match rejection.kind() {
                    ErrorKind::UnknownRun => {
                        debug!(run_id, %source, reason = %rejection, "message rejected")
                    }
                    _ => info!(run_id, %source, reason = %rejection, "message rejected"),
                }
                Outcome::Rejected(rejection)
            }
            Err(e) => {
                error!(run_id, %source, error = %e, "validation failed");
                self.fail(delivery, source, run_id, system_error).await
            }
        };
        self.stats.record(&outcome);
        outcome
    }

    /// Bring the store in line with the system-error notice that follows.
    async fn abandon(&self, run_id: &str, version: u64) {
        match self.gatekeeper.abandon(run_id, version).await {
            Ok(true) => warn!(run_id, version, "run moved to SYSTEM_ERROR after publish failure"),
            Ok(false) => debug!(run_id, version, "run already moved on, nothing to abandon"),
            Err(e) => error!(run_id, error = %e, "could not abandon run after publish failure"),
        }
    }

    /// Reject the delivery and make one attempt to announce a system error.
    async fn fail<M>(
        &self,
        delivery: &Delivery<M>,
        source: Source,
        run_id: &str,
        system_error: impl FnOnce() -> RunMessage,
    ) -> Outcome {
        if let Err(e) = delivery.reject().await {
            warn!(run_id, %source, error = %e, "reject failed");
        }
        let notice = Routed::new(system_error());
        if let Err(e) = self.sink.publish(&notice).await {
            error!(run_id, %source, error = %e, "system error notification dropped");
        }
        Outcome::Failed
    }

    /// Start consuming both streams. Returns the handle that owns the
    /// consumer tasks.
    pub fn spawn<C, S>(self, commands: C, statuses: S) -> ProcessorHandle
    where
        C: Stream<Item = Delivery<RunMessage>> + Send + Unpin + 'static,
        S: Stream<Item = Delivery<StatusUpdate>> + Send + Unpin + 'static,
    {
        let cancel = CancellationToken::new();
        let mut handle = ProcessorHandle::new(cancel.clone(), self.stats());

        let this = self.clone();
        handle.register(
            Source::Command,
            tokio::spawn(this.consume(commands, cancel.clone(), |p, d| async move {
                p.handle_command(d).await;
            })),
        );
        handle.register(
            Source::Status,
            tokio::spawn(self.consume(statuses, cancel, |p, d| async move {
                p.handle_status(d).await;
            })),
        );
        handle
    }

    async fn consume<M, St, F, Fut>(self, mut stream: St, cancel: CancellationToken, handler: F)
    where
        M: RunScoped + Send + 'static,
        St: Stream<Item = Delivery<M>> + Send + Unpin + 'static,
        F: Fn(StreamMergeProcessor, Delivery<M>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let mut lanes = Vec::with_capacity(self.lanes);
        let mut workers = Vec::with_capacity(self.lanes);
        for _ in 0..self.lanes {
            let (tx, mut rx) = mpsc::channel::<Delivery<M>>(LANE_DEPTH);
            let this = self.clone();
            let handler = Arc::clone(&handler);
            workers.push(tokio::spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    handler(this.clone(), delivery).await;
                }
            }));
            lanes.push(tx);
        }

        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            let lane = &lanes[lane_for(delivery.payload.run_id(), lanes.len())];
            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                sent = lane.send(delivery) => sent,
            };
            if sent.is_err() {
                error!("processor lane closed unexpectedly");
                break;
            }
        }

        // Closing the lanes lets each worker finish what it already holds.
        drop(lanes);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "processor lane panicked");
            }
        }
    }
}

/// Lane index for a run. Stable for the life of the process.
fn lane_for(run_id: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    run_id.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{StoreError, TransportError};
    use crate::models::Run;
    use crate::store::{MemoryRunStore, RunMutation, RunStateStore};
    use crate::transport::channel::{AckOutcome, OneshotAck};
    use crate::transport::sink::BroadcastSink;
    use async_trait::async_trait;

    fn command(run_id: &str, state: RunState) -> RunMessage {
        RunMessage {
            workflow_url: "https://example.com/wf".into(),
            workflow_type: "CWL".into(),
            ..RunMessage::bare(run_id, state, Utc::now())
        }
    }

    fn processor(store: Arc<dyn RunStateStore>) -> (StreamMergeProcessor, BroadcastSink) {
        let sink = BroadcastSink::new(16);
        let p = StreamMergeProcessor::new(Gatekeeper::new(store), Arc::new(sink.clone()), 4);
        (p, sink)
    }

    #[tokio::test]
    async fn test_accepted_command_is_published_then_committed() {
        let (p, sink) = processor(Arc::new(MemoryRunStore::new()));
        let mut rx = sink.subscribe();
        let (ack, receipt) = OneshotAck::pair();

        let outcome = p
            .handle_command(Delivery::new(command("r1", RunState::Queued), ack))
            .await;

        assert!(matches!(outcome, Outcome::Accepted(_)));
        assert_eq!(receipt.outcome().await, Some(AckOutcome::Committed));
        assert_eq!(rx.recv().await.unwrap().message.run_id, "r1");
        assert_eq!(p.stats().snapshot().accepted, 1);
    }

    #[tokio::test]
    async fn test_rejected_status_publishes_nothing() {
        let (p, sink) = processor(Arc::new(MemoryRunStore::new()));
        let mut rx = sink.subscribe();
        let (ack, receipt) = OneshotAck::pair();

        let outcome = p
            .handle_status(Delivery::new(StatusUpdate::new("ghost", RunState::Running), ack))
            .await;

        assert_eq!(outcome, Outcome::Rejected(Rejection::UnknownRun));
        assert_eq!(receipt.outcome().await, Some(AckOutcome::Rejected));
        assert!(rx.try_recv().is_err());
        assert_eq!(p.stats().snapshot().rejected, 1);
    }

    struct DownStore;

    #[async_trait]
    impl RunStateStore for DownStore {
        async fn get(&self, _: &str) -> Result<Option<Run>, StoreError> {
            Err(StoreError::Unavailable(anyhow::anyhow!("connection refused")))
        }
        async fn create(&self, _: Run) -> Result<Run, StoreError> {
            Err(StoreError::Unavailable(anyhow::anyhow!("connection refused")))
        }
        async fn compare_and_update(
            &self,
            _: &str,
            _: u64,
            _: RunMutation,
        ) -> Result<Run, StoreError> {
            Err(StoreError::Unavailable(anyhow::anyhow!("connection refused")))
        }
        async fn delete_if_version(&self, _: &str, _: u64) -> Result<(), StoreError> {
            Err(StoreError::Unavailable(anyhow::anyhow!("connection refused")))
        }
        async fn count(&self) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_store_outage_rejects_and_notifies_system_error() {
        let (p, sink) = processor(Arc::new(DownStore));
        let mut rx = sink.subscribe();
        let (ack, receipt) = OneshotAck::pair();

        let outcome = p
            .handle_status(Delivery::new(StatusUpdate::new("r9", RunState::Running), ack))
            .await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(receipt.outcome().await, Some(AckOutcome::Rejected));
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.message.run_id, "r9");
        assert_eq!(notice.message.state, RunState::SystemError);
        assert_eq!(p.stats().snapshot().errors, 1);
    }

    struct BrokenSink;

    #[async_trait]
    impl OutputSink for BrokenSink {
        async fn publish(&self, routed: &Routed) -> Result<(), TransportError> {
            Err(TransportError::Publish {
                run_id: routed.message.run_id.clone(),
                state: routed.message.state,
                reason: "broker unreachable".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_publish_failure_rejects_delivery() {
        let store: Arc<dyn RunStateStore> = Arc::new(MemoryRunStore::new());
        let p = StreamMergeProcessor::new(
            Gatekeeper::new(Arc::clone(&store)),
            Arc::new(BrokenSink),
            1,
        );
        let (ack, receipt) = OneshotAck::pair();
        let outcome = p
            .handle_command(Delivery::new(command("r1", RunState::Queued), ack))
            .await;
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(receipt.outcome().await, Some(AckOutcome::Rejected));

        // The run is driven to SYSTEM_ERROR, so nothing is left stored.
        assert_eq!(store.get("r1").await.unwrap(), None);

        // Redelivery once the sink recovers starts the run over.
        let (healthy, _sink) = processor(Arc::clone(&store));
        let (ack, receipt) = OneshotAck::pair();
        let outcome = healthy
            .handle_command(Delivery::new(command("r1", RunState::Queued), ack))
            .await;
        assert!(matches!(outcome, Outcome::Accepted(_)));
        assert_eq!(receipt.outcome().await, Some(AckOutcome::Committed));
        assert_eq!(store.get("r1").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_publish_failure_after_update_deletes_at_written_version() {
        let store: Arc<dyn RunStateStore> = Arc::new(MemoryRunStore::new());
        let gk = Gatekeeper::new(Arc::clone(&store));
        gk.validate_full_message(&command("r1", RunState::Queued))
            .await
            .unwrap();

        let p = StreamMergeProcessor::new(gk, Arc::new(BrokenSink), 1);
        let (ack, _receipt) = OneshotAck::pair();
        let outcome = p
            .handle_status(Delivery::new(StatusUpdate::new("r1", RunState::Initializing), ack))
            .await;
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(store.get("r1").await.unwrap(), None);
    }

    #[test]
    fn test_lane_count_is_clamped() {
        let gk = Gatekeeper::new(Arc::new(MemoryRunStore::new()));
        let sink: Arc<dyn OutputSink> = Arc::new(BroadcastSink::new(1));
        assert_eq!(StreamMergeProcessor::new(gk.clone(), Arc::clone(&sink), 0).lanes(), 1);
        assert_eq!(
            StreamMergeProcessor::new(gk, sink, usize::MAX).lanes(),
            MAX_LANES
        );
    }

    #[test]
    fn test_same_run_always_maps_to_one_lane() {
        for lanes in [1, 4, 64] {
            let first = lane_for("run-42", lanes);
            assert!(first < lanes);
            assert_eq!(lane_for("run-42", lanes), first);
        }
    }

    #[tokio::test]
    async fn test_spawned_processor_drains_both_streams() {
        use crate::transport::channel;

        let (p, sink) = processor(Arc::new(MemoryRunStore::new()));
        let mut rx = sink.subscribe();
        let (commands, command_stream) = channel::channel::<RunMessage>(8);
        let (statuses, status_stream) = channel::channel::<StatusUpdate>(8);
        let handle = p.spawn(command_stream, status_stream);
        assert!(handle.is_alive());

        let queued = commands.send(command("r1", RunState::Queued)).await.unwrap();
        assert_eq!(queued.outcome().await, Some(AckOutcome::Committed));
        let init = commands
            .send(command("r1", RunState::Initializing))
            .await
            .unwrap();
        assert_eq!(init.outcome().await, Some(AckOutcome::Committed));
        let running = statuses
            .send(StatusUpdate::new("r1", RunState::Running))
            .await
            .unwrap();
        assert_eq!(running.outcome().await, Some(AckOutcome::Committed));

        let states: Vec<RunState> = vec![
            rx.recv().await.unwrap().message.state,
            rx.recv().await.unwrap().message.state,
            rx.recv().await.unwrap().message.state,
        ];
        assert_eq!(
            states,
            vec![RunState::Queued, RunState::Initializing, RunState::Running]
        );

        handle.shutdown().await;
    }
}
