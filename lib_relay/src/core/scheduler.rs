//! # Refresh Scheduler
//!
//! Drives the tick: fetch (or take the ingested batch), publish, deliver.
//!
//! Two states only, `Idle` and `Refreshing`. A timer tick that finds a cycle
//! already running is coalesced (dropped, not queued) so a slow source never
//! accumulates concurrent fetches. Ingestion events wait for the running
//! cycle instead: pushed data must not be lost. Several ingestions queued
//! behind one cycle are merged, the most recent batch wins and every caller
//! gets the resulting revision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::{DeliveryReport, Dispatcher};
use crate::core::model::Record;
use crate::core::snapshot_store::SnapshotStore;
use crate::core::source::{decode_records, DataSource, SourceError};
use crate::core::Relay;

/// Shortest accepted tick interval; `tokio::time::interval` rejects zero.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

/// Observable scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for the next tick or ingestion.
    Idle,
    /// A fetch, publish and delivery pass is in progress.
    Refreshing,
}

impl SchedulerState {
    /// Lowercase name, as reported by `/status`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Refreshing => "refreshing",
        }
    }
}

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// The fixed-interval timer.
    Tick,
    /// A producer pushed a batch.
    Ingest,
}

/// How a cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// A new snapshot was published.
    Refreshed {
        /// Revision assigned by the store.
        revision: u64,
        /// Records in the new snapshot.
        records: usize,
    },
    /// The source reported no change; the current snapshot was redelivered.
    Unchanged,
    /// The source failed; the previous snapshot was kept and redelivered.
    Stale(SourceError),
    /// Another cycle was running; nothing happened.
    Coalesced,
    /// Shutdown interrupted the fetch; nothing was published or delivered.
    Cancelled,
}

/// Summary of one cycle. `delivery` is `None` when no delivery pass ran.
#[derive(Debug)]
pub struct CycleReport {
    /// What started the cycle.
    pub trigger: RefreshTrigger,
    /// How it ended.
    pub outcome: CycleOutcome,
    /// The delivery pass, when one ran.
    pub delivery: Option<DeliveryReport>,
}

impl CycleReport {
    fn skipped(trigger: RefreshTrigger, outcome: CycleOutcome) -> Self {
        Self {
            trigger,
            outcome,
            delivery: None,
        }
    }
}

/// Why an ingestion was not applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    /// The body is neither a record array nor an accepted envelope.
    #[error("malformed ingestion payload: {0}")]
    Malformed(String),

    /// The scheduler has stopped or was never started.
    #[error("refresh scheduler is not running")]
    SchedulerStopped,
}

/// Revision published for the ingestion.
pub type IngestAck = Result<u64, IngestError>;

struct IngestRequest {
    records: Vec<Record>,
    responder: oneshot::Sender<IngestAck>,
}

/// # Ingest Handle
///
/// Cloneable entry point for producers. Each submission is applied by the
/// running scheduler and acknowledged with the published revision.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<IngestRequest>,
}

impl IngestHandle {
    /// Replaces the current snapshot with `records` and delivers it.
    pub async fn submit(&self, records: Vec<Record>) -> IngestAck {
        let (responder, ack) = oneshot::channel();
        self.tx
            .send(IngestRequest { records, responder })
            .await
            .map_err(|_| IngestError::SchedulerStopped)?;
        ack.await.map_err(|_| IngestError::SchedulerStopped)?
    }

    /// Decodes a producer body (envelope or bare array) and submits it.
    pub async fn submit_json(&self, body: &[u8]) -> IngestAck {
        let records = decode_records(body).map_err(|e| IngestError::Malformed(e.to_string()))?;
        self.submit(records).await
    }
}

/// Raised for the duration of a cycle.
struct RefreshingFlag<'a>(&'a AtomicBool);

impl<'a> RefreshingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for RefreshingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The ingest receiver while `run` owns it. However `run` ends (shutdown,
/// panic, or its task being aborted) the queue is closed and every pending
/// submitter is answered, so no caller waits on a dead scheduler.
struct IngestQueue<'a>(MutexGuard<'a, mpsc::Receiver<IngestRequest>>);

impl Drop for IngestQueue<'_> {
    fn drop(&mut self) {
        self.0.close();
        while let Ok(pending) = self.0.try_recv() {
            let _ = pending.responder.send(Err(IngestError::SchedulerStopped));
        }
    }
}

/// # Refresh Scheduler
pub struct RefreshScheduler {
    store: Arc<SnapshotStore>,
    dispatcher: Arc<Dispatcher>,
    source: Arc<dyn DataSource>,
    interval: Duration,
    fetch_timeout: Duration,
    cycle: Mutex<()>,
    refreshing: AtomicBool,
    ingest_tx: mpsc::Sender<IngestRequest>,
    ingest_rx: Mutex<mpsc::Receiver<IngestRequest>>,
}

impl RefreshScheduler {
    /// Builds the scheduler for `relay`. Intervals below
    /// [`MIN_REFRESH_INTERVAL`] are raised to it.
    pub fn new(relay: &Relay, source: Arc<dyn DataSource>) -> Self {
        let settings = relay.settings();
        let (ingest_tx, ingest_rx) = mpsc::channel(settings.ingest_queue_capacity.max(1));
        if settings.refresh_interval < MIN_REFRESH_INTERVAL {
            tracing::warn!(
                requested_ms = settings.refresh_interval.as_millis() as u64,
                "refresh interval too short; using the minimum"
            );
        }
        Self {
            store: Arc::clone(relay.store()),
            dispatcher: Arc::clone(relay.dispatcher()),
            source,
            interval: settings.refresh_interval.max(MIN_REFRESH_INTERVAL),
            fetch_timeout: settings.fetch_timeout,
            cycle: Mutex::new(()),
            refreshing: AtomicBool::new(false),
            ingest_tx,
            ingest_rx: Mutex::new(ingest_rx),
        }
    }

    /// A handle producers use to push snapshots.
    pub fn ingest_handle(&self) -> IngestHandle {
        IngestHandle {
            tx: self.ingest_tx.clone(),
        }
    }

    /// `Refreshing` while a cycle or an ingestion holds the cycle lock.
    pub fn state(&self) -> SchedulerState {
        if self.refreshing.load(Ordering::Acquire) {
            SchedulerState::Refreshing
        } else {
            SchedulerState::Idle
        }
    }

    /// Name of the configured data source.
    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// One timer-driven cycle. Returns `Coalesced` at once if a cycle is
    /// already running.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> CycleReport {
        let trigger = RefreshTrigger::Tick;
        let Ok(_cycle) = self.cycle.try_lock() else {
            tracing::debug!(source = self.source.name(), "refresh in progress; tick coalesced");
            return CycleReport::skipped(trigger, CycleOutcome::Coalesced);
        };
        let _refreshing = RefreshingFlag::raise(&self.refreshing);

        let fetched = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(source = self.source.name(), "refresh cancelled by shutdown");
                return CycleReport::skipped(trigger, CycleOutcome::Cancelled);
            }
            fetched = self.fetch_bounded() => fetched,
        };

        let (outcome, snapshot) = match fetched {
            Ok(Some(records)) => {
                let snapshot = self.store.publish(records);
                let outcome = CycleOutcome::Refreshed {
                    revision: snapshot.revision(),
                    records: snapshot.len(),
                };
                (outcome, snapshot)
            }
            Ok(None) => (CycleOutcome::Unchanged, self.store.get()),
            Err(e) => {
                tracing::warn!(
                    source = self.source.name(),
                    error = %e,
                    revision = self.store.revision(),
                    "source fetch failed; redelivering last snapshot"
                );
                (CycleOutcome::Stale(e), self.store.get())
            }
        };

        let delivery = self.dispatcher.deliver(&snapshot);
        CycleReport {
            trigger,
            outcome,
            delivery: Some(delivery),
        }
    }

    /// Publishes `records` as the new snapshot and delivers it, waiting for
    /// any running cycle to finish first.
    pub async fn ingest_now(&self, records: Vec<Record>) -> CycleReport {
        let _cycle = self.cycle.lock().await;
        let _refreshing = RefreshingFlag::raise(&self.refreshing);

        let snapshot = self.store.publish(records);
        tracing::info!(
            revision = snapshot.revision(),
            records = snapshot.len(),
            "ingested snapshot published"
        );
        let delivery = self.dispatcher.deliver(&snapshot);
        CycleReport {
            trigger: RefreshTrigger::Ingest,
            outcome: CycleOutcome::Refreshed {
                revision: snapshot.revision(),
                records: snapshot.len(),
            },
            delivery: Some(delivery),
        }
    }

    /// Runs ticks and ingestions until `shutdown` fires. Pending and later
    /// submissions are then answered with [`IngestError::SchedulerStopped`].
    pub async fn run(&self, shutdown: CancellationToken) {
        let Ok(receiver) = self.ingest_rx.try_lock() else {
            tracing::warn!("refresh scheduler is already running");
            return;
        };
        let mut queue = IngestQueue(receiver);
        let ingest_rx = &mut queue.0;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            source = self.source.name(),
            interval_ms = self.interval.as_millis() as u64,
            "refresh scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(first) = ingest_rx.recv() => {
                    let mut batch = vec![first];
                    while let Ok(next) = ingest_rx.try_recv() {
                        batch.push(next);
                    }
                    self.apply_ingest_batch(batch).await;
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle(&shutdown).await;
                    if let Some(delivery) = &report.delivery {
                        tracing::trace!(
                            revision = delivery.revision,
                            delivered = delivery.delivered,
                            "tick complete"
                        );
                    }
                }
            }
        }

        drop(queue);
        tracing::info!(source = self.source.name(), "refresh scheduler stopped");
    }

    async fn apply_ingest_batch(&self, batch: Vec<IngestRequest>) {
        let merged = batch.len();
        let mut responders = Vec::with_capacity(merged);
        let mut latest = Vec::new();
        for request in batch {
            latest = request.records;
            responders.push(request.responder);
        }
        if merged > 1 {
            tracing::debug!(merged, "merged queued ingestions; latest batch wins");
        }

        let report = self.ingest_now(latest).await;
        let revision = match report.outcome {
            CycleOutcome::Refreshed { revision, .. } => revision,
            _ => self.store.revision(),
        };
        for responder in responders {
            let _ = responder.send(Ok(revision));
        }
    }

    /// `Ok(None)` means the source reported no change.
    async fn fetch_bounded(&self) -> Result<Option<Vec<Record>>, SourceError> {
        let attempt = async {
            if !self.source.has_changed().await? {
                return Ok(None);
            }
            self.source.fetch().await.map(Some)
        };
        tokio::time::timeout(self.fetch_timeout, attempt)
            .await
            .map_err(|_| SourceError::Timeout(self.fetch_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Payload, TopicSelector};
    use crate::core::RelaySettings;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    fn scenario() -> Vec<Record> {
        vec![
            Record::try_from(json!({"topic_id": "G1", "score": 10})).unwrap(),
            Record::try_from(json!({"topic_id": "G2", "score": 20})).unwrap(),
        ]
    }

    fn relay() -> Relay {
        Relay::new(RelaySettings {
            refresh_interval: Duration::from_secs(3600),
            fetch_timeout: Duration::from_secs(1),
            ..RelaySettings::default()
        })
    }

    fn subscribe(relay: &Relay, selector: TopicSelector) -> mpsc::Receiver<Payload> {
        let (tx, rx) = mpsc::channel(8);
        relay.registry().register("test", selector, tx);
        rx
    }

    /// Replays scripted fetch results.
    struct ScriptedSource {
        script: std::sync::Mutex<VecDeque<Result<Vec<Record>, SourceError>>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<Record>, SourceError>>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl DataSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch(&self) -> Result<Vec<Record>, SourceError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SourceError::Http("script exhausted".into())))
        }
    }

    /// Blocks in `fetch` until released.
    struct GatedSource {
        gate: Notify,
    }

    #[async_trait]
    impl DataSource for GatedSource {
        fn name(&self) -> &str {
            "gated"
        }

        async fn fetch(&self) -> Result<Vec<Record>, SourceError> {
            self.gate.notified().await;
            Ok(scenario())
        }
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_and_redelivers_snapshot() {
        let relay = relay();
        let source = ScriptedSource::new(vec![
            Ok(scenario()),
            Err(SourceError::Malformed("truncated".into())),
        ]);
        let scheduler = relay.scheduler(source);
        let token = CancellationToken::new();

        let first = scheduler.run_cycle(&token).await;
        assert!(matches!(first.outcome, CycleOutcome::Refreshed { revision: 1, records: 2 }));
        let before = relay.store().get();
        let before_bytes = serde_json::to_vec(before.records()).unwrap();

        let mut rx = subscribe(&relay, TopicSelector::topic("G1"));
        let second = scheduler.run_cycle(&token).await;

        assert!(matches!(second.outcome, CycleOutcome::Stale(SourceError::Malformed(_))));
        let after = relay.store().get();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(serde_json::to_vec(after.records()).unwrap(), before_bytes);
        assert_eq!(second.delivery.unwrap().delivered, 1);
        assert_eq!(&*rx.recv().await.unwrap(), r#"[{"topic_id":"G1","score":10}]"#);
    }

    #[tokio::test]
    async fn test_unchanged_ticks_redeliver_identical_payloads() {
        let relay = relay();
        relay.store().publish(scenario());
        let scheduler = relay.scheduler(Arc::new(crate::core::source::IngestOnlySource));
        let mut rx = subscribe(&relay, TopicSelector::topic("G1"));
        let token = CancellationToken::new();

        for _ in 0..2 {
            let report = scheduler.run_cycle(&token).await;
            assert!(matches!(report.outcome, CycleOutcome::Unchanged));
        }
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(relay.store().revision(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_tick_is_coalesced() {
        let relay = relay();
        let source = Arc::new(GatedSource { gate: Notify::new() });
        let scheduler = Arc::new(relay.scheduler(source.clone()));
        let token = CancellationToken::new();

        let running = {
            let scheduler = Arc::clone(&scheduler);
            let token = token.clone();
            tokio::spawn(async move { scheduler.run_cycle(&token).await })
        };
        while scheduler.state() != SchedulerState::Refreshing {
            tokio::task::yield_now().await;
        }

        let overlapping = scheduler.run_cycle(&token).await;
        assert!(matches!(overlapping.outcome, CycleOutcome::Coalesced));
        assert!(overlapping.delivery.is_none());

        source.gate.notify_one();
        let finished = running.await.unwrap();
        assert!(matches!(finished.outcome, CycleOutcome::Refreshed { revision: 1, .. }));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out_as_stale() {
        let relay = relay();
        let source = Arc::new(GatedSource { gate: Notify::new() });
        let scheduler = relay.scheduler(source);

        let report = scheduler.run_cycle(&CancellationToken::new()).await;
        assert!(matches!(report.outcome, CycleOutcome::Stale(SourceError::Timeout(_))));
        assert_eq!(relay.store().revision(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_inflight_fetch() {
        let relay = relay();
        let scheduler = relay.scheduler(Arc::new(GatedSource { gate: Notify::new() }));
        let token = CancellationToken::new();
        token.cancel();

        let report = scheduler.run_cycle(&token).await;
        assert!(matches!(report.outcome, CycleOutcome::Cancelled));
        assert_eq!(relay.store().revision(), 0);
    }

    #[tokio::test]
    async fn test_ingest_is_published_delivered_and_acked() {
        let relay = relay();
        let scheduler = Arc::new(relay.scheduler(Arc::new(crate::core::source::IngestOnlySource)));
        let mut rx = subscribe(&relay, TopicSelector::All);
        let token = CancellationToken::new();

        let runner = {
            let scheduler = Arc::clone(&scheduler);
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };

        let ingest = scheduler.ingest_handle();
        let revision = ingest
            .submit_json(br#"{"predictions":[{"topic_id":"G1","score":10},{"topic_id":"G2","score":20}]}"#)
            .await
            .unwrap();
        assert_eq!(revision, 1);

        // The first interval tick may land before or after the ingestion.
        let mut last = rx.recv().await.unwrap();
        while let Ok(next) = rx.try_recv() {
            last = next;
        }
        let delivered: serde_json::Value = serde_json::from_str(&last).unwrap();
        assert_eq!(delivered.as_array().unwrap().len(), 2);

        assert!(matches!(
            ingest.submit_json(br#"{"nope":1}"#).await,
            Err(IngestError::Malformed(_))
        ));
        assert_eq!(relay.store().revision(), 1);

        token.cancel();
        runner.await.unwrap();
        assert_eq!(ingest.submit(scenario()).await, Err(IngestError::SchedulerStopped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ingest_during_slow_tick_waits_then_publishes() {
        let relay = relay();
        let source = Arc::new(GatedSource { gate: Notify::new() });
        let scheduler = Arc::new(relay.scheduler(source.clone()));
        let token = CancellationToken::new();

        let tick = {
            let scheduler = Arc::clone(&scheduler);
            let token = token.clone();
            tokio::spawn(async move { scheduler.run_cycle(&token).await })
        };
        while scheduler.state() != SchedulerState::Refreshing {
            tokio::task::yield_now().await;
        }

        let pushed = vec![Record::try_from(json!({"topic_id": "G9", "score": 99})).unwrap()];
        let ingest = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.ingest_now(pushed).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ingest.is_finished());
        assert_eq!(relay.store().revision(), 0);

        source.gate.notify_one();
        let tick = tick.await.unwrap();
        assert!(matches!(tick.outcome, CycleOutcome::Refreshed { revision: 1, .. }));

        let ingested = ingest.await.unwrap();
        assert_eq!(ingested.trigger, RefreshTrigger::Ingest);
        assert!(matches!(ingested.outcome, CycleOutcome::Refreshed { revision: 2, records: 1 }));
        let snapshot = relay.store().get();
        assert_eq!(snapshot.revision(), 2);
        assert_eq!(snapshot.records()[0].get("topic_id"), Some(&json!("G9")));
    }

    #[tokio::test]
    async fn test_zero_interval_is_raised_to_minimum() {
        let relay = Relay::new(RelaySettings {
            refresh_interval: Duration::ZERO,
            ..RelaySettings::default()
        });
        let scheduler = Arc::new(relay.scheduler(Arc::new(crate::core::source::IngestOnlySource)));
        let token = CancellationToken::new();
        let runner = {
            let scheduler = Arc::clone(&scheduler);
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };

        let ack = tokio::time::timeout(Duration::from_secs(5), scheduler.ingest_handle().submit(scenario()))
            .await
            .unwrap();
        assert_eq!(ack, Ok(1));

        token.cancel();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_aborted_runner_answers_submitters() {
        let relay = relay();
        let scheduler = Arc::new(relay.scheduler(Arc::new(crate::core::source::IngestOnlySource)));
        let ingest = scheduler.ingest_handle();

        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run(CancellationToken::new()).await })
        };
        assert_eq!(ingest.submit(scenario()).await, Ok(1));

        runner.abort();
        assert!(runner.await.unwrap_err().is_cancelled());

        let ack = tokio::time::timeout(Duration::from_secs(5), ingest.submit(scenario()))
            .await
            .unwrap();
        assert_eq!(ack, Err(IngestError::SchedulerStopped));
    }

    #[tokio::test]
    async fn test_queued_ingestions_merge_latest_wins() {
        let relay = relay();
        let scheduler = Arc::new(relay.scheduler(Arc::new(crate::core::source::IngestOnlySource)));
        let ingest = scheduler.ingest_handle();

        let mut acks = Vec::new();
        for score in [1, 2, 3] {
            let (responder, ack) = oneshot::channel();
            let records = vec![Record::try_from(json!({"topic_id": "G1", "score": score})).unwrap()];
            ingest.tx.send(IngestRequest { records, responder }).await.unwrap();
            acks.push(ack);
        }

        let token = CancellationToken::new();
        let runner = {
            let scheduler = Arc::clone(&scheduler);
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };

        for ack in acks {
            assert_eq!(ack.await.unwrap(), Ok(1));
        }
        let snapshot = relay.store().get();
        assert_eq!(snapshot.records()[0].get("score"), Some(&json!(3)));

        token.cancel();
        runner.await.unwrap();
    }
}
