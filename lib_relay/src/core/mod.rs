//! # Core Relay Engine
//!
//! This module forms the heart of the relay. It aggregates every component
//! that sits between a data source and the subscribers' sockets.
//!
//! ## Core Components:
//!
//! - **`model`**: records, immutable snapshots and topic selectors.
//! - **`snapshot_store`**: holds the latest published snapshot; lock-free
//!   reads, atomic replacement on publish.
//! - **`topic_filter`**: pure projection of a snapshot onto one selector.
//! - **`registry`**: lock-guarded map of live subscriptions.
//! - **`dispatcher`**: the delivery engine. One pass per tick over a
//!   point-in-time copy of the registry, isolating every per-subscriber
//!   failure.
//! - **`source`**: the data source contract and the document decoders.
//! - **`scheduler`**: the refresh state machine (timer ticks and ingestion
//!   events, coalesced, never overlapping).
//! - **`session`**: the per-connection lifecycle (handshake, registration,
//!   drain, close).
//!
//! [`Relay`] bundles the shared pieces so that servers construct them once
//! and hand clones to every task.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Records, snapshots and topic selectors.
pub mod model;
/// Current-snapshot holder with atomic publish.
pub mod snapshot_store;
/// Snapshot projection per topic selector.
pub mod topic_filter;
/// Subscription bookkeeping.
pub mod registry;
/// The delivery engine.
pub mod dispatcher;
/// Data source contract.
pub mod source;
/// Refresh scheduler and ingestion handle.
pub mod scheduler;
/// Connection lifecycle handler.
pub mod session;

use std::sync::Arc;
use std::time::Duration;

// --- Public API Re-exports ---
pub use dispatcher::{DeliveryError, DeliveryReport, Dispatcher};
pub use model::{Payload, Record, Snapshot, TopicSelector, TOPIC_FIELD};
pub use registry::{Registry, Subscription, SubscriptionHandle};
pub use scheduler::{
    CycleOutcome, CycleReport, IngestError, IngestHandle, RefreshScheduler, RefreshTrigger,
    SchedulerState, MIN_REFRESH_INTERVAL,
};
pub use session::{
    serve_connection, CloseReason, Inbound, Outbound, Session, SessionState, SessionSummary,
};
pub use snapshot_store::SnapshotStore;
pub use source::{DataSource, IngestOnlySource, IngestPayload, RowIdRule, SourceError};
pub use topic_filter::{TopicEntry, TopicFilter};

/// # Relay Settings
///
/// Tunables shared by the scheduler, the delivery engine and the sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    /// Record field holding the topic identifier.
    pub topic_field: String,
    /// Record field holding a human-readable topic label.
    pub label_field: String,
    /// Fixed interval between refresh ticks.
    pub refresh_interval: Duration,
    /// Upper bound for one `has_changed` + `fetch` round against the source.
    pub fetch_timeout: Duration,
    /// Capacity of each subscriber's outbound queue.
    pub client_queue_capacity: usize,
    /// How long a new connection may stay silent before it is subscribed
    /// to every topic.
    pub handshake_timeout: Duration,
    /// Interval of server pings on idle connections; `None` disables them.
    pub keepalive_interval: Option<Duration>,
    /// Push the current snapshot right after a subscription is registered.
    pub send_initial_snapshot: bool,
    /// Capacity of the ingestion request queue.
    pub ingest_queue_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            topic_field: TOPIC_FIELD.to_string(),
            label_field: topic_filter::LABEL_FIELD.to_string(),
            refresh_interval: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(5),
            client_queue_capacity: 16,
            handshake_timeout: Duration::from_secs(5),
            keepalive_interval: Some(Duration::from_secs(30)),
            send_initial_snapshot: true,
            ingest_queue_capacity: 32,
        }
    }
}

/// # Relay
///
/// Owns the shared state of one relay process: the snapshot store, the
/// subscription registry and the delivery engine reading both. Cloning is
/// cheap; every clone points at the same state.
#[derive(Clone)]
pub struct Relay {
    store: Arc<SnapshotStore>,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    settings: Arc<RelaySettings>,
}

impl Relay {
    /// Builds an empty relay (no subscribers, revision 0 snapshot).
    pub fn new(settings: RelaySettings) -> Self {
        let store = Arc::new(SnapshotStore::new());
        let registry = Arc::new(Registry::new());
        let filter = TopicFilter::new(settings.topic_field.clone());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), filter));
        Self {
            store,
            registry,
            dispatcher,
            settings: Arc::new(settings),
        }
    }

    /// The snapshot store.
    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// The subscription registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The delivery engine.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The settings this relay was built with.
    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Distinct topics of the current snapshot, in first-seen order.
    pub fn topics(&self) -> Vec<TopicEntry> {
        let snapshot = self.store.get();
        self.dispatcher
            .filter()
            .distinct_topics(&snapshot, &self.settings.label_field)
    }

    /// Builds the refresh scheduler for this relay around `source`.
    pub fn scheduler(&self, source: Arc<dyn DataSource>) -> RefreshScheduler {
        RefreshScheduler::new(self, source)
    }
}
