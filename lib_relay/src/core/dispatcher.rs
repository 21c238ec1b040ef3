//! # Delivery Engine
//!
//! Fans one [`Snapshot`] out to every registered subscription.
//!
//! A pass works on the registry's point-in-time copy, renders each distinct
//! selector once and hands the shared payload to every subscriber's bounded
//! outbound queue with `try_send`. The pass never awaits a socket, so a slow
//! or dead peer can only hurt itself: a closed or full queue unregisters that
//! one subscription, logs it and moves on. Nothing escapes [`Dispatcher::deliver`].

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;

use crate::core::model::{Payload, Snapshot, TopicSelector};
use crate::core::registry::{Registry, Subscription, SubscriptionHandle};
use crate::core::topic_filter::TopicFilter;

/// Why a payload did not reach one subscriber.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The connection's receiving side is gone.
    #[error("subscriber connection closed")]
    Closed,
    /// The subscriber stopped draining its outbound queue.
    #[error("subscriber outbound queue is full")]
    QueueFull,
    /// The filtered view could not be rendered.
    #[error("failed to serialize payload: {0}")]
    Serialize(String),
}

/// Outcome of one delivery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Revision of the snapshot every subscriber in this pass was sent.
    pub revision: u64,
    /// Subscriptions in the point-in-time list.
    pub attempted: usize,
    /// Payloads accepted by an outbound queue.
    pub delivered: usize,
    /// Subscriptions dropped during the pass.
    pub removed: Vec<SubscriptionHandle>,
}

/// # Dispatcher
pub struct Dispatcher {
    registry: Arc<Registry>,
    filter: TopicFilter,
}

impl Dispatcher {
    /// An engine delivering to the subscriptions in `registry`.
    pub fn new(registry: Arc<Registry>, filter: TopicFilter) -> Self {
        Self { registry, filter }
    }

    /// The projection applied per selector.
    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    /// The registry read on every pass.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Serializes the view of `snapshot` for `selector` as a JSON array.
    /// An empty view renders as `[]`.
    pub fn render(&self, snapshot: &Snapshot, selector: &TopicSelector) -> Result<Payload, DeliveryError> {
        let view = self.filter.filter(snapshot, selector);
        serde_json::to_string(&view)
            .map(Payload::from)
            .map_err(|e| DeliveryError::Serialize(e.to_string()))
    }

    /// One best-effort, at-most-once pass over every subscriber.
    pub fn deliver(&self, snapshot: &Snapshot) -> DeliveryReport {
        let mut report = DeliveryReport {
            revision: snapshot.revision(),
            ..Default::default()
        };

        if self.registry.is_empty() {
            return report;
        }
        let subscriptions = self.registry.snapshot_of_all();
        report.attempted = subscriptions.len();

        let mut rendered: HashMap<&TopicSelector, Result<Payload, DeliveryError>> = HashMap::new();

        for subscription in &subscriptions {
            let payload = rendered
                .entry(&subscription.selector)
                .or_insert_with(|| self.render(snapshot, &subscription.selector));

            let outcome = match payload {
                Ok(payload) => offer(subscription, Arc::clone(payload)),
                Err(e) => Err(e.clone()),
            };

            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    self.drop_subscription(subscription, &e);
                    report.removed.push(subscription.handle);
                }
            }
        }

        tracing::debug!(
            revision = report.revision,
            attempted = report.attempted,
            delivered = report.delivered,
            removed = report.removed.len(),
            selectors = rendered.len(),
            "delivery pass finished"
        );
        report
    }

    /// Sends the current view to one subscriber, outside the regular pass.
    /// Failure removes the subscription just like a failed tick delivery.
    pub fn deliver_to(&self, handle: SubscriptionHandle, snapshot: &Snapshot) -> Result<(), DeliveryError> {
        let subscription = self.registry.get(handle).ok_or(DeliveryError::Closed)?;
        let outcome = self
            .render(snapshot, &subscription.selector)
            .and_then(|payload| offer(&subscription, payload));

        if let Err(e) = &outcome {
            self.drop_subscription(&subscription, e);
        }
        outcome
    }

    fn drop_subscription(&self, subscription: &Subscription, error: &DeliveryError) {
        tracing::warn!(
            subscription = %subscription.handle,
            peer = %subscription.peer,
            error = %error,
            "delivery failed; dropping subscriber"
        );
        self.registry.unregister(subscription.handle);
    }
}

fn offer(subscription: &Subscription, payload: Payload) -> Result<(), DeliveryError> {
    subscription.outbound().try_send(payload).map_err(|e| match e {
        TrySendError::Full(_) => DeliveryError::QueueFull,
        TrySendError::Closed(_) => DeliveryError::Closed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Record;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(Registry::new()), TopicFilter::default())
    }

    fn scenario() -> Snapshot {
        let records = vec![
            Record::try_from(json!({"topic_id": "G1", "score": 10})).unwrap(),
            Record::try_from(json!({"topic_id": "G2", "score": 20})).unwrap(),
        ];
        Snapshot::new(records, 1)
    }

    fn parse(payload: &Payload) -> Value {
        serde_json::from_str(payload).unwrap()
    }

    #[test]
    fn test_empty_registry_is_a_noop() {
        let report = dispatcher().deliver(&scenario());
        assert_eq!(report.attempted, 0);
        assert_eq!(report.delivered, 0);
        assert!(report.removed.is_empty());
        assert_eq!(report.revision, 1);
    }

    #[test]
    fn test_closed_subscriber_does_not_affect_others() {
        let dispatcher = dispatcher();
        let registry = Arc::clone(dispatcher.registry());

        let (dead_tx, dead_rx) = mpsc::channel(4);
        drop(dead_rx);
        let dead = registry.register("dead", TopicSelector::topic("G1"), dead_tx);

        let (live_tx, mut live_rx) = mpsc::channel(4);
        let live = registry.register("live", TopicSelector::topic("G2"), live_tx);

        let report = dispatcher.deliver(&scenario());

        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, vec![dead]);
        assert!(!registry.contains(dead));
        assert!(registry.contains(live));

        let payload = live_rx.try_recv().unwrap();
        assert_eq!(parse(&payload), json!([{"topic_id": "G2", "score": 20}]));
    }

    #[test]
    fn test_full_queue_removes_only_the_laggard() {
        let dispatcher = dispatcher();
        let registry = Arc::clone(dispatcher.registry());

        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let slow = registry.register("slow", TopicSelector::All, slow_tx);
        let (fast_tx, mut fast_rx) = mpsc::channel(1);
        let fast = registry.register("fast", TopicSelector::All, fast_tx);

        let snapshot = scenario();
        dispatcher.deliver(&snapshot);
        fast_rx.try_recv().unwrap();

        let report = dispatcher.deliver(&snapshot);
        assert_eq!(report.removed, vec![slow]);
        assert!(registry.contains(fast));
        assert!(fast_rx.try_recv().is_ok());
    }

    #[test]
    fn test_same_selector_shares_one_payload() {
        let dispatcher = dispatcher();
        let registry = Arc::clone(dispatcher.registry());

        let (a_tx, mut a_rx) = mpsc::channel(1);
        let (b_tx, mut b_rx) = mpsc::channel(1);
        registry.register("a", TopicSelector::topic("G1"), a_tx);
        registry.register("b", TopicSelector::topic("G1"), b_tx);

        dispatcher.deliver(&scenario());

        let a = a_rx.try_recv().unwrap();
        let b = b_rx.try_recv().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unmatched_topic_receives_empty_array() {
        let dispatcher = dispatcher();
        let (tx, mut rx) = mpsc::channel(1);
        dispatcher.registry().register("a", TopicSelector::topic("G404"), tx);

        let report = dispatcher.deliver(&scenario());
        assert_eq!(report.delivered, 1);
        assert_eq!(&*rx.try_recv().unwrap(), "[]");
    }

    #[test]
    fn test_deliver_to_single_subscriber() {
        let dispatcher = dispatcher();
        let registry = Arc::clone(dispatcher.registry());

        let (tx, mut rx) = mpsc::channel(1);
        let handle = registry.register("a", TopicSelector::All, tx);
        let (other_tx, mut other_rx) = mpsc::channel(1);
        registry.register("b", TopicSelector::All, other_tx);

        dispatcher.deliver_to(handle, &scenario()).unwrap();
        assert_eq!(parse(&rx.try_recv().unwrap()).as_array().unwrap().len(), 2);
        assert!(other_rx.try_recv().is_err());

        // Fill the queue; the send after that drops the subscriber.
        dispatcher.deliver_to(handle, &scenario()).unwrap();
        assert_eq!(
            dispatcher.deliver_to(handle, &scenario()),
            Err(DeliveryError::QueueFull)
        );
        assert!(!registry.contains(handle));
        assert_eq!(
            dispatcher.deliver_to(handle, &scenario()),
            Err(DeliveryError::Closed)
        );
    }
}
