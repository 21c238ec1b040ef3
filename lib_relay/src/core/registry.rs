//! # Subscription Registry
//!
//! Maps live subscriptions to their topic selector and outbound queue.
//!
//! Every mutation and every point-in-time read goes through one
//! `std::sync::Mutex`. Critical sections are a map insert, a map remove, or
//! a clone of the entries, so the lock is never held across an `.await` and
//! contention stays negligible. The delivery engine iterates over the copy
//! returned by [`Registry::snapshot_of_all`], never over the live map.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::core::model::{Payload, TopicSelector};

/// Opaque, never-reused identifier of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Numeric id, increasing in registration order.
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// # Subscription
///
/// One connection's binding to a selector. The registry owns the only
/// long-lived copy; clones handed out by [`Registry::snapshot_of_all`] are
/// meant to live for a single delivery pass.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Registry key.
    pub handle: SubscriptionHandle,
    /// Remote peer description, for logs.
    pub peer: String,
    /// The selector bound at registration.
    pub selector: TopicSelector,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
    outbound: mpsc::Sender<Payload>,
}

impl Subscription {
    /// Sending half of the connection's outbound queue.
    pub fn outbound(&self) -> &mpsc::Sender<Payload> {
        &self.outbound
    }
}

/// # Registry
pub struct Registry {
    entries: Mutex<BTreeMap<SubscriptionHandle, Subscription>>,
    next_id: AtomicU64,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds a subscription and returns its handle.
    pub fn register(
        &self,
        peer: impl Into<String>,
        selector: TopicSelector,
        outbound: mpsc::Sender<Payload>,
    ) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Subscription {
            handle,
            peer: peer.into(),
            selector,
            registered_at: Utc::now(),
            outbound,
        };
        tracing::info!(
            subscription = %handle,
            peer = %subscription.peer,
            selector = %subscription.selector,
            "subscription registered"
        );
        self.entries().insert(handle, subscription);
        handle
    }

    /// Removes `handle`. Removing an absent handle is a no-op; returns
    /// whether something was removed.
    pub fn unregister(&self, handle: SubscriptionHandle) -> bool {
        let removed = self.entries().remove(&handle);
        match removed {
            Some(subscription) => {
                tracing::info!(subscription = %handle, peer = %subscription.peer, "subscription removed");
                true
            }
            None => false,
        }
    }

    /// A copy of every subscription, in registration order.
    pub fn snapshot_of_all(&self) -> Vec<Subscription> {
        self.entries().values().cloned().collect()
    }

    /// A copy of one subscription.
    pub fn get(&self, handle: SubscriptionHandle) -> Option<Subscription> {
        self.entries().get(&handle).cloned()
    }

    /// `true` if `handle` is still registered.
    pub fn contains(&self, handle: SubscriptionHandle) -> bool {
        self.entries().contains_key(&handle)
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// `true` with no subscribers.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    // Each critical section leaves the map consistent, so a poisoned lock
    // still guards valid data.
    fn entries(&self) -> MutexGuard<'_, BTreeMap<SubscriptionHandle, Subscription>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn queue() -> mpsc::Sender<Payload> {
        mpsc::channel(4).0
    }

    #[test]
    fn test_register_and_enumerate_in_order() {
        let registry = Registry::new();
        let a = registry.register("a", TopicSelector::topic("G1"), queue());
        let b = registry.register("b", TopicSelector::All, queue());

        let all = registry.snapshot_of_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].handle, a);
        assert_eq!(all[0].selector, TopicSelector::topic("G1"));
        assert_eq!(all[1].handle, b);
        assert!(a.id() < b.id());
    }

    #[test]
    fn test_unregister_is_idempotent_and_targeted() {
        let registry = Registry::new();
        let a = registry.register("a", TopicSelector::All, queue());
        let b = registry.register("b", TopicSelector::All, queue());

        assert!(registry.unregister(a));
        assert!(!registry.unregister(a));
        assert!(!registry.unregister(a));

        assert!(registry.contains(b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = Registry::new();
        let a = registry.register("a", TopicSelector::All, queue());
        let copy = registry.snapshot_of_all();

        registry.unregister(a);
        registry.register("c", TopicSelector::All, queue());

        assert_eq!(copy.len(), 1);
        assert_eq!(copy[0].handle, a);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_unregister_keeps_count() {
        let registry = Arc::new(Registry::new());

        let tasks: Vec<_> = (0..16)
            .map(|task| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let mut kept = Vec::new();
                    for i in 0..100 {
                        let handle = registry.register(format!("{task}-{i}"), TopicSelector::All, queue());
                        if i % 2 == 0 {
                            assert!(registry.unregister(handle));
                        } else {
                            kept.push(handle);
                        }
                        // Enumeration while others mutate must stay consistent.
                        let _ = registry.snapshot_of_all();
                    }
                    kept
                })
            })
            .collect();

        let mut kept = HashSet::new();
        for task in tasks {
            for handle in task.await.unwrap() {
                assert!(kept.insert(handle), "duplicate handle {handle}");
            }
        }

        assert_eq!(registry.len(), 16 * 50);
        let listed: HashSet<_> = registry.snapshot_of_all().into_iter().map(|s| s.handle).collect();
        assert_eq!(listed, kept);
    }
}
