//! # Snapshot Store
//!
//! Single-writer, many-reader holder of the latest [`Snapshot`].
//!
//! Readers call [`SnapshotStore::get`] and receive an `Arc` to the current
//! snapshot without taking any lock (`arc_swap`). Publishing builds a brand
//! new snapshot and swaps the pointer; readers that already hold the old
//! `Arc` keep it untouched. Nobody can ever observe a half-written dataset.

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;

use crate::core::model::{Record, Snapshot};

/// # Snapshot Store
pub struct SnapshotStore {
    current: ArcSwap<Snapshot>,
    /// Serializes publishers so revisions stay strictly increasing.
    writer: Mutex<()>,
}

impl SnapshotStore {
    /// A store holding the empty revision-0 snapshot.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::empty()),
            writer: Mutex::new(()),
        }
    }

    /// The latest published snapshot. Never blocks.
    pub fn get(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Revision of the latest published snapshot (0 before the first publish).
    pub fn revision(&self) -> u64 {
        self.current.load().revision()
    }

    /// Replaces the current snapshot with one built from `records` and the
    /// next revision, returning it.
    pub fn publish(&self, records: Vec<Record>) -> Arc<Snapshot> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let revision = self.current.load().revision() + 1;
        let snapshot = Arc::new(Snapshot::new(records, revision));
        self.current.store(Arc::clone(&snapshot));
        tracing::debug!(revision, records = snapshot.len(), "snapshot published");
        snapshot
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}
