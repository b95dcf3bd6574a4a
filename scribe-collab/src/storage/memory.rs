//! In-memory document store.
//!
//! Used by tests and by servers started without a storage path. Counts
//! calls, can simulate slow storage and can fail a fixed number of upcoming
//! calls, which lets lifecycle tests observe hydration and save behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use super::{merge_fields, DocumentRecord, DocumentStore, StoreError};
use crate::ids::DocumentId;

#[derive(Default)]
pub struct MemoryDocumentStore {
    records: RwLock<HashMap<DocumentId, DocumentRecord>>,
    latency: RwLock<Option<Duration>>,
    failing_loads: AtomicU32,
    failing_saves: AtomicU32,
    loads: AtomicU64,
    saves: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing counters.
    pub fn insert(&self, document: &DocumentId, record: DocumentRecord) {
        if let Ok(mut records) = self.records.write() {
            records.insert(document.clone(), record);
        }
    }

    /// Current record, bypassing counters and injected failures.
    pub fn record(&self, document: &DocumentId) -> Option<DocumentRecord> {
        self.records.read().ok()?.get(document).cloned()
    }

    /// Block every subsequent call for `latency`.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut slot) = self.latency.write() {
            *slot = Some(latency);
        }
    }

    /// Fail the next `n` reads with [`StoreError::Unavailable`].
    pub fn fail_loads(&self, n: u32) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` merges with [`StoreError::Unavailable`].
    pub fn fail_saves(&self, n: u32) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Number of `get` calls, including failed ones.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of successful `merge` calls.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    fn delay(&self) {
        let latency = self.latency.read().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }
    }

    fn lock_error() -> StoreError {
        StoreError::Unavailable("memory store lock poisoned".into())
    }
}

/// Consume one injected failure, if any remain.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl DocumentStore for MemoryDocumentStore {
    fn get(&self, document: &DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        self.delay();
        self.loads.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_loads) {
            return Err(StoreError::Unavailable("injected load failure".into()));
        }
        let records = self.records.read().map_err(|_| Self::lock_error())?;
        Ok(records.get(document).cloned())
    }

    fn merge(&self, document: &DocumentId, fields: DocumentRecord) -> Result<(), StoreError> {
        self.delay();
        if take_failure(&self.failing_saves) {
            return Err(StoreError::Unavailable("injected save failure".into()));
        }
        let mut records = self.records.write().map_err(|_| Self::lock_error())?;
        merge_fields(records.entry(document.clone()).or_default(), fields);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
