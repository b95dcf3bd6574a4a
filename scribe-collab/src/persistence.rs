//! Bridge between room replicas and the durable document store.
//!
//! The store is text-oriented, so replica state travels as standard base64
//! inside the document record:
//!
//! ```text
//! { "content": "<base64 yrs v1 full state>", "updatedAt": 1718000000000, ...foreign fields }
//! ```
//!
//! Only `content` and `updatedAt` are ever written; every other field is
//! owned elsewhere and preserved by the store's merge.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::ids::DocumentId;
use crate::storage::{DocumentRecord, DocumentStore, StoreError};

/// Record field holding the encoded replica state.
pub const CONTENT: &str = "content";
/// Record field holding the last save time, Unix milliseconds.
pub const UPDATED_AT: &str = "updatedAt";

/// Persistence errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    /// The stored record exists but its content cannot be decoded.
    #[error("corrupt snapshot for document {document}: {reason}")]
    CorruptSnapshot { document: DocumentId, reason: String },
    /// The store could not be reached; retryable.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl PersistenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistenceError::StorageUnavailable(_))
    }
}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(reason) => PersistenceError::StorageUnavailable(reason),
            StoreError::CorruptRecord { document, reason } => {
                PersistenceError::CorruptSnapshot { document, reason }
            }
        }
    }
}

/// Loads and saves encoded replica state.
///
/// Cheap to clone; store calls run on the blocking pool.
#[derive(Clone)]
pub struct PersistenceBridge {
    store: Arc<dyn DocumentStore>,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Previously saved state, or `None` if the document has never been
    /// collaboratively edited.
    pub async fn load_snapshot(
        &self,
        document: &DocumentId,
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        let store = self.store.clone();
        let id = document.clone();
        let record = tokio::task::spawn_blocking(move || store.get(&id))
            .await
            .map_err(|e| PersistenceError::StorageUnavailable(format!("load task failed: {e}")))??;

        match record {
            Some(record) => decode_content(document, &record),
            None => Ok(None),
        }
    }

    /// Upsert `state` as the document's content and stamp `updatedAt`.
    pub async fn save_snapshot(
        &self,
        document: &DocumentId,
        state: &[u8],
    ) -> Result<(), PersistenceError> {
        let fields = encode_content(state);
        let store = self.store.clone();
        let id = document.clone();
        tokio::task::spawn_blocking(move || store.merge(&id, fields))
            .await
            .map_err(|e| PersistenceError::StorageUnavailable(format!("save task failed: {e}")))??;
        log::debug!("Saved {} byte snapshot for document {document}", state.len());
        Ok(())
    }
}

/// Fields written by a save.
fn encode_content(state: &[u8]) -> DocumentRecord {
    let mut fields = DocumentRecord::new();
    fields.insert(CONTENT.into(), Value::String(STANDARD.encode(state)));
    fields.insert(UPDATED_AT.into(), Value::from(unix_millis()));
    fields
}

/// Extract the replica state from a record.
///
/// A record without `content` (metadata created before any edit) counts as
/// no prior state.
fn decode_content(
    document: &DocumentId,
    record: &DocumentRecord,
) -> Result<Option<Vec<u8>>, PersistenceError> {
    let corrupt = |reason: String| PersistenceError::CorruptSnapshot {
        document: document.clone(),
        reason,
    };
    match record.get(CONTENT) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(encoded)) if encoded.is_empty() => Ok(None),
        Some(Value::String(encoded)) => STANDARD
            .decode(encoded)
            .map(Some)
            .map_err(|e| corrupt(format!("invalid base64: {e}"))),
        Some(other) => Err(corrupt(format!("content is not a string: {other}"))),
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::Replica;
    use crate::storage::MemoryDocumentStore;
    use serde_json::json;

    fn bridge() -> (Arc<MemoryDocumentStore>, PersistenceBridge) {
        let store = Arc::new(MemoryDocumentStore::new());
        (store.clone(), PersistenceBridge::new(store))
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let (_, bridge) = bridge();
        assert_eq!(bridge.load_snapshot(&DocumentId::new("x")).await, Ok(None));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let (store, bridge) = bridge();
        let doc = DocumentId::new("doc-42");
        let replica = Replica::new();
        replica.insert(0, "Hello World");

        bridge
            .save_snapshot(&doc, &replica.encode_full_state())
            .await
            .unwrap();

        let record = store.record(&doc).unwrap();
        assert!(record[CONTENT].is_string());
        assert!(record[UPDATED_AT].as_u64().unwrap() > 0);

        let loaded = bridge.load_snapshot(&doc).await.unwrap().unwrap();
        assert_eq!(Replica::hydrate(&loaded).unwrap().text(), "Hello World");
    }

    #[tokio::test]
    async fn test_save_keeps_foreign_fields() {
        let (store, bridge) = bridge();
        let doc = DocumentId::new("meta");
        store.insert(
            &doc,
            json!({"title": "Plan", "permissions": {"bob": "viewer"}})
                .as_object()
                .cloned()
                .unwrap(),
        );

        bridge.save_snapshot(&doc, &[0, 0]).await.unwrap();

        let record = store.record(&doc).unwrap();
        assert_eq!(record["title"], "Plan");
        assert_eq!(record["permissions"]["bob"], "viewer");
        assert_eq!(record[CONTENT], STANDARD.encode([0u8, 0]));
    }

    #[tokio::test]
    async fn test_metadata_only_record_is_none() {
        let (store, bridge) = bridge();
        let doc = DocumentId::new("fresh");
        store.insert(&doc, json!({"title": "New"}).as_object().cloned().unwrap());
        assert_eq!(bridge.load_snapshot(&doc).await, Ok(None));
    }

    #[tokio::test]
    async fn test_bad_base64_is_corrupt() {
        let (store, bridge) = bridge();
        let doc = DocumentId::new("bad");
        store.insert(
            &doc,
            json!({"content": "!!not base64!!"}).as_object().cloned().unwrap(),
        );

        let err = bridge.load_snapshot(&doc).await.unwrap_err();
        assert!(matches!(err, PersistenceError::CorruptSnapshot { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_non_string_content_is_corrupt() {
        let (store, bridge) = bridge();
        let doc = DocumentId::new("num");
        store.insert(&doc, json!({"content": 7}).as_object().cloned().unwrap());
        assert!(matches!(
            bridge.load_snapshot(&doc).await,
            Err(PersistenceError::CorruptSnapshot { .. })
        ));
    }

    #[tokio::test]
    async fn test_unavailable_is_retryable() {
        let (store, bridge) = bridge();
        store.fail_loads(1);
        store.fail_saves(1);

        let err = bridge.load_snapshot(&DocumentId::new("a")).await.unwrap_err();
        assert!(err.is_retryable());
        let err = bridge
            .save_snapshot(&DocumentId::new("a"), &[0, 0])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
