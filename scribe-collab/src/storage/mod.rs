//! Durable document store.
//!
//! The collaboration core owns exactly two fields of each document record,
//! `content` and `updatedAt`; every other field belongs to external
//! collaborators (title, permissions, folder) and must survive our writes.
//! Stores therefore expose a field-level *merge* instead of a blind put.
//!
//! ```text
//! ┌──────────────────┐  get / merge   ┌───────────────────────────┐
//! │ PersistenceBridge│ ─────────────► │ DocumentStore             │
//! │ (base64 content) │                │  ├─ RocksDocumentStore    │
//! └──────────────────┘                │  └─ MemoryDocumentStore   │
//!                                     └───────────────────────────┘
//! ```
//!
//! Store calls are blocking; the bridge runs them on the blocking pool.

pub mod memory;
pub mod rocks;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::ids::DocumentId;

pub use memory::MemoryDocumentStore;
pub use rocks::{RocksDocumentStore, StoreConfig};

/// A document record: a JSON object of named fields.
pub type DocumentRecord = Map<String, Value>;

/// Storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the operation failed; retryable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// A stored record is not a JSON object.
    #[error("corrupt record for document {document}: {reason}")]
    CorruptRecord { document: DocumentId, reason: String },
}

/// Field-addressed document storage.
///
/// Implementations must be safe to call concurrently for different
/// documents. Calls for the same document are serialized by the room
/// lifecycle, but a merge must still never drop fields it was not given.
pub trait DocumentStore: Send + Sync + 'static {
    /// Read a record. `Ok(None)` means the document has never been stored.
    fn get(&self, document: &DocumentId) -> Result<Option<DocumentRecord>, StoreError>;

    /// Upsert `fields` into the record, leaving every other field untouched.
    fn merge(&self, document: &DocumentId, fields: DocumentRecord) -> Result<(), StoreError>;
}

/// Merge `fields` into `record` in place.
pub(crate) fn merge_fields(record: &mut DocumentRecord, fields: DocumentRecord) {
    for (key, value) in fields {
        record.insert(key, value);
    }
}
