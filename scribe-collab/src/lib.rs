//! # scribe-collab: real-time collaborative editing core
//!
//! Keeps many editors' views of a shared rich-text document consistent while
//! they edit concurrently, tracks who is present, and persists durable
//! snapshots when a document's room goes idle.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer  │
//! │ (per user)  │    Binary Proto    │ (transport) │
//! └──────┬──────┘                    └──────┬──────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌─────────────┐     ┌──────────────────┐
//! │ Replica     │                    │ Relay       │ ──► │ RoomRegistry     │
//! │ (local)     │                    └─────────────┘     └────────┬─────────┘
//! └─────────────┘                                                 │ one task per room
//!                                                        ┌────────┴─────────┐
//!                                                        │ RoomActor        │
//!                                                        │  Replica         │
//!                                                        │  PresenceTracker │
//!                                                        │  BroadcastGroup  │
//!                                                        └────────┬─────────┘
//!                                                                 │ hydrate / drain
//!                                                        ┌────────┴─────────┐
//!                                                        │ PersistenceBridge│
//!                                                        │  DocumentStore   │
//!                                                        └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`replica`]: Yrs-backed mergeable rich-text state
//! - [`presence`]: ephemeral per-connection presence records
//! - [`protocol`]: binary wire protocol (bincode-encoded messages)
//! - [`broadcast`]: per-room fan-out with backpressure
//! - [`room`]: room actor and lifecycle state machine
//! - [`registry`]: process-wide room registry
//! - [`relay`]: transport-independent join/leave/broadcast contract
//! - [`persistence`]: base64 snapshot records over a [`DocumentStore`]
//! - [`storage`]: RocksDB and in-memory document stores
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client

pub mod broadcast;
pub mod client;
pub mod ids;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod replica;
pub mod room;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{Access, BroadcastGroup, BroadcastStats, Frame};
pub use client::{ClientEvent, ConnectionState, SyncClient};
pub use ids::{ConnectionId, DocumentId, RoomId};
pub use persistence::{PersistenceBridge, PersistenceError};
pub use presence::{CursorRange, PresenceChange, PresenceFields, PresenceRecord, PresenceTracker};
pub use protocol::{ClientMessage, ErrorKind, ProtocolError, ResyncReason, ServerMessage};
pub use registry::{RegistryStats, RetryPolicy, RoomConfig, RoomRegistry};
pub use relay::{Connection, Relay, RelayError};
pub use replica::{Replica, ReplicaError, TextRun};
pub use room::{JoinError, RoomPhase, RoomSnapshot};
pub use server::{AccessDecision, AccessGate, AllowAll, ServerConfig, ServerStats, SyncServer};
pub use storage::{
    DocumentRecord, DocumentStore, MemoryDocumentStore, RocksDocumentStore, StoreConfig,
    StoreError,
};
