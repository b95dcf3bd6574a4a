//! Binary wire protocol between editors and the relay.
//!
//! One WebSocket binary frame carries one bincode-encoded message:
//! [`ClientMessage`] upstream, [`ServerMessage`] downstream.
//!
//! ```text
//! client                               relay
//!   │ Join { room, presence, cred } ──►  │
//!   │ ◄── Bootstrap { state, presence }  │
//!   │ Delta { room, update }  ─────────► │ ──► Delta to N-1 peers
//!   │ Presence { room, presence } ─────► │ ──► Presence to N-1 peers
//!   │ SyncRequest { state_vector } ────► │
//!   │ ◄──────────── SyncReply { update } │
//!   │ Leave { room } ──────────────────► │ ──► PresenceRemoved
//! ```
//!
//! Document updates are opaque to the protocol; only the room actor decodes
//! them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ConnectionId, RoomId};
use crate::presence::{PresenceFields, PresenceRecord};

/// Messages sent by an editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Enter a room. `credential` is handed to the access gate untouched.
    Join {
        room: RoomId,
        presence: PresenceFields,
        credential: Option<String>,
    },
    Leave {
        room: RoomId,
    },
    /// Yrs v1 update produced by a local edit.
    Delta {
        room: RoomId,
        update: Vec<u8>,
    },
    /// Replace this connection's presence record.
    Presence {
        room: RoomId,
        presence: PresenceFields,
    },
    /// Ask for everything missing relative to `state_vector`.
    SyncRequest {
        room: RoomId,
        state_vector: Vec<u8>,
    },
    Ping,
}

/// Messages sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Full document state and presence snapshot, sent once per join.
    Bootstrap {
        room: RoomId,
        state: Vec<u8>,
        presence: Vec<PresenceRecord>,
    },
    /// A peer's delta, forwarded byte for byte.
    Delta {
        room: RoomId,
        sender: ConnectionId,
        update: Vec<u8>,
    },
    Presence {
        room: RoomId,
        record: PresenceRecord,
    },
    PresenceRemoved {
        room: RoomId,
        connection: ConnectionId,
    },
    /// Answer to a [`ClientMessage::SyncRequest`].
    SyncReply {
        room: RoomId,
        update: Vec<u8>,
    },
    /// The client's replica may have diverged; it should send a sync request.
    Resync {
        room: RoomId,
        reason: ResyncReason,
    },
    Error {
        room: Option<RoomId>,
        kind: ErrorKind,
        message: String,
    },
    Pong,
}

/// Why a client is asked to resynchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResyncReason {
    /// The client's last delta could not be applied and was dropped.
    MalformedDelta,
    /// The client joined read-only; its delta was refused.
    ReadOnly,
    /// The client's outbound queue overflowed and broadcasts were lost.
    Lagged,
}

/// Request-level failures reported to a single client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The access gate refused the join.
    AccessDenied,
    /// The room is at its member limit.
    RoomFull,
    /// The connection sent a room-scoped message without joining.
    NotJoined,
    /// The frame could not be decoded.
    BadMessage,
    /// The state vector in a sync request could not be decoded.
    BadStateVector,
    /// The room stopped before the request could be served.
    RoomUnavailable,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// Room the message is scoped to, if any.
    pub fn room(&self) -> Option<&RoomId> {
        match self {
            ClientMessage::Join { room, .. }
            | ClientMessage::Leave { room }
            | ClientMessage::Delta { room, .. }
            | ClientMessage::Presence { room, .. }
            | ClientMessage::SyncRequest { room, .. } => Some(room),
            ClientMessage::Ping => None,
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn error(room: Option<RoomId>, kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            room,
            kind,
            message: message.into(),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("not joined to {0}")]
    NotJoined(RoomId),
}
