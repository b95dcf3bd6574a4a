//! Identifiers for documents, rooms and connections.
//!
//! A room is named after the document it edits: `document-<id>`. The
//! mapping is deterministic and invertible so the persistence bridge can
//! locate the durable record from a room name alone.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix shared by every room name.
pub const ROOM_PREFIX: &str = "document-";

/// External document identifier, owned by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collaboration scope for one document.
///
/// Deserialization rejects names that do not carry the room prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Room name for a document.
    pub fn for_document(document: &DocumentId) -> Self {
        Self(format!("{ROOM_PREFIX}{}", document.as_str()))
    }

    /// Parse a room name received from a client.
    ///
    /// Returns `None` unless the name carries the room prefix followed by a
    /// non-empty document id.
    pub fn parse(name: &str) -> Option<Self> {
        match name.strip_prefix(ROOM_PREFIX) {
            Some(rest) if !rest.is_empty() => Some(Self(name.to_string())),
            _ => None,
        }
    }

    /// Invert [`RoomId::for_document`].
    pub fn document_id(&self) -> DocumentId {
        DocumentId::new(self.0.strip_prefix(ROOM_PREFIX).unwrap_or(&self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomId {
    type Error = String;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::parse(&name).ok_or_else(|| format!("invalid room name: {name:?}"))
    }
}

impl From<RoomId> for String {
    fn from(room: RoomId) -> Self {
        room.0
    }
}

/// One transport connection. Doubles as the presence key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
