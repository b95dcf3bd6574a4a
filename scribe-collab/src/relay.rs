//! Room-scoped message relay.
//!
//! The relay is the transport-independent face of the collaboration core.
//! A transport (the WebSocket server, or a test) opens a [`Connection`],
//! drains its outbound frame queue, and calls into the relay for every
//! inbound message:
//!
//! ```text
//! transport ──► Relay::join / leave / broadcast_* / request_sync / disconnect
//!                 │
//!                 ▼
//!           RoomRegistry ──► room actor ──► BroadcastGroup ──► outbound queues
//! ```
//!
//! Broadcasts are fire-and-forget: the call returns once the command is
//! queued for the room, not when peers receive it. Per-connection order is
//! preserved because each connection's commands enter the room's queue in
//! the order the transport issued them.

use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::broadcast::{Frame, Outbound};
use crate::ids::{ConnectionId, RoomId};
use crate::presence::PresenceFields;
use crate::protocol::ErrorKind;
use crate::registry::RoomRegistry;
use crate::room::{JoinError, RoomCommand};

pub use crate::broadcast::Access;

/// Relay errors, reported to the offending connection only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("not joined to room {0}")]
    NotJoined(RoomId),
    #[error("room {room} is full ({limit} members)")]
    RoomFull { room: RoomId, limit: usize },
    #[error("room {0} stopped before the request was served")]
    RoomClosed(RoomId),
}

impl RelayError {
    /// Wire error kind for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::NotJoined(_) => ErrorKind::NotJoined,
            RelayError::RoomFull { .. } => ErrorKind::RoomFull,
            RelayError::RoomClosed(_) => ErrorKind::RoomUnavailable,
        }
    }

    pub fn room(&self) -> &RoomId {
        match self {
            RelayError::NotJoined(room)
            | RelayError::RoomFull { room, .. }
            | RelayError::RoomClosed(room) => room,
        }
    }
}

/// One client connection as the relay sees it.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    outbound: Outbound,
    rooms: HashSet<RoomId>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_member(&self, room: &RoomId) -> bool {
        self.rooms.contains(room)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &RoomId> {
        self.rooms.iter()
    }
}

/// Transport-facing relay. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    registry: RoomRegistry,
}

impl Relay {
    pub fn new(registry: RoomRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Register a new connection. The receiver yields every frame addressed
    /// to it, already encoded.
    pub fn open_connection(&self) -> (Connection, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(self.registry.config().outbound_capacity);
        let connection = Connection {
            id: ConnectionId::new(),
            outbound,
            rooms: HashSet::new(),
        };
        log::debug!("Opened connection {}", connection.id);
        (connection, rx)
    }

    /// Join `room`, materializing it if needed.
    ///
    /// Resolves once the room has queued the bootstrap for this connection.
    /// Joining a room the connection is already in re-sends the bootstrap.
    pub async fn join(
        &self,
        connection: &mut Connection,
        room: &RoomId,
        presence: PresenceFields,
        access: Access,
    ) -> Result<(), RelayError> {
        // Recorded first so a disconnect during the join still leaves.
        let newly_added = connection.rooms.insert(room.clone());

        let (ack, ack_rx) = oneshot::channel();
        let command = RoomCommand::Join {
            connection: connection.id,
            outbound: connection.outbound.clone(),
            access,
            presence,
            ack,
        };
        self.registry.dispatch(room, command).await;

        let result = match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(JoinError::RoomFull { limit })) => Err(RelayError::RoomFull {
                room: room.clone(),
                limit,
            }),
            Err(_) => Err(RelayError::RoomClosed(room.clone())),
        };
        if result.is_err() && newly_added {
            connection.rooms.remove(room);
        }
        result
    }

    /// Leave `room`. The last member leaving starts the room's drain.
    pub async fn leave(&self, connection: &mut Connection, room: &RoomId) -> Result<(), RelayError> {
        if !connection.rooms.remove(room) {
            return Err(RelayError::NotJoined(room.clone()));
        }
        self.registry
            .dispatch(
                room,
                RoomCommand::Leave {
                    connection: connection.id,
                },
            )
            .await;
        Ok(())
    }

    /// Apply `update` to the room's replica and forward it to every other
    /// member.
    pub async fn broadcast_document_delta(
        &self,
        connection: &Connection,
        room: &RoomId,
        update: Vec<u8>,
    ) -> Result<(), RelayError> {
        self.send(
            connection,
            room,
            RoomCommand::Delta {
                connection: connection.id,
                update,
            },
        )
        .await
    }

    /// Replace the connection's presence record and forward it to every
    /// other member.
    pub async fn broadcast_presence_update(
        &self,
        connection: &Connection,
        room: &RoomId,
        presence: PresenceFields,
    ) -> Result<(), RelayError> {
        self.send(
            connection,
            room,
            RoomCommand::Presence {
                connection: connection.id,
                fields: presence,
            },
        )
        .await
    }

    /// Ask for everything the connection's replica lacks.
    pub async fn request_sync(
        &self,
        connection: &Connection,
        room: &RoomId,
        state_vector: Vec<u8>,
    ) -> Result<(), RelayError> {
        self.send(
            connection,
            room,
            RoomCommand::SyncRequest {
                connection: connection.id,
                state_vector,
            },
        )
        .await
    }

    /// Leave every room the connection is in.
    pub async fn disconnect(&self, mut connection: Connection) {
        let rooms: Vec<RoomId> = connection.rooms.drain().collect();
        for room in &rooms {
            self.registry
                .dispatch(
                    room,
                    RoomCommand::Leave {
                        connection: connection.id,
                    },
                )
                .await;
        }
        log::debug!(
            "Connection {} disconnected from {} rooms",
            connection.id,
            rooms.len()
        );
    }

    async fn send(
        &self,
        connection: &Connection,
        room: &RoomId,
        command: RoomCommand,
    ) -> Result<(), RelayError> {
        if !connection.is_member(room) {
            return Err(RelayError::NotJoined(room.clone()));
        }
        if self.registry.dispatch(room, command).await {
            Ok(())
        } else {
            Err(RelayError::RoomClosed(room.clone()))
        }
    }
}
