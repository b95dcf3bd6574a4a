//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect with automatic re-join)
//! - One local [`Replica`] per joined room, kept in sync automatically
//! - Presence updates and resynchronization on request
//! - Offline edits: applied locally and sent as one diff after the next join
//!
//! Edits made while disconnected need no queue. The local replica already
//! holds them; when the server bootstraps the room again, the client sends
//! whatever the server's state lacks.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::ids::{ConnectionId, RoomId};
use crate::presence::{PresenceFields, PresenceRecord};
use crate::protocol::{ClientMessage, ErrorKind, ProtocolError, ResyncReason, ServerMessage};
use crate::replica::Replica;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// The room's full state was merged into the local replica.
    Bootstrapped {
        room: RoomId,
        presence: Vec<PresenceRecord>,
    },
    /// A peer's delta was merged into the local replica.
    RemoteDelta { room: RoomId, sender: ConnectionId },
    /// A sync reply was merged into the local replica.
    Synced { room: RoomId },
    Presence { room: RoomId, record: PresenceRecord },
    PresenceRemoved { room: RoomId, connection: ConnectionId },
    /// The server asked for a resync; a sync request has already been sent.
    Resync { room: RoomId, reason: ResyncReason },
    Error {
        room: Option<RoomId>,
        kind: ErrorKind,
        message: String,
    },
    Pong,
}

struct JoinedRoom {
    replica: Arc<Replica>,
    presence: PresenceFields,
    credential: Option<String>,
}

type Rooms = Arc<RwLock<HashMap<RoomId, JoinedRoom>>>;

/// The sync client.
pub struct SyncClient {
    /// Server URL
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Joined rooms and their local replicas
    rooms: Rooms,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ClientEvent>,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and re-join every known room.
    ///
    /// Spawns background tasks for reading and writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await
        {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.outgoing_tx = Some(out_tx.clone());

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Membership does not survive a connection; join again.
        {
            let rooms = self.rooms.read().await;
            for (room, joined) in rooms.iter() {
                let msg = ClientMessage::Join {
                    room: room.clone(),
                    presence: joined.presence.clone(),
                    credential: joined.credential.clone(),
                };
                let _ = out_tx.send(msg.encode()?).await;
            }
        }

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let rooms = self.rooms.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(msg) => {
                            if let Some(event) = handle_server_message(&rooms, &out_tx, msg).await {
                                let _ = event_tx.send(event).await;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Join a room. While disconnected the join is remembered and sent on
    /// the next [`connect`](Self::connect).
    pub async fn join(
        &self,
        room: RoomId,
        presence: PresenceFields,
        credential: Option<String>,
    ) -> Result<(), ProtocolError> {
        {
            let mut rooms = self.rooms.write().await;
            let entry = rooms.entry(room.clone()).or_insert_with(|| JoinedRoom {
                replica: Arc::new(Replica::new()),
                presence: PresenceFields::default(),
                credential: None,
            });
            entry.presence = presence.clone();
            entry.credential = credential.clone();
        }
        self.send_if_connected(&ClientMessage::Join {
            room,
            presence,
            credential,
        })
        .await
    }

    /// Leave a room and drop its local replica.
    pub async fn leave(&self, room: &RoomId) -> Result<(), ProtocolError> {
        if self.rooms.write().await.remove(room).is_none() {
            return Err(ProtocolError::NotJoined(room.clone()));
        }
        self.send_if_connected(&ClientMessage::Leave { room: room.clone() })
            .await
    }

    /// The local replica of a joined room.
    pub async fn replica(&self, room: &RoomId) -> Option<Arc<Replica>> {
        self.rooms.read().await.get(room).map(|r| r.replica.clone())
    }

    /// Apply a local edit and send the delta it produced.
    ///
    /// `edit` receives the room's replica and returns the delta, e.g.
    /// `client.edit(&room, |r| r.insert(0, "Hi"))`. Offline edits stay in
    /// the replica and are sent after the next bootstrap.
    pub async fn edit<F>(&self, room: &RoomId, edit: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&Replica) -> Vec<u8>,
    {
        let replica = self
            .replica(room)
            .await
            .ok_or_else(|| ProtocolError::NotJoined(room.clone()))?;
        let update = edit(&replica);
        self.send_if_connected(&ClientMessage::Delta {
            room: room.clone(),
            update,
        })
        .await
    }

    /// Insert plain text at `index`.
    pub async fn insert(&self, room: &RoomId, index: u32, text: &str) -> Result<(), ProtocolError> {
        self.edit(room, |r| r.insert(index, text)).await
    }

    /// Append plain text at the end.
    pub async fn append(&self, room: &RoomId, text: &str) -> Result<(), ProtocolError> {
        self.edit(room, |r| r.append(text)).await
    }

    /// Replace this client's presence in `room`.
    pub async fn send_presence(
        &self,
        room: &RoomId,
        presence: PresenceFields,
    ) -> Result<(), ProtocolError> {
        {
            let mut rooms = self.rooms.write().await;
            let joined = rooms
                .get_mut(room)
                .ok_or_else(|| ProtocolError::NotJoined(room.clone()))?;
            joined.presence = presence.clone();
        }
        self.send_if_connected(&ClientMessage::Presence {
            room: room.clone(),
            presence,
        })
        .await
    }

    /// Ask the server for everything the local replica lacks.
    pub async fn request_sync(&self, room: &RoomId) -> Result<(), ProtocolError> {
        let replica = self
            .replica(room)
            .await
            .ok_or_else(|| ProtocolError::NotJoined(room.clone()))?;
        self.send(&ClientMessage::SyncRequest {
            room: room.clone(),
            state_vector: replica.state_vector(),
        })
        .await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Rooms this client has joined.
    pub async fn rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn send_if_connected(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(msg).await
    }
}

/// Merge server state into the local replicas. Returns the event to report.
async fn handle_server_message(
    rooms: &Rooms,
    out_tx: &mpsc::Sender<Vec<u8>>,
    msg: ServerMessage,
) -> Option<ClientEvent> {
    match msg {
        ServerMessage::Bootstrap {
            room,
            state,
            presence,
        } => {
            let replica = replica_of(rooms, &room).await?;
            // Offline edits the server has not seen yet.
            match replica.delta_for_peer(&state) {
                Ok(Some(update)) => {
                    log::debug!("Sending offline edits for {room}");
                    send_quietly(
                        out_tx,
                        &ClientMessage::Delta {
                            room: room.clone(),
                            update,
                        },
                    )
                    .await;
                }
                Ok(None) => {}
                Err(e) => log::warn!("Bootstrap for {room} unreadable: {e}"),
            }
            if let Err(e) = replica.apply_delta(&state) {
                log::warn!("Failed to merge bootstrap for {room}: {e}");
            }
            Some(ClientEvent::Bootstrapped { room, presence })
        }
        ServerMessage::Delta {
            room,
            sender,
            update,
        } => {
            let replica = replica_of(rooms, &room).await?;
            if let Err(e) = replica.apply_delta(&update) {
                log::warn!("Failed to merge delta from {sender} in {room}: {e}");
            }
            Some(ClientEvent::RemoteDelta { room, sender })
        }
        ServerMessage::SyncReply { room, update } => {
            let replica = replica_of(rooms, &room).await?;
            if let Err(e) = replica.apply_delta(&update) {
                log::warn!("Failed to merge sync reply for {room}: {e}");
            }
            Some(ClientEvent::Synced { room })
        }
        ServerMessage::Presence { room, record } => Some(ClientEvent::Presence { room, record }),
        ServerMessage::PresenceRemoved { room, connection } => {
            Some(ClientEvent::PresenceRemoved { room, connection })
        }
        ServerMessage::Resync { room, reason } => {
            let replica = replica_of(rooms, &room).await?;
            log::info!("Server requested resync of {room} ({reason:?})");
            send_quietly(
                out_tx,
                &ClientMessage::SyncRequest {
                    room: room.clone(),
                    state_vector: replica.state_vector(),
                },
            )
            .await;
            Some(ClientEvent::Resync { room, reason })
        }
        ServerMessage::Error {
            room,
            kind,
            message,
        } => Some(ClientEvent::Error {
            room,
            kind,
            message,
        }),
        ServerMessage::Pong => Some(ClientEvent::Pong),
    }
}

async fn replica_of(rooms: &Rooms, room: &RoomId) -> Option<Arc<Replica>> {
    let replica = rooms.read().await.get(room).map(|r| r.replica.clone());
    if replica.is_none() {
        log::debug!("Ignoring message for room {room} not joined locally");
    }
    replica
}

async fn send_quietly(out_tx: &mpsc::Sender<Vec<u8>>, msg: &ClientMessage) {
    match msg.encode() {
        Ok(bytes) => {
            let _ = out_tx.send(bytes).await;
        }
        Err(e) => log::error!("Failed to encode message: {e}"),
    }
}
