//! WebSocket transport for the relay.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws frames   ┌──────────────┐
//!             ├────────────► │ connection   │ ── ClientMessage ──► Relay ──► room actor
//! Client B ──┘               │ task (select)│ ◄── Frame queue ───────────────────┘
//!                            └──────────────┘
//! ```
//!
//! Each accepted socket runs one task that multiplexes two sources with
//! `tokio::select!`: inbound frames from the socket, and encoded frames from
//! the connection's outbound queue. When the socket closes or errors, the
//! task disconnects from the relay, which leaves every joined room.
//!
//! Who may edit is not decided here. Joins carry an opaque credential that
//! is handed to the configured [`AccessGate`].

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::env;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{Access, Frame};
use crate::ids::DocumentId;
use crate::persistence::PersistenceBridge;
use crate::protocol::{ClientMessage, ErrorKind, ServerMessage};
use crate::registry::{RoomConfig, RoomRegistry};
use crate::relay::{Connection, Relay};
use crate::storage::{DocumentStore, MemoryDocumentStore, RocksDocumentStore, StoreConfig, StoreError};

/// Outcome of an access check at join time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Edit,
    ReadOnly,
    Denied,
}

impl AccessDecision {
    pub fn access(self) -> Option<Access> {
        match self {
            AccessDecision::Edit => Some(Access::Edit),
            AccessDecision::ReadOnly => Some(Access::ReadOnly),
            AccessDecision::Denied => None,
        }
    }
}

/// Caller-supplied permission check, consulted once per join.
pub trait AccessGate: Send + Sync + 'static {
    fn decide(&self, document: &DocumentId, credential: Option<&str>) -> AccessDecision;
}

/// Grants edit access to everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessGate for AllowAll {
    fn decide(&self, _document: &DocumentId, _credential: Option<&str>) -> AccessDecision {
        AccessDecision::Edit
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory store, nothing survives a restart)
    pub storage_path: Option<PathBuf>,
    /// Room lifecycle settings
    pub room: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            room: RoomConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `SCRIBE_BIND_ADDR`, `SCRIBE_STORAGE_PATH`,
    /// `SCRIBE_MAX_MEMBERS` and `SCRIBE_CHECKPOINT_SECS` (0 disables).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(addr) = env::var("SCRIBE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(path) = env::var("SCRIBE_STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(max) = parse_env::<usize>("SCRIBE_MAX_MEMBERS")? {
            config.room.max_members = max;
        }
        if let Some(secs) = parse_env::<u64>("SCRIBE_CHECKPOINT_SECS")? {
            config.room.checkpoint_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        Ok(config)
    }
}

fn parse_env<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
}

/// The sync server. Cheap to clone; clones share rooms and stats.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    relay: Relay,
    gate: Arc<dyn AccessGate>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB if a storage path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksDocumentStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => {
                log::warn!("No storage path configured, documents live in memory only");
                Arc::new(MemoryDocumentStore::new())
            }
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let registry = RoomRegistry::new(PersistenceBridge::new(store), config.room.clone());
        Self {
            config,
            relay: Relay::new(registry),
            gate: Arc::new(AllowAll),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryDocumentStore::new()))
    }

    /// Replace the access gate.
    pub fn with_access_gate(mut self, gate: Arc<dyn AccessGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Bind the configured address and serve until Ctrl+C.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener, shutdown_signal()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then
    /// persist every live room.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => break,
            }
        }

        log::info!("Shutting down, persisting live rooms");
        self.relay.registry().shutdown().await;
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (mut connection, mut outbound) = self.relay.open_connection();

        log::info!("WebSocket connection {} established from {addr}", connection.id());
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = self
            .pump(&mut ws_sender, &mut ws_receiver, &mut connection, &mut outbound)
            .await;

        log::info!("Connection {} from {addr} closed", connection.id());
        self.relay.disconnect(connection).await;
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    async fn pump(
        &self,
        ws_sender: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
        ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
        connection: &mut Connection,
        outbound: &mut mpsc::Receiver<Frame>,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = self.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        let reply = match ClientMessage::decode(&data) {
                            Ok(msg) => self.dispatch(connection, msg).await,
                            Err(e) => {
                                log::warn!("Bad frame from {}: {e}", connection.id());
                                self.stats.write().await.rejected_frames += 1;
                                Some(ServerMessage::error(None, ErrorKind::BadMessage, e.to_string()))
                            }
                        };
                        if let Some(reply) = reply {
                            send(ws_sender, &reply).await?;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(_)) => {}
                },
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    /// Route one client message. Returns a direct reply, if any.
    async fn dispatch(&self, connection: &mut Connection, msg: ClientMessage) -> Option<ServerMessage> {
        let result = match msg {
            ClientMessage::Join {
                room,
                presence,
                credential,
            } => {
                let decision = self.gate.decide(&room.document_id(), credential.as_deref());
                let Some(access) = decision.access() else {
                    log::info!("Access to {room} denied for {}", connection.id());
                    return Some(ServerMessage::error(
                        Some(room),
                        ErrorKind::AccessDenied,
                        "access denied",
                    ));
                };
                self.relay.join(connection, &room, presence, access).await
            }
            ClientMessage::Leave { room } => self.relay.leave(connection, &room).await,
            ClientMessage::Delta { room, update } => {
                self.relay
                    .broadcast_document_delta(connection, &room, update)
                    .await
            }
            ClientMessage::Presence { room, presence } => {
                self.relay
                    .broadcast_presence_update(connection, &room, presence)
                    .await
            }
            ClientMessage::SyncRequest { room, state_vector } => {
                self.relay.request_sync(connection, &room, state_vector).await
            }
            ClientMessage::Ping => return Some(ServerMessage::Pong),
        };

        result.err().map(|e| {
            log::debug!("Request from {} failed: {e}", connection.id());
            ServerMessage::error(Some(e.room().clone()), e.kind(), e.to_string())
        })
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn registry(&self) -> &RoomRegistry {
        self.relay.registry()
    }
}

async fn send(
    ws_sender: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
    msg: &ServerMessage,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    match msg.encode() {
        Ok(bytes) => ws_sender.send(Message::Binary(bytes.into())).await,
        Err(e) => {
            log::error!("Failed to encode reply: {e}");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown signal received");
}
