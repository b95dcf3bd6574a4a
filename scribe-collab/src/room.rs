//! Room actor: the single owner of one document's live state.
//!
//! Each live room is one tokio task that owns the [`Replica`], the
//! [`PresenceTracker`] and the [`BroadcastGroup`], and handles
//! [`RoomCommand`]s one at a time from an unbounded queue. No lock guards the
//! replica; serial command handling is what keeps two deltas for the same room
//! from ever being applied in parallel.
//!
//! ```text
//!            join                      members == 0
//!  Absent ─────────► Hydrating ──► Active ─────────────► Draining ──► Absent
//!                                    ▲                       │
//!                                    └──────── rejoin ───────┘
//! ```
//!
//! Hydration and persistence are the only suspension points. Commands that
//! arrive meanwhile wait in the queue: joins during hydration attach once
//! the replica is loaded. A draining room still answers whatever is queued,
//! and only a join that adds a member cancels the eviction.

use std::future::pending;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use thiserror::Error;

use crate::broadcast::{Access, BroadcastGroup, Outbound};
use crate::ids::{ConnectionId, DocumentId, RoomId};
use crate::persistence::PersistenceError;
use crate::presence::{PresenceChange, PresenceFields, PresenceRecord, PresenceTracker};
use crate::protocol::{ErrorKind, ResyncReason, ServerMessage};
use crate::registry::{Counters, RetryPolicy, RoomRegistry};
use crate::replica::Replica;

/// Lifecycle phase of a live room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Loading the stored snapshot; commands are queued.
    Hydrating,
    /// Serving members.
    Active,
    /// Empty; persisting before eviction.
    Draining,
}

/// Reasons a join is refused by the room itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("room is full ({limit} members)")]
    RoomFull { limit: usize },
}

/// Point-in-time view of a room.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub phase: RoomPhase,
    pub members: usize,
    pub presence: Vec<PresenceRecord>,
    pub state: Vec<u8>,
}

/// Work for a room actor.
pub(crate) enum RoomCommand {
    Join {
        connection: ConnectionId,
        outbound: Outbound,
        access: Access,
        presence: PresenceFields,
        ack: oneshot::Sender<Result<(), JoinError>>,
    },
    Leave {
        connection: ConnectionId,
    },
    Delta {
        connection: ConnectionId,
        update: Vec<u8>,
    },
    Presence {
        connection: ConnectionId,
        fields: PresenceFields,
    },
    SyncRequest {
        connection: ConnectionId,
        state_vector: Vec<u8>,
    },
    Inspect {
        reply: oneshot::Sender<RoomSnapshot>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

impl RoomCommand {
    /// Whether this command may bring an absent room to life.
    pub(crate) fn materializes(&self) -> bool {
        matches!(self, RoomCommand::Join { .. })
    }
}

enum Flow {
    Continue,
    Shutdown(oneshot::Sender<()>),
}

enum ServeExit {
    Empty,
    Shutdown(Option<oneshot::Sender<()>>),
}

enum DrainExit {
    Evicted,
    Rejoined,
    Shutdown(Option<oneshot::Sender<()>>),
}

pub(crate) struct RoomActor {
    room: RoomId,
    document: DocumentId,
    generation: u64,
    registry: RoomRegistry,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
    phase: watch::Sender<RoomPhase>,
    replica: Replica,
    presence: PresenceTracker,
    members: BroadcastGroup,
    /// Replica changed since the last successful save.
    dirty: bool,
    /// Hydration fell back to empty because storage was unreachable; the
    /// stored snapshot has not been merged in yet.
    degraded: bool,
    /// The last drain gave up on its final save.
    save_abandoned: bool,
}

impl RoomActor {
    pub(crate) fn new(
        room: RoomId,
        generation: u64,
        registry: RoomRegistry,
        commands: mpsc::UnboundedReceiver<RoomCommand>,
        phase: watch::Sender<RoomPhase>,
    ) -> Self {
        Self {
            document: room.document_id(),
            members: BroadcastGroup::new(room.clone()),
            room,
            generation,
            registry,
            commands,
            phase,
            replica: Replica::new(),
            presence: PresenceTracker::new(),
            dirty: false,
            degraded: false,
            save_abandoned: false,
        }
    }

    pub(crate) async fn run(mut self) {
        self.hydrate().await;

        loop {
            self.set_phase(RoomPhase::Active);
            let done = match self.serve().await {
                ServeExit::Empty => match self.drain().await {
                    DrainExit::Evicted => break,
                    DrainExit::Rejoined => continue,
                    DrainExit::Shutdown(done) => done,
                },
                ServeExit::Shutdown(done) => done,
            };
            self.shut_down(done).await;
            break;
        }
        log::info!("Room {} closed", self.room);
    }

    async fn shut_down(&mut self, done: Option<oneshot::Sender<()>>) {
        self.set_phase(RoomPhase::Draining);
        if self.dirty {
            let policy = self.save_policy();
            self.persist(policy).await;
        }
        self.registry.evict(&self.room, self.generation).await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn set_phase(&self, phase: RoomPhase) {
        log::debug!("Room {} -> {:?}", self.room, phase);
        self.phase.send_replace(phase);
    }

    // ─── Hydration ──────────────────────────────────────────────────

    async fn hydrate(&mut self) {
        Counters::bump(&self.registry.counters().hydrations);
        let policy = self.registry.config().load_retry;
        match self.load(policy).await {
            Ok(Some(snapshot)) => match Replica::hydrate(&snapshot) {
                Ok(replica) => {
                    log::info!(
                        "Hydrated room {} from {} byte snapshot",
                        self.room,
                        snapshot.len()
                    );
                    self.replica = replica;
                }
                Err(e) => {
                    log::warn!("Room {} starting empty: {e}", self.room);
                    Counters::bump(&self.registry.counters().corrupt_snapshots);
                }
            },
            Ok(None) => log::info!("Room {} has no stored state, starting empty", self.room),
            Err(e @ PersistenceError::CorruptSnapshot { .. }) => {
                log::warn!("Room {} starting empty: {e}", self.room);
                Counters::bump(&self.registry.counters().corrupt_snapshots);
            }
            Err(e @ PersistenceError::StorageUnavailable(_)) => {
                log::warn!(
                    "Room {} starting empty, stored state will be merged before saving: {e}",
                    self.room
                );
                Counters::bump(&self.registry.counters().degraded_hydrations);
                self.degraded = true;
            }
        }
    }

    async fn load(&self, policy: RetryPolicy) -> Result<Option<Vec<u8>>, PersistenceError> {
        let bridge = self.registry.bridge();
        let mut attempt = 1;
        loop {
            match bridge.load_snapshot(&self.document).await {
                Err(e) if e.is_retryable() && attempt < policy.attempts() => {
                    log::debug!("Load attempt {attempt} for {} failed: {e}", self.room);
                    tokio::time::sleep(policy.backoff(attempt)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    // ─── Serving ────────────────────────────────────────────────────

    async fn serve(&mut self) -> ServeExit {
        let mut checkpoint = self.registry.config().checkpoint_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Flow::Shutdown(done) = self.handle(command) {
                            return ServeExit::Shutdown(Some(done));
                        }
                    }
                    None => return ServeExit::Shutdown(None),
                },
                _ = tick(&mut checkpoint) => {
                    if self.dirty {
                        log::debug!("Checkpointing room {}", self.room);
                        self.persist(RetryPolicy::once()).await;
                    }
                }
            }

            if self.members.is_empty() {
                return ServeExit::Empty;
            }
        }
    }

    fn handle(&mut self, command: RoomCommand) -> Flow {
        match command {
            RoomCommand::Join {
                connection,
                outbound,
                access,
                presence,
                ack,
            } => {
                let _ = ack.send(self.join(connection, outbound, access, presence));
            }
            RoomCommand::Leave { connection } => self.leave(&connection),
            RoomCommand::Delta { connection, update } => self.delta(connection, update),
            RoomCommand::Presence { connection, fields } => {
                if self.members.contains(&connection) {
                    let change = self.presence.set_local_state(connection, fields);
                    self.announce(&connection, change);
                }
            }
            RoomCommand::SyncRequest {
                connection,
                state_vector,
            } => self.sync(&connection, &state_vector),
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(RoomSnapshot {
                    phase: *self.phase.borrow(),
                    members: self.members.member_count(),
                    presence: self.presence.get_all_states(),
                    state: self.replica.encode_full_state(),
                });
            }
            RoomCommand::Shutdown { done } => return Flow::Shutdown(done),
        }
        Flow::Continue
    }

    fn join(
        &mut self,
        connection: ConnectionId,
        outbound: Outbound,
        access: Access,
        fields: PresenceFields,
    ) -> Result<(), JoinError> {
        let limit = self.registry.config().max_members;
        if !self.members.contains(&connection) && self.members.member_count() >= limit {
            log::warn!("Room {} refused {connection}: full", self.room);
            return Err(JoinError::RoomFull { limit });
        }

        self.members.add_member(connection, outbound, access);
        let change = self.presence.set_local_state(connection, fields);

        let bootstrap = ServerMessage::Bootstrap {
            room: self.room.clone(),
            state: self.replica.encode_full_state(),
            presence: self.presence.get_all_states(),
        };
        self.reply(&connection, &bootstrap);
        self.announce(&connection, change);

        log::info!(
            "Connection {connection} joined room {} ({:?}, {} members)",
            self.room,
            access,
            self.members.member_count()
        );
        Ok(())
    }

    fn leave(&mut self, connection: &ConnectionId) {
        if !self.members.remove_member(connection) {
            return;
        }
        if let Some(change) = self.presence.remove_state(connection) {
            self.announce(connection, change);
        }
        log::info!(
            "Connection {connection} left room {} ({} members)",
            self.room,
            self.members.member_count()
        );
    }

    fn delta(&mut self, connection: ConnectionId, update: Vec<u8>) {
        match self.members.access(&connection) {
            None => {
                log::debug!("Dropping delta from non-member {connection} in {}", self.room);
            }
            Some(Access::ReadOnly) => {
                log::warn!("Refused delta from read-only member {connection} in {}", self.room);
                self.resync(&connection, ResyncReason::ReadOnly);
            }
            Some(Access::Edit) => match self.replica.apply_delta(&update) {
                Ok(()) => {
                    self.dirty = true;
                    let msg = ServerMessage::Delta {
                        room: self.room.clone(),
                        sender: connection,
                        update,
                    };
                    if let Err(e) = self.members.broadcast_except(Some(&connection), &msg) {
                        log::error!("Failed to encode delta for {}: {e}", self.room);
                    }
                }
                Err(e) => {
                    log::warn!("Dropped delta from {connection} in {}: {e}", self.room);
                    self.resync(&connection, ResyncReason::MalformedDelta);
                }
            },
        }
    }

    fn sync(&mut self, connection: &ConnectionId, state_vector: &[u8]) {
        if !self.members.contains(connection) {
            return;
        }
        let msg = match self.replica.encode_delta_since(state_vector) {
            Ok(update) => ServerMessage::SyncReply {
                room: self.room.clone(),
                update,
            },
            Err(e) => ServerMessage::error(
                Some(self.room.clone()),
                ErrorKind::BadStateVector,
                e.to_string(),
            ),
        };
        self.reply(connection, &msg);
    }

    fn resync(&mut self, connection: &ConnectionId, reason: ResyncReason) {
        let msg = ServerMessage::Resync {
            room: self.room.clone(),
            reason,
        };
        self.reply(connection, &msg);
    }

    fn reply(&mut self, connection: &ConnectionId, msg: &ServerMessage) {
        if let Err(e) = self.members.send_to(connection, msg) {
            log::error!("Failed to encode reply for {connection} in {}: {e}", self.room);
        }
    }

    /// Tell everyone but `origin` about a presence change.
    fn announce(&mut self, origin: &ConnectionId, change: PresenceChange) {
        let msg = match change {
            PresenceChange::Updated(record) => ServerMessage::Presence {
                room: self.room.clone(),
                record,
            },
            PresenceChange::Removed(connection) => ServerMessage::PresenceRemoved {
                room: self.room.clone(),
                connection,
            },
        };
        if let Err(e) = self.members.broadcast_except(Some(origin), &msg) {
            log::error!("Failed to encode presence for {}: {e}", self.room);
        }
    }

    // ─── Draining ───────────────────────────────────────────────────

    /// Persist and leave the registry.
    ///
    /// Commands queued meanwhile are handled in place. Only a join that
    /// adds a member ends the drain early; the final save is attempted once
    /// per drain however many commands arrive.
    async fn drain(&mut self) -> DrainExit {
        self.set_phase(RoomPhase::Draining);
        let mut saved = !self.dirty;

        loop {
            while let Ok(command) = self.commands.try_recv() {
                let joining = command.materializes();
                if joining {
                    self.set_phase(RoomPhase::Active);
                }
                if let Flow::Shutdown(done) = self.handle(command) {
                    return DrainExit::Shutdown(Some(done));
                }
                if !self.members.is_empty() {
                    log::debug!("Drain of room {} cancelled by a rejoin", self.room);
                    return DrainExit::Rejoined;
                }
                if joining {
                    self.set_phase(RoomPhase::Draining);
                }
            }

            if !saved {
                saved = true;
                let policy = self.save_policy();
                if self.persist(policy).await {
                    self.save_abandoned = false;
                } else {
                    self.save_abandoned = true;
                    log::error!(
                        "Evicting room {} without a final save; edits since the last save are lost",
                        self.room
                    );
                }
                continue;
            }

            if self
                .registry
                .try_evict(&self.room, self.generation, &self.commands)
                .await
            {
                return DrainExit::Evicted;
            }
        }
    }

    /// Full retries, or a single attempt right after a drain gave up.
    fn save_policy(&self) -> RetryPolicy {
        if self.save_abandoned {
            RetryPolicy::once()
        } else {
            self.registry.config().save_retry
        }
    }

    /// Save the full replica state. Returns `true` on success.
    async fn persist(&mut self, policy: RetryPolicy) -> bool {
        if self.degraded && !self.reconcile().await {
            log::warn!(
                "Not saving room {}: stored state is still unreadable and would be overwritten",
                self.room
            );
            return false;
        }

        let state = self.replica.encode_full_state();
        let bridge = self.registry.bridge();
        let mut attempt = 1;
        loop {
            match bridge.save_snapshot(&self.document, &state).await {
                Ok(()) => {
                    Counters::bump(&self.registry.counters().snapshots_saved);
                    self.dirty = false;
                    log::info!("Saved room {} ({} bytes)", self.room, state.len());
                    return true;
                }
                Err(e) => {
                    Counters::bump(&self.registry.counters().save_failures);
                    if attempt >= policy.attempts() {
                        log::error!(
                            "Saving room {} failed after {attempt} attempts: {e}",
                            self.room
                        );
                        return false;
                    }
                    log::warn!("Save attempt {attempt} for room {} failed: {e}", self.room);
                    tokio::time::sleep(policy.backoff(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Merge the stored snapshot that hydration could not read.
    async fn reconcile(&mut self) -> bool {
        let policy = self.registry.config().load_retry;
        match self.load(policy).await {
            Ok(Some(snapshot)) => {
                if let Err(e) = self.replica.apply_delta(&snapshot) {
                    log::warn!("Stored state for {} is unreadable, replacing it: {e}", self.room);
                } else {
                    log::info!("Merged late-loaded stored state into room {}", self.room);
                }
                self.degraded = false;
                true
            }
            Ok(None) | Err(PersistenceError::CorruptSnapshot { .. }) => {
                self.degraded = false;
                true
            }
            Err(e) => {
                log::warn!("Stored state for {} still unavailable: {e}", self.room);
                false
            }
        }
    }
}

/// Next checkpoint tick, or never when checkpointing is off.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending::<()>().await,
    }
}
