//! Process-wide room registry.
//!
//! Maps each live [`RoomId`] to the command queue of the actor task that owns
//! the room. The registry lock is the single serialization point for room
//! lifecycle decisions:
//!
//! - commands are enqueued while holding the lock
//! - only a join may materialize a room; it spawns the actor under the lock,
//!   so a second join for the same id always finds the first actor
//! - an actor removes its own entry under the lock, and only if its queue is
//!   empty at that moment; anything queued is handled first
//!
//! Together these mean a room is hydrated at most once per incarnation and a
//! join racing a drain either lands in the old actor (which resumes) or
//! creates a fresh one after the old one is gone, never both.
//!
//! ```text
//!  Relay ──dispatch──► Mutex<HashMap<RoomId, RoomSlot>> ──unbounded──► RoomActor
//!                               ▲                                         │
//!                               └───────────── try_evict ─────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::ids::RoomId;
use crate::persistence::PersistenceBridge;
use crate::presence::PresenceRecord;
use crate::room::{RoomActor, RoomCommand, RoomPhase, RoomSnapshot};

/// How often, and how patiently, a storage call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub attempts: u32,
    /// Wait before the second attempt; doubled for every further attempt.
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// A single attempt.
    pub fn once() -> Self {
        Self {
            attempts: 1,
            initial_backoff: Duration::ZERO,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX))
    }
}

/// Room configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Outbound queue capacity per connection (default: 256)
    pub outbound_capacity: usize,
    /// Maximum members per room (default: 100)
    pub max_members: usize,
    /// Retry policy for hydration reads (default: 3 attempts, 100ms)
    pub load_retry: RetryPolicy,
    /// Retry policy for drain and checkpoint writes (default: 5 attempts, 200ms)
    pub save_retry: RetryPolicy,
    /// Save dirty rooms on this period while they are active (default: off)
    pub checkpoint_interval: Option<Duration>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            max_members: 100,
            load_retry: RetryPolicy {
                attempts: 3,
                initial_backoff: Duration::from_millis(100),
            },
            save_retry: RetryPolicy {
                attempts: 5,
                initial_backoff: Duration::from_millis(200),
            },
            checkpoint_interval: None,
        }
    }
}

impl RoomConfig {
    /// Create config for testing (tiny backoffs).
    pub fn for_testing() -> Self {
        Self {
            outbound_capacity: 64,
            max_members: 16,
            load_retry: RetryPolicy {
                attempts: 2,
                initial_backoff: Duration::from_millis(1),
            },
            save_retry: RetryPolicy {
                attempts: 3,
                initial_backoff: Duration::from_millis(1),
            },
            checkpoint_interval: None,
        }
    }
}

/// Registry-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub hydrations: u64,
    pub corrupt_snapshots: u64,
    pub degraded_hydrations: u64,
    pub snapshots_saved: u64,
    pub save_failures: u64,
    pub evictions: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub hydrations: AtomicU64,
    pub corrupt_snapshots: AtomicU64,
    pub degraded_hydrations: AtomicU64,
    pub snapshots_saved: AtomicU64,
    pub save_failures: AtomicU64,
    pub evictions: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct RoomSlot {
    commands: mpsc::UnboundedSender<RoomCommand>,
    phase: watch::Receiver<RoomPhase>,
    generation: u64,
}

struct Inner {
    rooms: Mutex<HashMap<RoomId, RoomSlot>>,
    bridge: PersistenceBridge,
    config: RoomConfig,
    counters: Counters,
    next_generation: AtomicU64,
}

/// Registry of live rooms. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<Inner>,
}

impl RoomRegistry {
    pub fn new(bridge: PersistenceBridge, config: RoomConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                rooms: Mutex::new(HashMap::new()),
                bridge,
                config,
                counters: Counters::default(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.inner.config
    }

    pub(crate) fn bridge(&self) -> &PersistenceBridge {
        &self.inner.bridge
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.inner.counters
    }

    /// Enqueue `command` for the room's actor.
    ///
    /// A join materializes the room if it is absent. Any other command for
    /// an absent room is dropped and `false` is returned.
    pub(crate) async fn dispatch(&self, room: &RoomId, command: RoomCommand) -> bool {
        let mut rooms = self.inner.rooms.lock().await;

        let command = match rooms.get(room) {
            Some(slot) => match slot.commands.send(command) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(command)) => {
                    log::error!("Room {room} actor exited without deregistering");
                    rooms.remove(room);
                    command
                }
            },
            None => command,
        };

        if !command.materializes() {
            return false;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(RoomPhase::Hydrating);
        // Cannot fail: the receiver is alive until the actor runs.
        let _ = tx.send(command);
        rooms.insert(
            room.clone(),
            RoomSlot {
                commands: tx,
                phase: phase_rx,
                generation,
            },
        );
        log::debug!("Room {room} materialized (generation {generation})");

        let actor = RoomActor::new(room.clone(), generation, self.clone(), rx, phase_tx);
        tokio::spawn(actor.run());
        true
    }

    /// Remove the room's entry if nothing is waiting in its queue.
    ///
    /// Called by the actor itself when it has drained. Returns `false` if a
    /// command slipped in; the actor handles it and tries again.
    pub(crate) async fn try_evict(
        &self,
        room: &RoomId,
        generation: u64,
        commands: &mpsc::UnboundedReceiver<RoomCommand>,
    ) -> bool {
        let mut rooms = self.inner.rooms.lock().await;
        if !commands.is_empty() {
            return false;
        }
        if rooms.get(room).is_some_and(|slot| slot.generation == generation) {
            rooms.remove(room);
            Counters::bump(&self.inner.counters.evictions);
        }
        true
    }

    /// Deregister unconditionally; used on shutdown.
    pub(crate) async fn evict(&self, room: &RoomId, generation: u64) {
        let mut rooms = self.inner.rooms.lock().await;
        if rooms.get(room).is_some_and(|slot| slot.generation == generation) {
            rooms.remove(room);
            Counters::bump(&self.inner.counters.evictions);
        }
    }

    // ─── Introspection ──────────────────────────────────────────────

    /// Current lifecycle phase; `None` if the room is absent.
    pub async fn phase(&self, room: &RoomId) -> Option<RoomPhase> {
        let rooms = self.inner.rooms.lock().await;
        rooms.get(room).map(|slot| *slot.phase.borrow())
    }

    pub async fn contains(&self, room: &RoomId) -> bool {
        self.inner.rooms.lock().await.contains_key(room)
    }

    pub async fn room_count(&self) -> usize {
        self.inner.rooms.lock().await.len()
    }

    /// Everyone online in the room.
    pub async fn presence(&self, room: &RoomId) -> Option<Vec<PresenceRecord>> {
        self.inspect(room).await.map(|s| s.presence)
    }

    /// Full encoded replica state of a live room.
    pub async fn encoded_state(&self, room: &RoomId) -> Option<Vec<u8>> {
        self.inspect(room).await.map(|s| s.state)
    }

    pub async fn member_count(&self, room: &RoomId) -> Option<usize> {
        self.inspect(room).await.map(|s| s.members)
    }

    /// Consistent view of a live room, answered by its actor.
    pub async fn inspect(&self, room: &RoomId) -> Option<RoomSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.dispatch(room, RoomCommand::Inspect { reply }).await {
            return None;
        }
        rx.await.ok()
    }

    pub async fn stats(&self) -> RegistryStats {
        let c = &self.inner.counters;
        RegistryStats {
            active_rooms: self.room_count().await,
            hydrations: c.hydrations.load(Ordering::Relaxed),
            corrupt_snapshots: c.corrupt_snapshots.load(Ordering::Relaxed),
            degraded_hydrations: c.degraded_hydrations.load(Ordering::Relaxed),
            snapshots_saved: c.snapshots_saved.load(Ordering::Relaxed),
            save_failures: c.save_failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
        }
    }

    /// Persist every live room and stop its actor.
    ///
    /// Members receive nothing further; their connections are expected to
    /// be closing as well.
    pub async fn shutdown(&self) {
        let rooms: Vec<RoomId> = self.inner.rooms.lock().await.keys().cloned().collect();
        let mut pending = Vec::with_capacity(rooms.len());
        for room in rooms {
            let (done, rx) = oneshot::channel();
            if self.dispatch(&room, RoomCommand::Shutdown { done }).await {
                pending.push(rx);
            }
        }
        for rx in pending {
            let _ = rx.await;
        }
        log::info!("Room registry shut down");
    }
}
