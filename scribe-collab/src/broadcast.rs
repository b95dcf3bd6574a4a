//! Fan-out to N-1 room members with per-member backpressure.
//!
//! Each member owns a bounded outbound queue. A broadcast encodes the
//! message once and offers the same `Arc` to every member except the
//! sender with `try_send`, so a slow or vanished peer never stalls the room:
//! - queue full  → message dropped for that member, member marked lagged
//! - queue closed → peer is going away, ignored
//!
//! A lagged member gets nothing further until [`ResyncReason::Lagged`] has
//! been queued for it, which happens as soon as its queue has room again, so
//! that it re-fetches the state it missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::ids::{ConnectionId, RoomId};
use crate::protocol::{ProtocolError, ResyncReason, ServerMessage};

/// Encoded frame shared by every recipient of a broadcast.
pub type Frame = Arc<Vec<u8>>;

/// Outbound queue of one connection.
pub type Outbound = mpsc::Sender<Frame>;

/// Whether a member may change the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Edit,
    ReadOnly,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

struct Member {
    outbound: Outbound,
    access: Access,
    /// Set while a resync notice is waiting for queue capacity.
    lagged: Arc<AtomicBool>,
}

/// Members of one room and the fan-out between them.
pub struct BroadcastGroup {
    room: RoomId,
    members: HashMap<ConnectionId, Member>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(room: RoomId) -> Self {
        Self {
            room,
            members: HashMap::new(),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Add or re-register a member. Returns `true` if it is new.
    pub fn add_member(&mut self, id: ConnectionId, outbound: Outbound, access: Access) -> bool {
        self.members
            .insert(
                id,
                Member {
                    outbound,
                    access,
                    lagged: Arc::new(AtomicBool::new(false)),
                },
            )
            .is_none()
    }

    pub fn remove_member(&mut self, id: &ConnectionId) -> bool {
        self.members.remove(id).is_some()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.members.contains_key(id)
    }

    pub fn access(&self, id: &ConnectionId) -> Option<Access> {
        self.members.get(id).map(|m| m.access)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Encode `msg` once and offer it to every member except `origin`.
    ///
    /// Returns the number of members the frame was queued for.
    pub fn broadcast_except(
        &mut self,
        origin: Option<&ConnectionId>,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let frame: Frame = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(origin, frame))
    }

    /// Fan out a pre-encoded frame.
    pub fn broadcast_raw(&mut self, origin: Option<&ConnectionId>, frame: Frame) -> usize {
        let room = self.room.clone();
        let mut delivered = 0;
        for (id, member) in self.members.iter_mut() {
            if Some(id) == origin {
                continue;
            }
            if deliver(&room, id, member, frame.clone(), &self.messages_dropped) {
                delivered += 1;
            }
        }
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Send a message to one member only.
    pub fn send_to(&mut self, id: &ConnectionId, msg: &ServerMessage) -> Result<bool, ProtocolError> {
        let frame: Frame = Arc::new(msg.encode()?);
        let room = self.room.clone();
        Ok(match self.members.get_mut(id) {
            Some(member) => deliver(&room, id, member, frame, &self.messages_dropped),
            None => false,
        })
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_members: self.members.len(),
        }
    }
}

fn deliver(
    room: &RoomId,
    id: &ConnectionId,
    member: &mut Member,
    frame: Frame,
    dropped: &AtomicU64,
) -> bool {
    if member.lagged.load(Ordering::Acquire) {
        dropped.fetch_add(1, Ordering::Relaxed);
        return false;
    }

    match member.outbound.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            log::warn!("Member {id} of room {room} is lagging, dropping broadcasts");
            member.lagged.store(true, Ordering::Release);
            dropped.fetch_add(1, Ordering::Relaxed);
            resync_when_ready(room, member);
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Queue a lag notice for `member` once its queue has capacity.
fn resync_when_ready(room: &RoomId, member: &Member) {
    let notice = ServerMessage::Resync {
        room: room.clone(),
        reason: ResyncReason::Lagged,
    };
    let frame: Frame = match notice.encode() {
        Ok(bytes) => Arc::new(bytes),
        Err(e) => {
            log::error!("Failed to encode resync notice for {room}: {e}");
            member.lagged.store(false, Ordering::Release);
            return;
        }
    };
    let outbound = member.outbound.clone();
    let lagged = member.lagged.clone();
    tokio::spawn(async move {
        // Errors only once the connection has gone away.
        if let Ok(permit) = outbound.reserve().await {
            permit.send(frame);
        }
        lagged.store(false, Ordering::Release);
    });
}
