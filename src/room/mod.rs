#![forbid(unsafe_code)]

// Room registry - room membership and call presence bookkeeping

use crate::metrics::ServerMetrics;
use crate::signaling::protocol::ServerMessage;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

/// The two call flavors a room tracks presence for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Video,
    Voice,
}

impl CallKind {
    pub const ALL: [CallKind; 2] = [CallKind::Video, CallKind::Voice];

    pub fn name(&self) -> &'static str {
        match self {
            CallKind::Video => "video",
            CallKind::Voice => "voice",
        }
    }
}

/// Room state: the member connections subscribed to the room plus one
/// presence set per call kind. Presence entries exist only while non-empty.
pub struct Room {
    pub id: String,
    members: HashMap<String, mpsc::Sender<Arc<String>>>,
    presence: HashMap<CallKind, HashSet<String>>,
}

impl Room {
    fn new(id: String) -> Self {
        Self {
            id,
            members: HashMap::new(),
            presence: HashMap::new(),
        }
    }

    /// Add a connection to the presence set for `kind`, creating the set if
    /// absent. Idempotent.
    fn presence_insert(&mut self, kind: CallKind, conn_id: &str) {
        self.presence
            .entry(kind)
            .or_default()
            .insert(conn_id.to_string());
    }

    /// Remove a connection from the presence set for `kind`. Deletes the
    /// whole entry when the set empties. Returns whether the connection was
    /// present.
    fn presence_remove(&mut self, kind: CallKind, conn_id: &str) -> bool {
        let Some(set) = self.presence.get_mut(&kind) else {
            return false;
        };
        let was_present = set.remove(conn_id);
        if set.is_empty() {
            self.presence.remove(&kind);
        }
        was_present
    }

    /// Broadcast a message to all members except the sender
    fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for (id, member) in &self.members {
            if id != sender_id {
                self.try_deliver(id, member, json.clone());
            }
        }
    }

    /// Broadcast a message to all members, sender included
    fn broadcast_all(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for (id, member) in &self.members {
            self.try_deliver(id, member, json.clone());
        }
    }

    fn try_deliver(&self, id: &str, member: &mpsc::Sender<Arc<String>>, json: Arc<String>) {
        match member.try_send(json) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Channel full for connection {} in room {}, dropping message", id, self.id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel closed for connection {} in room {} (disconnected)", id, self.id);
            }
        }
    }
}

/// Process-wide registry of rooms and their call presence sets.
///
/// Constructed once at server start and passed by reference to all handlers.
/// Rooms spring into existence on first join and are pruned when the last
/// member leaves; no room state persists across restarts.
///
/// Uses per-room locking: the outer HashMap is protected by a std::sync::RwLock
/// (held only for brief lookups/inserts, never across await points), while each
/// room is protected by its own tokio::sync::RwLock, so mutations of a given
/// room are serialized without blocking the rest of the registry.
pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(metrics: ServerMetrics) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Gets a room lock by ID (brief outer read lock, no await)
    fn get_room(&self, room_id: &str) -> Option<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    /// Gets or creates a room. Rooms are never created explicitly; any
    /// client-supplied identifier vivifies one.
    fn get_or_create_room(&self, room_id: &str) -> Arc<TokioRwLock<Room>> {
        // Fast path: room exists (brief outer read lock)
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        // Re-check under write lock (handles concurrent creation)
        if let Some(existing) = rooms.get(room_id) {
            return existing.clone();
        }
        info!("Creating new room: {}", room_id);
        self.metrics.inc_rooms_created();
        let room = Arc::new(TokioRwLock::new(Room::new(room_id.to_string())));
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    /// Removes the room if its member set is empty.
    fn prune_if_empty(&self, room_id: &str) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if let Some(room_lock) = rooms.get(room_id) {
            // try_write: a concurrent join holding the room lock means it is not empty
            if room_lock.try_write().is_ok_and(|room| room.members.is_empty()) {
                rooms.remove(room_id);
                info!("Room {} is empty, cleaning up", room_id);
            }
        }
    }

    /// Adds a member connection to a room (creates the room if needed)
    pub async fn add_member(
        &self,
        room_id: &str,
        conn_id: String,
        sender: mpsc::Sender<Arc<String>>,
    ) {
        let room_lock = self.get_or_create_room(room_id);
        let mut room = room_lock.write().await;
        room.members.insert(conn_id.clone(), sender);
        info!("Connection {} joined room {}", conn_id, room_id);
    }

    /// Removes a member on transport disconnect: drops it from every call
    /// presence set it was in, notifies the remaining members with a "left"
    /// message per kind, and prunes the room when the member set empties.
    ///
    /// Mirrors explicit call-end semantics so a vanished peer never leaves
    /// dangling presence entries or an unnotified partner.
    pub async fn disconnect_member(&self, room_id: &str, conn_id: &str) {
        let Some(room_lock) = self.get_room(room_id) else {
            return;
        };

        let room_empty = {
            let mut room = room_lock.write().await;
            if room.members.remove(conn_id).is_none() {
                return;
            }
            info!("Connection {} left room {}", conn_id, room_id);

            for kind in CallKind::ALL {
                if room.presence_remove(kind, conn_id) {
                    debug!("Connection {} dropped from {} call in room {}", conn_id, kind.name(), room_id);
                    room.broadcast_all(&ServerMessage::call_left(kind, conn_id));
                    self.metrics.inc_call_leaves();
                }
            }

            room.members.is_empty()
        }; // release per-room lock before outer write

        if room_empty {
            self.prune_if_empty(room_id);
        }
    }

    /// Idempotently adds a connection to the presence set for (room, kind);
    /// creates the set if absent. Always succeeds.
    pub async fn join_call_presence(&self, room_id: &str, kind: CallKind, conn_id: &str) {
        let room_lock = self.get_or_create_room(room_id);
        let mut room = room_lock.write().await;
        room.presence_insert(kind, conn_id);
        debug!("Connection {} joined {} call in room {}", conn_id, kind.name(), room_id);
    }

    /// Removes a connection from the presence set for (room, kind); deletes
    /// the entry when the set empties. No-op if the connection was never
    /// present. Returns whether it was present, so callers can notify peers
    /// exactly once.
    pub async fn leave_call_presence(&self, room_id: &str, kind: CallKind, conn_id: &str) -> bool {
        let Some(room_lock) = self.get_room(room_id) else {
            return false;
        };
        let mut room = room_lock.write().await;
        let was_present = room.presence_remove(kind, conn_id);
        if was_present {
            debug!("Connection {} left {} call in room {}", conn_id, kind.name(), room_id);
        }
        was_present
    }

    /// Query: whether the presence set for (room, kind) is empty. Absent
    /// entries count as empty. No side effects.
    pub async fn call_presence_is_empty(&self, room_id: &str, kind: CallKind) -> bool {
        let Some(room_lock) = self.get_room(room_id) else {
            return true;
        };
        let room = room_lock.read().await;
        room.presence.get(&kind).is_none_or(|set| set.is_empty())
    }

    /// Chat fan-out: delivers to every room member including the sender, so
    /// the sender's UI renders its own messages through the same path as
    /// remote ones.
    pub async fn broadcast_all(&self, room_id: &str, message: &ServerMessage) {
        let Some(room_lock) = self.get_room(room_id) else {
            return;
        };
        let room = room_lock.read().await;
        room.broadcast_all(message);
    }

    /// Signaling fan-out: delivers to every room member except the sender.
    pub async fn broadcast_except(&self, room_id: &str, sender_id: &str, message: &ServerMessage) {
        let Some(room_lock) = self.get_room(room_id) else {
            return;
        };
        let room = room_lock.read().await;
        room.broadcast_except(sender_id, message);
    }

    /// Gets current room count
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Gets total member count across all rooms
    pub async fn total_member_count(&self) -> usize {
        let room_locks: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };

        let mut total = 0;
        for room_lock in room_locks {
            if let Ok(room) = room_lock.try_read() {
                total += room.members.len();
            }
        }
        total
    }

    /// Drops all rooms. All state is volatile by design; this only logs what
    /// was discarded.
    pub fn shutdown(&self) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let count = rooms.len();
        rooms.clear();
        info!("All rooms shut down ({} total)", count);
    }
}

#[cfg(test)]
impl RoomRegistry {
    /// Test accessor: whether a connection is in the (room, kind) presence set.
    pub async fn call_presence_contains(&self, room_id: &str, kind: CallKind, conn_id: &str) -> bool {
        let Some(room_lock) = self.get_room(room_id) else {
            return false;
        };
        let room = room_lock.read().await;
        room.presence.get(&kind).is_some_and(|set| set.contains(conn_id))
    }

    /// Test accessor: whether a (room, kind) presence entry exists at all.
    /// Distinguishes "deleted entry" from "present but empty set".
    pub async fn has_presence_entry(&self, room_id: &str, kind: CallKind) -> bool {
        let Some(room_lock) = self.get_room(room_id) else {
            return false;
        };
        let room = room_lock.read().await;
        room.presence.contains_key(&kind)
    }

    /// Test accessor: whether a connection is a member of the room.
    pub async fn is_member(&self, room_id: &str, conn_id: &str) -> bool {
        let Some(room_lock) = self.get_room(room_id) else {
            return false;
        };
        let room = room_lock.read().await;
        room.members.contains_key(conn_id)
    }
}
