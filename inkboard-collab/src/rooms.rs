//! Room membership and fan-out.
//!
//! Each room maps to the connections currently joined to it. A room entry
//! exists only while it has members. Broadcasts take a snapshot of the
//! membership under a read lock and deliver outside of it; members whose
//! transport has gone away are pruned afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::protocol::{ProtocolError, ServerEvent};
use crate::registry::{ConnectionHandle, ConnectionId, Frame};

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub messages_sent: u64,
    pub frames_delivered: u64,
    pub members_pruned: u64,
    pub active_rooms: usize,
}

/// Lock-free counters, updated on the broadcast path without the room lock.
#[derive(Default)]
struct AtomicRoomStats {
    messages_sent: AtomicU64,
    frames_delivered: AtomicU64,
    members_pruned: AtomicU64,
}

/// Members of a single room.
#[derive(Default)]
struct Room {
    members: HashMap<ConnectionId, ConnectionHandle>,
}

/// Room id → member set.
#[derive(Default)]
pub struct RoomDirectory {
    rooms: RwLock<HashMap<String, Room>>,
    stats: Arc<AtomicRoomStats>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room, creating the room if needed.
    ///
    /// Returns `false` if the connection was already a member.
    pub async fn join(&self, room_id: &str, conn: &ConnectionHandle) -> bool {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_default();
        room.members.insert(conn.id(), conn.clone()).is_none()
    }

    /// Remove a connection from a room; an emptied room is deleted.
    ///
    /// Returns `false` if the connection was not a member.
    pub async fn leave(&self, room_id: &str, conn_id: ConnectionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };
        let removed = room.members.remove(&conn_id).is_some();
        if room.members.is_empty() {
            rooms.remove(room_id);
            log::debug!("Room {room_id} removed (empty)");
        }
        removed
    }

    /// Remove a connection from every room it belongs to.
    ///
    /// Returns the rooms it was removed from.
    pub async fn leave_all(&self, conn_id: ConnectionId) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        rooms.retain(|room_id, room| {
            if room.members.remove(&conn_id).is_some() {
                left.push(room_id.clone());
            }
            !room.members.is_empty()
        });
        left
    }

    /// Encode an event once and fan it out to the room.
    pub async fn broadcast(
        &self,
        room_id: &str,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        let frame: Frame = Arc::from(event.encode()?);
        Ok(self.broadcast_raw(room_id, frame, exclude).await)
    }

    /// Send a pre-encoded frame to every member except `exclude`.
    ///
    /// Each member receives the frame at most once per call. Returns the
    /// number of members it was delivered to.
    pub async fn broadcast_raw(
        &self,
        room_id: &str,
        frame: Frame,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let snapshot: Vec<ConnectionHandle> = {
            let rooms = self.rooms.read().await;
            match rooms.get(room_id) {
                Some(room) => room.members.values().cloned().collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for member in &snapshot {
            if Some(member.id()) == exclude {
                continue;
            }
            if member.send_frame(frame.clone()) {
                delivered += 1;
            } else {
                closed.push(member.id());
            }
        }

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .frames_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);

        if !closed.is_empty() {
            self.prune(room_id, &closed).await;
        }
        delivered
    }

    /// Drop members whose transport is closed.
    async fn prune(&self, room_id: &str, closed: &[ConnectionId]) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        let mut pruned = 0u64;
        for conn_id in closed {
            let still_closed = room.members.get(conn_id).is_some_and(|m| !m.is_open());
            if still_closed {
                room.members.remove(conn_id);
                pruned += 1;
            }
        }
        if room.members.is_empty() {
            rooms.remove(room_id);
        }
        if pruned > 0 {
            log::debug!("Pruned {pruned} closed member(s) from room {room_id}");
            self.stats.members_pruned.fetch_add(pruned, Ordering::Relaxed);
        }
    }

    /// Ids of the current members of a room.
    pub async fn members(&self, room_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|room| room.members.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, room_id: &str, conn_id: ConnectionId) -> bool {
        self.rooms
            .read()
            .await
            .get(room_id)
            .is_some_and(|room| room.members.contains_key(&conn_id))
    }

    /// Rooms a connection currently belongs to.
    pub async fn rooms_of(&self, conn_id: ConnectionId) -> Vec<String> {
        self.rooms
            .read()
            .await
            .iter()
            .filter(|(_, room)| room.members.contains_key(&conn_id))
            .map(|(room_id, _)| room_id.clone())
            .collect()
    }

    pub async fn contains_room(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn stats(&self) -> RoomStats {
        let active_rooms = self.rooms.read().await.len();
        RoomStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            members_pruned: self.stats.members_pruned.load(Ordering::Relaxed),
            active_rooms,
        }
    }
}
