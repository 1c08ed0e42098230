#![forbid(unsafe_code)]

// Session registry - lecture id -> Room, connection id -> peer location
// Pure index. Mutations of a Room's peer set are serialized by the Room's own
// lock; the maps here only guard insert/remove of the index entries.

use crate::media::types::{ConnectionId, LectureId, UserId};
use crate::room::Room;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

/// Where a connection's Peer lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRef {
    pub lecture_id: LectureId,
    pub user_id: UserId,
}

#[derive(Default)]
pub struct SessionRegistry {
    rooms: StdRwLock<HashMap<LectureId, Arc<Room>>>,
    peers: StdRwLock<HashMap<ConnectionId, PeerRef>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `room` unless one is already registered for its lecture.
    /// Returns the room back on conflict.
    pub fn try_register_room(&self, room: Arc<Room>) -> Result<(), Arc<Room>> {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        match rooms.entry(room.lecture_id().clone()) {
            std::collections::hash_map::Entry::Occupied(_) => Err(room),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(room);
                Ok(())
            }
        }
    }

    pub fn get_room(&self, lecture_id: &LectureId) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(lecture_id)
            .cloned()
    }

    /// Removes the entry only if it still points at `room`
    pub fn remove_room(&self, room: &Arc<Room>) -> bool {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        match rooms.get(room.lecture_id()) {
            Some(current) if Arc::ptr_eq(current, room) => {
                rooms.remove(room.lecture_id());
                true
            }
            _ => false,
        }
    }

    pub fn has_room(&self, lecture_id: &LectureId) -> bool {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(lecture_id)
    }

    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn register_peer(&self, connection_id: ConnectionId, peer: PeerRef) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(connection_id, peer);
    }

    pub fn get_peer(&self, connection_id: &ConnectionId) -> Option<PeerRef> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(connection_id)
            .cloned()
    }

    pub fn remove_peer(&self, connection_id: &ConnectionId) -> Option<PeerRef> {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(connection_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
