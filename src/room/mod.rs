#![forbid(unsafe_code)]

// Room module - one live lecture: router handle, host, and peer set
// All mutations of a room and its peers' resource maps happen under the
// room's mutex, whether they come from a signaling call or from an engine
// event delivered by the room's event pump.

pub mod peer;

use crate::error::{SignalingError, SignalingResult};
use crate::media::types::{
    ConnectionId, ConsumerId, LectureId, ProducerId, RouterId, TransportId, UserId,
};
use crate::media::{EngineEvent, MediaRouter};
use crate::signaling::protocol::{ProducerSummary, ServerMessage};
use peer::Peer;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Active,
    /// Terminal
    Ended,
}

/// Room handle shared through the registry
pub struct Room {
    lecture_id: LectureId,
    router_id: RouterId,
    state: Mutex<RoomState>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("lecture_id", &self.lecture_id)
            .field("router_id", &self.router_id)
            .finish_non_exhaustive()
    }
}

impl Room {
    pub fn new(lecture_id: LectureId, router: Arc<dyn MediaRouter>, host: ConnectionId) -> Self {
        Self {
            router_id: router.id(),
            state: Mutex::new(RoomState {
                lecture_id: lecture_id.clone(),
                status: RoomStatus::Active,
                router: Some(router),
                host,
                peers: HashMap::new(),
                users: HashMap::new(),
                transport_owners: HashMap::new(),
                producer_owners: HashMap::new(),
                consumer_owners: HashMap::new(),
            }),
            lecture_id,
        }
    }

    pub fn lecture_id(&self) -> &LectureId {
        &self.lecture_id
    }

    pub fn router_id(&self) -> &RouterId {
        &self.router_id
    }

    /// Enters the room's critical section
    pub async fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }
}

/// Locks two different rooms, always in lecture-id order, so callers that
/// hold both never wait on each other. Guards come back as `(first, second)`.
pub async fn lock_pair<'a>(
    first: &'a Room,
    second: &'a Room,
) -> (MutexGuard<'a, RoomState>, MutexGuard<'a, RoomState>) {
    if first.lecture_id <= second.lecture_id {
        let a = first.lock().await;
        let b = second.lock().await;
        (a, b)
    } else {
        let b = second.lock().await;
        let a = first.lock().await;
        (a, b)
    }
}

/// Applies engine events to the room until the engine drops its sender or
/// the room is gone.
pub fn spawn_event_pump(room: &Arc<Room>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    let weak: Weak<Room> = Arc::downgrade(room);
    let lecture_id = room.lecture_id.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(room) = weak.upgrade() else { break };
            let mut state = room.lock().await;
            if state.status == RoomStatus::Ended {
                break;
            }
            state.apply(event);
        }
        debug!("Event pump finished for lecture {}", lecture_id);
    });
}

/// Mutable room contents, only reachable through [`Room::lock`]
pub struct RoomState {
    lecture_id: LectureId,
    status: RoomStatus,
    router: Option<Arc<dyn MediaRouter>>,
    /// Connection of the host; its departure ends the lecture
    host: ConnectionId,
    peers: HashMap<ConnectionId, Peer>,
    users: HashMap<UserId, ConnectionId>,
    transport_owners: HashMap<TransportId, ConnectionId>,
    producer_owners: HashMap<ProducerId, ConnectionId>,
    consumer_owners: HashMap<ConsumerId, ConnectionId>,
}

impl RoomState {
    pub fn lecture_id(&self) -> &LectureId {
        &self.lecture_id
    }

    pub fn status(&self) -> RoomStatus {
        self.status
    }

    /// Fails for a room that has already ended; its registry entry may
    /// still be visible to a caller that looked it up before teardown.
    pub fn ensure_active(&self) -> SignalingResult<()> {
        match self.status {
            RoomStatus::Active => Ok(()),
            RoomStatus::Ended => Err(SignalingError::RoomNotFound(self.lecture_id.clone())),
        }
    }

    pub fn router(&self) -> SignalingResult<Arc<dyn MediaRouter>> {
        self.router
            .clone()
            .ok_or_else(|| SignalingError::NoRouter(self.lecture_id.clone()))
    }

    pub fn host(&self) -> &ConnectionId {
        &self.host
    }

    pub fn is_host(&self, connection_id: &ConnectionId) -> bool {
        &self.host == connection_id
    }

    pub fn set_host(&mut self, connection_id: ConnectionId) {
        info!("Host of lecture {} moved to connection {}", self.lecture_id, connection_id);
        self.host = connection_id;
    }

    pub fn peer(&self, connection_id: &ConnectionId) -> SignalingResult<&Peer> {
        self.peers.get(connection_id).ok_or(SignalingError::NoPeer)
    }

    pub fn peer_mut(&mut self, connection_id: &ConnectionId) -> SignalingResult<&mut Peer> {
        self.peers.get_mut(connection_id).ok_or(SignalingError::NoPeer)
    }

    pub fn has_peer(&self, connection_id: &ConnectionId) -> bool {
        self.peers.contains_key(connection_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Active connection of `user_id` in this room
    pub fn connection_of(&self, user_id: &UserId) -> Option<&ConnectionId> {
        self.users.get(user_id)
    }

    pub fn add_peer(&mut self, peer: Peer) {
        self.users.insert(peer.user_id.clone(), peer.connection_id.clone());
        self.peers.insert(peer.connection_id.clone(), peer);
    }

    pub fn register_transport(&mut self, owner: &ConnectionId, transport_id: TransportId) {
        self.transport_owners.insert(transport_id, owner.clone());
    }

    pub fn register_producer(&mut self, owner: &ConnectionId, producer_id: ProducerId) {
        self.producer_owners.insert(producer_id, owner.clone());
    }

    pub fn register_consumer(&mut self, owner: &ConnectionId, consumer_id: ConsumerId) {
        self.consumer_owners.insert(consumer_id, owner.clone());
    }

    pub fn producer_owner(&self, producer_id: &ProducerId) -> Option<&ConnectionId> {
        self.producer_owners.get(producer_id)
    }

    /// Entries in the transport, producer and consumer owner indexes
    pub fn index_sizes(&self) -> (usize, usize, usize) {
        (
            self.transport_owners.len(),
            self.producer_owners.len(),
            self.consumer_owners.len(),
        )
    }

    /// Engine-side pause state. The cached flag on the entry trails it until
    /// the change is recorded.
    pub fn producer_paused(&self, producer_id: &ProducerId) -> Option<bool> {
        let owner = self.producer_owners.get(producer_id)?;
        self.peers.get(owner)?.producer(producer_id).map(|p| p.handle.paused())
    }

    /// Tracks of every peer except `connection_id`
    pub fn producers_except(&self, connection_id: &ConnectionId) -> Vec<ProducerSummary> {
        self.peers
            .values()
            .filter(|p| &p.connection_id != connection_id)
            .flat_map(Peer::producer_summaries)
            .collect()
    }

    /// Applies an engine lifecycle event. Events for resources that were
    /// already removed through an explicit call are ignored.
    pub fn apply(&mut self, event: EngineEvent) {
        debug!("Lecture {}: engine event {:?}", self.lecture_id, event);
        match event {
            EngineEvent::ProducerPaused { producer_id } => {
                self.set_producer_paused(&producer_id, true);
            }
            EngineEvent::ProducerResumed { producer_id } => {
                self.set_producer_paused(&producer_id, false);
            }
            EngineEvent::ProducerClosed { producer_id } => {
                self.remove_producer(&producer_id);
            }
            EngineEvent::ConsumerClosed { consumer_id } => {
                self.remove_consumer(&consumer_id, true);
            }
            EngineEvent::TransportClosed { transport_id } => {
                self.remove_transport(&transport_id);
            }
        }
    }

    /// Records a pause state change and tells the rest of the room.
    /// Returns false when nothing changed.
    pub fn set_producer_paused(&mut self, producer_id: &ProducerId, paused: bool) -> bool {
        let Some(owner) = self.producer_owners.get(producer_id).cloned() else {
            return false;
        };
        let Some(entry) = self.peers.get_mut(&owner).and_then(|p| p.producer_mut(producer_id)) else {
            return false;
        };
        if entry.paused == paused {
            return false;
        }
        entry.paused = paused;

        let message = if paused {
            ServerMessage::ProducerPaused { producer_id: producer_id.clone() }
        } else {
            ServerMessage::ProducerResumed { producer_id: producer_id.clone() }
        };
        self.broadcast_except(&owner, &message);
        true
    }

    /// Closes a producer and every consumer fed by it, in any peer.
    /// Returns false if the producer was already gone.
    pub fn remove_producer(&mut self, producer_id: &ProducerId) -> bool {
        let Some(owner) = self.producer_owners.remove(producer_id) else {
            return false;
        };
        if let Some(entry) = self.peers.get_mut(&owner).and_then(|p| p.remove_producer(producer_id)) {
            entry.handle.close();
        }

        let fed: Vec<ConsumerId> = self
            .peers
            .values()
            .flat_map(|p| p.consumers_of(producer_id))
            .collect();
        for consumer_id in fed {
            self.remove_consumer(&consumer_id, true);
        }

        debug!("Producer {} closed in lecture {}", producer_id, self.lecture_id);
        self.broadcast_except(&owner, &ServerMessage::ProducerClosed {
            producer_id: producer_id.clone(),
        });
        true
    }

    /// Closes a consumer. With `notify`, the owner is told it went away.
    pub fn remove_consumer(&mut self, consumer_id: &ConsumerId, notify: bool) -> bool {
        let Some(owner) = self.consumer_owners.remove(consumer_id) else {
            return false;
        };
        let Some(peer) = self.peers.get_mut(&owner) else {
            return false;
        };
        let Some(entry) = peer.remove_consumer(consumer_id) else {
            return false;
        };
        entry.handle.close();

        if notify {
            self.send_to(&owner, &ServerMessage::ConsumerClosed {
                consumer_id: consumer_id.clone(),
                producer_id: entry.producer_id,
            });
        }
        true
    }

    /// Drops a transport along with whatever still rides on it
    pub fn remove_transport(&mut self, transport_id: &TransportId) -> bool {
        let Some(owner) = self.transport_owners.remove(transport_id) else {
            return false;
        };
        let Some(peer) = self.peers.get(&owner) else {
            return false;
        };

        let consumers: Vec<ConsumerId> = peer
            .consumer_ids()
            .into_iter()
            .filter(|id| peer.consumer(id).is_some_and(|c| &c.transport_id == transport_id))
            .collect();
        let producers: Vec<ProducerId> = peer
            .producer_ids()
            .into_iter()
            .filter(|id| peer.producer(id).is_some_and(|p| &p.transport_id == transport_id))
            .collect();

        for consumer_id in consumers {
            self.remove_consumer(&consumer_id, true);
        }
        for producer_id in producers {
            self.remove_producer(&producer_id);
        }
        if let Some(transport) = self
            .peers
            .get_mut(&owner)
            .and_then(|p| p.remove_transport(transport_id))
        {
            transport.close();
        }
        true
    }

    /// Releases everything a peer owns and removes it from the room.
    /// Other peers hear `producer-closed` for each of its tracks.
    pub fn release_peer(&mut self, connection_id: &ConnectionId) -> Option<Peer> {
        let (consumers, producers, transports) = {
            let peer = self.peers.get(connection_id)?;
            (peer.consumer_ids(), peer.producer_ids(), peer.transport_ids())
        };

        for consumer_id in consumers {
            self.remove_consumer(&consumer_id, false);
        }
        for producer_id in producers {
            self.remove_producer(&producer_id);
        }
        for transport_id in transports {
            self.remove_transport(&transport_id);
        }

        let mut peer = self.peers.remove(connection_id)?;
        // Anything the owner maps missed
        peer.close_all();
        if self.users.get(&peer.user_id) == Some(connection_id) {
            self.users.remove(&peer.user_id);
        }
        debug!("Released peer {} from lecture {}", connection_id, self.lecture_id);
        Some(peer)
    }

    /// Ends the room: closes every resource and the router, returns the
    /// peers that were present. Later calls return nothing.
    pub fn end(&mut self) -> Vec<Peer> {
        if self.status == RoomStatus::Ended {
            return Vec::new();
        }
        self.status = RoomStatus::Ended;

        self.transport_owners.clear();
        self.producer_owners.clear();
        self.consumer_owners.clear();
        self.users.clear();

        let mut peers: Vec<Peer> = self.peers.drain().map(|(_, peer)| peer).collect();
        for peer in &mut peers {
            peer.close_all();
        }

        let ended = ServerMessage::LectureEnded {
            lecture_id: self.lecture_id.clone(),
        };
        if let Some(json) = serialize(&ended) {
            for peer in &peers {
                peer.send_json(json.clone());
            }
        }

        if let Some(router) = self.router.take() {
            router.close();
        }
        info!("Lecture {} ended ({} peers released)", self.lecture_id, peers.len());
        peers
    }

    /// Broadcast a message to all peers except one
    pub fn broadcast_except(&self, except: &ConnectionId, message: &ServerMessage) {
        let Some(json) = serialize(message) else { return };
        for (id, peer) in &self.peers {
            if id != except {
                peer.send_json(json.clone());
            }
        }
    }

    /// Send a message to a specific peer
    pub fn send_to(&self, connection_id: &ConnectionId, message: &ServerMessage) {
        let Some(json) = serialize(message) else { return };
        if let Some(peer) = self.peers.get(connection_id) {
            peer.send_json(json);
        }
    }
}

fn serialize(message: &ServerMessage) -> Option<Arc<String>> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!("Failed to serialize broadcast message: {}", e);
            None
        }
    }
}
