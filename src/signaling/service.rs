#![forbid(unsafe_code)]

// Signaling operations - drive the Room/Peer graph and the media engine

use super::protocol::{ClientRequest, Identity, ProducerSummary, ServerMessage, SignalingResponse};
use crate::attendance::{AttendanceLedger, LeaveReason};
use crate::error::{SignalingError, SignalingResult};
use crate::media::types::{
    ConnectionId, ConsumerId, ConsumerInfo, Direction, LectureId, MediaKind, ProducerId,
    TrackSource, TransportId, TransportInfo,
};
use crate::media::MediaEngine;
use crate::metrics::{Counter, ServerMetrics};
use crate::registry::{PeerRef, SessionRegistry};
use crate::room::peer::{ConsumerEntry, Peer, ProducerEntry, Role};
use crate::room::{self, Room, RoomState};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const MAX_CHAT_LEN: usize = 4096;

/// One authenticated socket as seen by the signaling layer
#[derive(Clone)]
pub struct ClientSession {
    pub connection_id: ConnectionId,
    pub identity: Identity,
    pub sender: mpsc::Sender<Arc<String>>,
}

impl ClientSession {
    pub fn new(identity: Identity, sender: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            connection_id: ConnectionId::random(),
            identity,
            sender,
        }
    }
}

/// Tunables of the signaling layer
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub max_consumers_per_peer: usize,
    pub notify_replaced_session: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_consumers_per_peer: 64,
            notify_replaced_session: true,
        }
    }
}

pub struct SignalingService {
    engine: Arc<dyn MediaEngine>,
    registry: Arc<SessionRegistry>,
    ledger: Arc<dyn AttendanceLedger>,
    metrics: ServerMetrics,
    settings: ServiceSettings,
}

impl SignalingService {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        registry: Arc<SessionRegistry>,
        ledger: Arc<dyn AttendanceLedger>,
        metrics: ServerMetrics,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            engine,
            registry,
            ledger,
            metrics,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Dispatches one client operation
    pub async fn handle(
        &self,
        session: &ClientSession,
        request: ClientRequest,
    ) -> SignalingResult<Option<SignalingResponse>> {
        let response = match request {
            ClientRequest::CreateRoom { lecture_id } => {
                let router_capabilities = self.create_room(session, lecture_id).await?;
                Some(SignalingResponse::RouterCapabilities { router_capabilities })
            }
            ClientRequest::JoinRoom { lecture_id } => {
                let router_capabilities = self.join_room(session, lecture_id).await?;
                Some(SignalingResponse::RouterCapabilities { router_capabilities })
            }
            ClientRequest::LeaveRoom { lecture_id } => {
                self.leave_room(session, lecture_id.as_ref()).await?;
                None
            }
            ClientRequest::EndLecture { lecture_id } => {
                self.end_lecture(session, lecture_id.as_ref()).await?;
                None
            }
            ClientRequest::GetRouterCapabilities { lecture_id } => {
                let router_capabilities =
                    self.router_capabilities(session, lecture_id.as_ref()).await?;
                Some(SignalingResponse::RouterCapabilities { router_capabilities })
            }
            ClientRequest::CreateTransport { lecture_id, direction } => {
                let info = self.create_transport(session, lecture_id.as_ref(), direction).await?;
                Some(SignalingResponse::Transport { info, direction })
            }
            ClientRequest::ConnectTransport {
                lecture_id,
                transport_id,
                handshake_parameters,
            } => {
                self.connect_transport(session, lecture_id.as_ref(), &transport_id, handshake_parameters)
                    .await?;
                None
            }
            ClientRequest::Produce {
                lecture_id,
                transport_id,
                kind,
                media_parameters,
                source,
                metadata,
            } => {
                let id = self
                    .produce(
                        session,
                        lecture_id.as_ref(),
                        &transport_id,
                        kind,
                        media_parameters,
                        source,
                        metadata,
                    )
                    .await?;
                Some(SignalingResponse::Produced { id })
            }
            ClientRequest::GetProducers { lecture_id } => {
                let producers = self.get_producers(session, lecture_id.as_ref()).await?;
                Some(SignalingResponse::Producers { producers })
            }
            ClientRequest::Consume {
                lecture_id,
                producer_id,
                transport_id,
                remote_capabilities,
            } => {
                let params = self
                    .consume(
                        session,
                        lecture_id.as_ref(),
                        &producer_id,
                        &transport_id,
                        remote_capabilities,
                    )
                    .await?;
                Some(SignalingResponse::Consumed { params })
            }
            ClientRequest::PauseProduce { lecture_id, producer_id } => {
                self.set_producer_paused(session, lecture_id.as_ref(), &producer_id, true)
                    .await?;
                Some(SignalingResponse::ProducerState { producer_id })
            }
            ClientRequest::ResumeProduce { lecture_id, producer_id } => {
                self.set_producer_paused(session, lecture_id.as_ref(), &producer_id, false)
                    .await?;
                Some(SignalingResponse::ProducerState { producer_id })
            }
            ClientRequest::CloseProducer { lecture_id, id } => {
                self.close_producer(session, lecture_id.as_ref(), &id).await?;
                None
            }
            ClientRequest::CloseConsumer { lecture_id, id } => {
                self.close_consumer(session, lecture_id.as_ref(), &id).await?;
                None
            }
            ClientRequest::PauseConsumer { lecture_id, consumer_id } => {
                self.set_consumer_paused(session, lecture_id.as_ref(), &consumer_id, true)
                    .await?;
                Some(SignalingResponse::ConsumerState { consumer_id })
            }
            ClientRequest::ResumeConsumer { lecture_id, consumer_id } => {
                self.set_consumer_paused(session, lecture_id.as_ref(), &consumer_id, false)
                    .await?;
                Some(SignalingResponse::ConsumerState { consumer_id })
            }
            ClientRequest::SendMessage { lecture_id, text } => {
                self.send_message(session, lecture_id.as_ref(), text).await?;
                None
            }
        };
        Ok(response)
    }

    /// Opens the room for `lecture_id` with the caller as host.
    /// Returns the router capability descriptor.
    pub async fn create_room(
        &self,
        session: &ClientSession,
        lecture_id: LectureId,
    ) -> SignalingResult<Value> {
        if session.identity.role != Role::Teacher {
            return Err(SignalingError::Forbidden(
                "only a teacher can open a lecture room".to_string(),
            ));
        }
        if self.registry.has_room(&lecture_id) {
            return Err(SignalingError::AlreadyExists(lecture_id));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let router = self.engine.create_router(&lecture_id, events_tx).await?;
        let router_capabilities = router.rtp_capabilities();

        let room = Arc::new(Room::new(lecture_id.clone(), router.clone(), session.connection_id.clone()));
        room.lock().await.add_peer(Peer::new(
            session.connection_id.clone(),
            lecture_id.clone(),
            &session.identity,
            session.sender.clone(),
        ));

        // Lost a race with another create-room for the same lecture
        if self.registry.try_register_room(room.clone()).is_err() {
            router.close();
            return Err(SignalingError::AlreadyExists(lecture_id));
        }
        // The new room is committed; only now leave the one the caller is in
        if self.registry.get_peer(&session.connection_id).is_some() {
            self.depart(&session.connection_id, LeaveReason::Left).await;
        }
        self.registry.register_peer(
            session.connection_id.clone(),
            PeerRef {
                lecture_id: lecture_id.clone(),
                user_id: session.identity.user_id.clone(),
            },
        );
        room::spawn_event_pump(&room, events_rx);

        self.metrics.inc(Counter::RoomsCreated);
        self.metrics.inc(Counter::Joins);
        info!(
            "create_room: {} opened lecture {} (router {})",
            session.identity.user_id,
            lecture_id,
            room.router_id()
        );
        Ok(router_capabilities)
    }

    /// Admits the caller to a live lecture. A previous connection of the
    /// same user is evicted first.
    pub async fn join_room(
        &self,
        session: &ClientSession,
        lecture_id: LectureId,
    ) -> SignalingResult<Value> {
        let conn = &session.connection_id;
        let room = self
            .registry
            .get_room(&lecture_id)
            .ok_or_else(|| SignalingError::RoomNotFound(lecture_id.clone()))?;

        let previous_room = match self.registry.get_peer(conn) {
            Some(current) if current.lecture_id == lecture_id => {
                let state = room.lock().await;
                state.ensure_active()?;
                state.peer(conn)?;
                return Ok(state.router()?.rtp_capabilities());
            }
            Some(current) => self.registry.get_room(&current.lecture_id),
            None => None,
        };

        // The target must be joinable before the caller gives up its current room
        let mut state = match &previous_room {
            Some(previous) => {
                let (mut previous_state, state) = room::lock_pair(previous, &room).await;
                state.ensure_active()?;
                state.router()?;
                self.release_locked(previous, &mut previous_state, conn, LeaveReason::Left);
                state
            }
            None => {
                let state = room.lock().await;
                state.ensure_active()?;
                state
            }
        };
        let router_capabilities = state.router()?.rtp_capabilities();

        if let Some(previous) = state.connection_of(&session.identity.user_id).cloned() {
            self.evict(&mut state, &previous, conn);
        }

        state.add_peer(Peer::new(
            conn.clone(),
            lecture_id.clone(),
            &session.identity,
            session.sender.clone(),
        ));
        self.registry.register_peer(
            conn.clone(),
            PeerRef {
                lecture_id: lecture_id.clone(),
                user_id: session.identity.user_id.clone(),
            },
        );
        state.broadcast_except(conn, &ServerMessage::NewUserJoined {
            peer_id: conn.clone(),
            user_id: session.identity.user_id.clone(),
            display_name: session.identity.display_name.clone(),
            role: session.identity.role,
        });

        self.metrics.inc(Counter::Joins);
        info!(
            "join_room: {} joined lecture {} ({} peers)",
            session.identity.user_id,
            lecture_id,
            state.peer_count()
        );
        Ok(router_capabilities)
    }

    /// Releases `previous` so `replacement` can take over its user's seat
    fn evict(&self, state: &mut RoomState, previous: &ConnectionId, replacement: &ConnectionId) {
        let Some(peer) = state.release_peer(previous) else {
            return;
        };
        self.registry.remove_peer(previous);

        if self.settings.notify_replaced_session {
            if let Ok(json) = serde_json::to_string(&ServerMessage::SessionReplaced {
                lecture_id: state.lecture_id().clone(),
            }) {
                peer.send_json(Arc::new(json));
            }
        }
        state.broadcast_except(replacement, &ServerMessage::PeerLeft {
            peer_id: previous.clone(),
            user_id: peer.user_id.clone(),
            display_name: peer.display_name.clone(),
        });
        if state.is_host(previous) {
            state.set_host(replacement.clone());
        }

        self.ledger.record(peer.attendance(LeaveReason::Replaced));
        self.metrics.inc(Counter::Evictions);
        info!(
            "Evicted connection {} of user {} from lecture {}",
            previous,
            peer.user_id,
            state.lecture_id()
        );
    }

    pub async fn leave_room(
        &self,
        session: &ClientSession,
        lecture_id: Option<&LectureId>,
    ) -> SignalingResult<()> {
        self.locate(session, lecture_id)?;
        self.depart(&session.connection_id, LeaveReason::Left).await;
        Ok(())
    }

    /// Ends the lecture for everyone. Host only.
    pub async fn end_lecture(
        &self,
        session: &ClientSession,
        lecture_id: Option<&LectureId>,
    ) -> SignalingResult<()> {
        let room = self.locate(session, lecture_id)?;
        let mut state = room.lock().await;
        state.ensure_active()?;
        if !state.is_host(&session.connection_id) {
            return Err(SignalingError::Forbidden(
                "only the host can end the lecture".to_string(),
            ));
        }
        self.teardown(&room, &mut state, LeaveReason::Left);
        Ok(())
    }

    /// Connection-loss cleanup. A connection with no peer is a no-op.
    pub async fn disconnect(&self, connection_id: &ConnectionId) {
        self.depart(connection_id, LeaveReason::Disconnected).await;
    }

    /// Removes a peer from its room; the host's departure ends the room
    async fn depart(&self, connection_id: &ConnectionId, reason: LeaveReason) {
        let Some(peer_ref) = self.registry.get_peer(connection_id) else {
            return;
        };
        let Some(room) = self.registry.get_room(&peer_ref.lecture_id) else {
            self.registry.remove_peer(connection_id);
            return;
        };

        let mut state = room.lock().await;
        self.release_locked(&room, &mut state, connection_id, reason);
    }

    /// [`Self::depart`] with the room already locked
    fn release_locked(
        &self,
        room: &Arc<Room>,
        state: &mut RoomState,
        connection_id: &ConnectionId,
        reason: LeaveReason,
    ) {
        if !state.has_peer(connection_id) {
            self.registry.remove_peer(connection_id);
            return;
        }
        if state.is_host(connection_id) {
            info!(
                "Host connection {} left lecture {}, ending it",
                connection_id,
                state.lecture_id()
            );
            self.teardown(room, state, reason);
            return;
        }

        let Some(peer) = state.release_peer(connection_id) else {
            return;
        };
        self.registry.remove_peer(connection_id);
        state.broadcast_except(connection_id, &ServerMessage::PeerLeft {
            peer_id: connection_id.clone(),
            user_id: peer.user_id.clone(),
            display_name: peer.display_name.clone(),
        });

        self.ledger.record(peer.attendance(reason));
        self.metrics.inc(Counter::Leaves);
        info!(
            "{} left lecture {} ({:?}, {} peers remain)",
            peer.user_id,
            state.lecture_id(),
            reason,
            state.peer_count()
        );
    }

    /// Ends a room and drops it and all its peers from the registry.
    /// `host_reason` is recorded for the host; everyone else gets `LectureEnded`.
    fn teardown(&self, room: &Arc<Room>, state: &mut RoomState, host_reason: LeaveReason) {
        let host = state.host().clone();
        let peers = state.end();
        self.registry.remove_room(room);

        for peer in &peers {
            self.registry.remove_peer(&peer.connection_id);
            let reason = if peer.connection_id == host {
                host_reason
            } else {
                LeaveReason::LectureEnded
            };
            self.ledger.record(peer.attendance(reason));
        }
        self.metrics.inc(Counter::LecturesEnded);
    }

    /// Ends every live room and stops the engine
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");
        let rooms = self.registry.rooms();
        for room in &rooms {
            let mut state = room.lock().await;
            self.teardown(room, &mut state, LeaveReason::LectureEnded);
        }
        self.engine.shutdown().await;
        info!("All rooms shut down ({} total)", rooms.len());
    }

    pub async fn router_capabilities(
        &self,
        session: &ClientSession,
        lecture_id: Option<&LectureId>,
    ) -> SignalingResult<Value> {
        let room = self.locate(session, lecture_id)?;
        let state = room.lock().await;
        state.ensure_active()?;
        state.peer(&session.connection_id)?;
        Ok(state.router()?.rtp_capabilities())
    }

    pub async fn create_transport(
        &self,
        session: &ClientSession,
        lecture_id: Option<&LectureId>,
        direction: Direction,
    ) -> SignalingResult<TransportInfo> {
        let conn = &session.connection_id;
        let room = self.locate(session, lecture_id)?;
        let mut state = room.lock().await;
        state.ensure_active()?;
        state.peer(conn)?;
        let router = state.router()?;

        let transport = router.create_transport(direction).await?;
        let info = transport.info();
        state.register_transport(conn, transport.id());
        state.peer_mut(conn)?.add_transport(transport);

        debug!("Created {} transport {} for {}", direction, info.id, conn);
        Ok(info)
    }

    pub async fn connect_transport(
        &self,
        session: &ClientSession,
        lecture_id: Option<&LectureId>,
        transport_id: &TransportId,
        handshake: Value,
    ) -> SignalingResult<()> {
        let room = self.locate(session, lecture_id)?;
        let transport = {
            let state = room.lock().await;
            state.ensure_active()?;
            state
                .peer(&session.connection_id)?
                .transport(transport_id)
                .cloned()
                .ok_or_else(|| SignalingError::TransportNotFound(transport_id.clone()))?
        };
        // Handshake touches no room state
        transport.connect(handshake).await?;
        debug!("Connected transport {} for {}", transport_id, session.connection_id);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn produce(
        &self,
        session: &ClientSession,
        lecture_id: Option<&LectureId>,
        transport_id: &TransportId,
        kind: MediaKind,
        media_parameters: Value,
        source: Option<TrackSource>,
        metadata: Value,
    ) -> SignalingResult<ProducerId> {
        let conn = &session.connection_id;
        let room = self.locate(session, lecture_id)?;
        let mut state = room.lock().await;
        state.ensure_active()?;

        let transport = state
            .peer(conn)?
            .transport(transport_id)
            .cloned()
            .ok_or_else(|| SignalingError::TransportNotFound(transport_id.clone()))?;
        if transport.direction() != Direction::Send {
            return Err(SignalingError::InvalidRequest(format!(
                "transport {transport_id} is not a send transport"
            )));
        }

        let producer = transport.produce(kind, media_parameters).await?;
        let producer_id = producer.id();
        let metadata = tag_metadata(metadata, state.lecture_id(), conn);

        state.register_producer(conn, producer_id.clone());
        let peer = state.peer_mut(conn)?;
        peer.add_producer(ProducerEntry {
            handle: producer.clone(),
            transport_id: transport_id.clone(),
            kind,
            source,
            metadata: metadata.clone(),
            paused: producer.paused(),
        });
        let summary = ProducerSummary {
            producer_id: producer_id.clone(),
            peer_id: conn.clone(),
            user_id: peer.user_id.clone(),
            kind,
            source,
            metadata,
            paused: producer.paused(),
        };
        state.broadcast_except(conn, &ServerMessage::NewProducer(summary));

        self.metrics.inc(Counter::ProducersCreated);
        info!(
            "produce: {} published {:?} producer {} in lecture {}",
            session.identity.user_id,
            kind,
            producer_id,
            state.lecture_id()
        );
        Ok(producer_id)
    }

    /// Tracks published by everyone in the room except the caller
    pub async fn get_producers(
        &self,
        session: &ClientSession,
        lecture_id: Option<&LectureId>,
    ) -> SignalingResult<Vec<ProducerSummary>> {
        let room = self.locate(session, lecture_id)?;
        let state = room.lock().await;
        state.ensure_active()?;
        state.peer(&session.connection_id)?;
        Ok(state.producers_except(&session.connection_id))
    }

    pub async fn consume(
        &self,
        session: &ClientSession,
        lecture_id: Option<&LectureId>,
        producer_id: &ProducerId,
        transport_id: &TransportId,
        remote_capabilities: Value,
    ) -> SignalingResult<ConsumerInfo> {
        let conn = &session.connection_id;
        let room = self.locate(session, lecture_id)?;
        let mut state = room.lock().await;
        state.ensure_active()?;
        let router = state.router()?;

        let peer = state.peer(conn)?;
        let transport = peer
            .transport(transport_id)
            .cloned()
            .ok_or_else(|| SignalingError::TransportNotFound(transport_id.clone()))?;
        if transport.direction() != Direction::Recv {
            return Err(SignalingError::InvalidRequest(format!(
                "transport {transport_id} is not a receive transport"
            )));
        }
        if peer.consumer_count() >= self.settings.max_consumers_per_peer {
            return Err(SignalingError::InvalidRequest(format!(
                "consumer limit reached ({})",
                self.settings.max_consumers_per_peer
            )));
        }
        let producer_paused = state
            .producer_paused(producer_id)
            .ok_or_else(|| SignalingError::ProducerNotFound(producer_id.clone()))?;
        if !router.can_consume(producer_id, &remote_capabilities) {
            return Err(SignalingError::InvalidRequest(format!(
                "cannot consume producer {producer_id} with the given capabilities"
            )));
        }

        let consumer = transport
            .consume(producer_id, remote_capabilities, producer_paused)
            .await?;
        let consumer_id = consumer.id();

        // The producer may have closed while the engine was busy
        if state.producer_owner(producer_id).is_none() {
            consumer.close();
            return Err(SignalingError::ProducerNotFound(producer_id.clone()));
        }

        let info = ConsumerInfo {
            id: consumer_id.clone(),
            producer_id: producer_id.clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            paused: consumer.paused(),
            producer_paused,
        };
        state.register_consumer(conn, consumer_id.clone());
        state.peer_mut(conn)?.add_consumer(ConsumerEntry {
            handle: consumer,
            transport_id: transport_id.clone(),
            producer_id: producer_id.clone(),
        });

        self.metrics.inc(Counter::ConsumersCreated);
        debug!(
            "consume: {} consuming producer {} via consumer {}",
            session.identity.user_id, producer_id, consumer_id
        );
        Ok(info)
    }

    /// Pauses or resumes one of the caller's producers. The new state is
    /// recorded and broadcast before the ack; the engine's matching event is
    /// then a no-op.
    pub async fn set_producer_paused(
        &self,
        session: &ClientSession,
        lecture_id: Option<&LectureId>,
        producer_id: &ProducerId,
        paused: bool,
    ) -> SignalingResult<()> {
        let room = self.locate(session, lecture_id)?;
        let handle = {
            let state = room.lock().await;
            state.ensure_active()?;
            state
                .peer(&session.connection_id)?
                .producer(producer_id)
                .map(|entry| entry.handle.clone())
                .ok_or_else(|| SignalingError::ProducerNotFound(producer_id.clone()))?
        };
        if paused {
            handle.pause().await?;
        } else {
            handle.resume().await?;
        }
        let mut state = room.lock().await;
        state.set_producer_paused(producer_id, handle.paused());
        debug!("Producer {} paused={} by {}", producer_id, paused, session.connection_id);
        Ok(())
    }

    pub async fn close_producer(
        &self,
        session: &ClientSession,
        lecture_id: Option<&LectureId>,
        producer_id: &ProducerId,
    ) -> SignalingResult<()> {
        let room = self.locate(session, lecture_id)?;
        let mut state = room.lock().await;
        state.ensure_active()?;
        if state.peer(&session.connection_id)?.producer(producer_id).is_none() {
            return Err(SignalingError::ProducerNotFound(producer_id.clone()));
        }
        state.remove_producer(producer_id);
        info!("close_producer: {} closed producer {}", session.identity.user_id, producer_id);
        Ok(())
    }

    pub async fn close_consumer(
        &self,
        session: &ClientSession,
        lecture_id: Option<&LectureId>,
        consumer_id: &ConsumerId,
    ) -> SignalingResult<()> {
        let room = self.locate(session, lecture_id)?;
        let mut state = room.lock().await;
        state.ensure_active()?;
        if state.peer(&session.connection_id)?.consumer(consumer_id).is_none() {
            return Err(SignalingError::ConsumerNotFound(consumer_id.clone()));
        }
        state.remove_consumer(consumer_id, false);
        debug!("close_consumer: {} closed consumer {}", session.connection_id, consumer_id);
        Ok(())
    }

    pub async fn set_consumer_paused(
        &self,
        session: &ClientSession,
        lecture_id: Option<&LectureId>,
        consumer_id: &ConsumerId,
        paused: bool,
    ) -> SignalingResult<()> {
        let room = self.locate(session, lecture_id)?;
        let handle = {
            let state = room.lock().await;
            state.ensure_active()?;
            state
                .peer(&session.connection_id)?
                .consumer(consumer_id)
                .map(|entry| entry.handle.clone())
                .ok_or_else(|| SignalingError::ConsumerNotFound(consumer_id.clone()))?
        };
        if paused {
            handle.pause().await?;
        } else {
            handle.resume().await?;
        }
        Ok(())
    }

    /// Relays a chat line to every other peer in the room
    pub async fn send_message(
        &self,
        session: &ClientSession,
        lecture_id: Option<&LectureId>,
        text: String,
    ) -> SignalingResult<()> {
        if text.trim().is_empty() {
            return Err(SignalingError::InvalidRequest("empty message".to_string()));
        }
        if text.len() > MAX_CHAT_LEN {
            return Err(SignalingError::InvalidRequest(format!(
                "message longer than {MAX_CHAT_LEN} bytes"
            )));
        }
        let room = self.locate(session, lecture_id)?;
        let state = room.lock().await;
        state.ensure_active()?;
        let peer = state.peer(&session.connection_id)?;
        let message = ServerMessage::ReceiveMessage {
            text,
            sender_id: peer.user_id.clone(),
            sender_name: peer.display_name.clone(),
        };
        state.broadcast_except(&session.connection_id, &message);
        Ok(())
    }

    /// Resolves the caller's room, checking it against the lecture the
    /// client named (if any)
    fn locate(
        &self,
        session: &ClientSession,
        lecture_id: Option<&LectureId>,
    ) -> SignalingResult<Arc<Room>> {
        let peer_ref = self
            .registry
            .get_peer(&session.connection_id)
            .ok_or(SignalingError::NoPeer)?;
        if let Some(claimed) = lecture_id {
            if claimed != &peer_ref.lecture_id {
                warn!(
                    "{} named lecture {} but is joined to {}",
                    session.connection_id, claimed, peer_ref.lecture_id
                );
                return Err(SignalingError::NoPeer);
            }
        }
        self.registry
            .get_room(&peer_ref.lecture_id)
            .ok_or(SignalingError::RoomNotFound(peer_ref.lecture_id))
    }
}

/// Stamps the lecture and publishing peer into object metadata
fn tag_metadata(metadata: Value, lecture_id: &LectureId, peer_id: &ConnectionId) -> Value {
    let mut metadata = match metadata {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    metadata.insert("lectureId".to_string(), json!(lecture_id));
    metadata.insert("peerId".to_string(), json!(peer_id));
    Value::Object(metadata)
}
