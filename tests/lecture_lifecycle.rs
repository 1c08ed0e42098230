// Lecture lifecycle scenarios against the loopback media engine

use lecture_sfu::attendance::{AttendanceRecord, ChannelLedger, LeaveReason};
use lecture_sfu::error::{ErrorKind, SignalingError};
use lecture_sfu::media::loopback::EngineOp;
use lecture_sfu::media::types::{
    ConsumerId, Direction, LectureId, MediaKind, ProducerId, TrackSource, TransportId, UserId,
};
use lecture_sfu::media::LoopbackEngine;
use lecture_sfu::metrics::ServerMetrics;
use lecture_sfu::registry::SessionRegistry;
use lecture_sfu::room::peer::Role;
use lecture_sfu::signaling::protocol::Identity;
use lecture_sfu::signaling::service::{ClientSession, ServiceSettings, SignalingService};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Harness {
    svc: Arc<SignalingService>,
    engine: LoopbackEngine,
    attendance: mpsc::UnboundedReceiver<AttendanceRecord>,
}

fn harness() -> Harness {
    let engine = LoopbackEngine::new();
    let (ledger, attendance) = ChannelLedger::new();
    let svc = Arc::new(SignalingService::new(
        Arc::new(engine.clone()),
        Arc::new(SessionRegistry::new()),
        Arc::new(ledger),
        ServerMetrics::new(),
        ServiceSettings::default(),
    ));
    Harness {
        svc,
        engine,
        attendance,
    }
}

struct Client {
    session: ClientSession,
    inbox: mpsc::Receiver<Arc<String>>,
}

impl Client {
    fn new(user: &str, role: Role) -> Self {
        let (tx, inbox) = mpsc::channel(128);
        let identity = Identity {
            user_id: UserId::new(user),
            role,
            display_name: format!("{user} name"),
        };
        Self {
            session: ClientSession::new(identity, tx),
            inbox,
        }
    }

    /// Waits for the next frame of type `kind`, skipping others
    async fn expect(&mut self, kind: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let frame = tokio::time::timeout_at(deadline, self.inbox.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
                .unwrap_or_else(|| panic!("inbox closed while waiting for {kind}"));
            let value: Value = serde_json::from_str(&frame).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    }

    /// Everything queued right now
    fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = self.inbox.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }
}

fn lecture() -> LectureId {
    LectureId::new("L1")
}

async fn publish(h: &Harness, client: &Client, kind: MediaKind) -> ProducerId {
    let transport = h
        .svc
        .create_transport(&client.session, Some(&lecture()), Direction::Send)
        .await
        .unwrap();
    h.svc
        .connect_transport(
            &client.session,
            Some(&lecture()),
            &transport.id,
            json!({ "dtlsParameters": { "role": "client", "fingerprints": [] } }),
        )
        .await
        .unwrap();
    h.svc
        .produce(
            &client.session,
            Some(&lecture()),
            &transport.id,
            kind,
            json!({ "codecs": [] }),
            Some(TrackSource::Camera),
            json!({ "label": "main" }),
        )
        .await
        .unwrap()
}

async fn subscribe(h: &Harness, client: &Client, producer_id: &ProducerId) -> Value {
    let transport = h
        .svc
        .create_transport(&client.session, Some(&lecture()), Direction::Recv)
        .await
        .unwrap();
    let info = h
        .svc
        .consume(
            &client.session,
            Some(&lecture()),
            producer_id,
            &transport.id,
            json!({ "codecs": [] }),
        )
        .await
        .unwrap();
    serde_json::to_value(info).unwrap()
}

async fn consumer_count(h: &Harness, client: &Client) -> usize {
    let room = h.svc.registry().get_room(&lecture()).unwrap();
    let state = room.lock().await;
    let peer = state.peer(&client.session.connection_id).unwrap();
    peer.consumer_count()
}

/// Owner index sizes of the room: (transports, producers, consumers)
async fn index_sizes(h: &Harness, lecture_id: &LectureId) -> (usize, usize, usize) {
    let room = h.svc.registry().get_room(lecture_id).unwrap();
    let sizes = room.lock().await.index_sizes();
    sizes
}

fn handshake() -> Value {
    json!({ "dtlsParameters": { "role": "client", "fingerprints": [] } })
}

async fn consumer_paused(h: &Harness, client: &Client, consumer_id: &ConsumerId) -> bool {
    let room = h.svc.registry().get_room(&lecture()).unwrap();
    let state = room.lock().await;
    let peer = state.peer(&client.session.connection_id).unwrap();
    peer.consumer(consumer_id).unwrap().handle.paused()
}

#[tokio::test]
async fn concurrent_create_room_admits_exactly_one() {
    let h = harness();
    let a = Client::new("teacher-a", Role::Teacher);
    let b = Client::new("teacher-b", Role::Teacher);

    let (ra, rb) = tokio::join!(
        h.svc.create_room(&a.session, lecture()),
        h.svc.create_room(&b.session, lecture()),
    );

    let outcomes = [ra, rb];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let err = outcomes.into_iter().find_map(Result::err).unwrap();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(h.svc.registry().room_count(), 1);
    assert_eq!(h.svc.registry().peer_count(), 1);
}

#[tokio::test]
async fn classroom_scenario() {
    let mut h = harness();
    let mut host = Client::new("teacher", Role::Teacher);
    let s1 = Client::new("student-1", Role::Student);
    let mut s2 = Client::new("student-2", Role::Student);

    let caps = h.svc.create_room(&host.session, lecture()).await.unwrap();
    assert!(caps["codecs"].is_array());

    let other_host = Client::new("teacher-2", Role::Teacher);
    let err = h.svc.create_room(&other_host.session, lecture()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    h.svc.join_room(&s1.session, lecture()).await.unwrap();
    h.svc.join_room(&s2.session, lecture()).await.unwrap();
    let joined = host.expect("new-user-joined").await;
    assert_eq!(joined["userId"], "student-1");
    assert_eq!(joined["role"], "student");

    // Student leaves: others are told, room stays up
    h.svc.disconnect(&s1.session.connection_id).await;
    let left = host.expect("peer-left").await;
    assert_eq!(left["userId"], "student-1");
    s2.expect("peer-left").await;
    assert!(h.svc.registry().has_room(&lecture()));
    let record = h.attendance.recv().await.unwrap();
    assert_eq!(record.user_id, UserId::new("student-1"));
    assert_eq!(record.reason, LeaveReason::Disconnected);

    // Disconnect is idempotent
    h.svc.disconnect(&s1.session.connection_id).await;
    assert!(h.attendance.try_recv().is_err());

    // Host leaves: lecture ends for everyone
    h.svc.disconnect(&host.session.connection_id).await;
    let ended = s2.expect("lecture-ended").await;
    assert_eq!(ended["lectureId"], "L1");
    assert!(!h.svc.registry().has_room(&lecture()));
    assert_eq!(h.svc.registry().peer_count(), 0);

    let late = Client::new("student-3", Role::Student);
    let err = h.svc.join_room(&late.session, lecture()).await.unwrap_err();
    assert!(matches!(err, SignalingError::RoomNotFound(_)));

    let mut reasons = vec![
        h.attendance.recv().await.unwrap(),
        h.attendance.recv().await.unwrap(),
    ];
    reasons.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    assert_eq!(reasons[0].user_id, UserId::new("student-2"));
    assert_eq!(reasons[0].reason, LeaveReason::LectureEnded);
    assert_eq!(reasons[1].user_id, UserId::new("teacher"));
    assert_eq!(reasons[1].reason, LeaveReason::Disconnected);

    // Ops from a peer of the ended room fail cleanly
    let err = h
        .svc
        .get_producers(&s2.session, Some(&lecture()))
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::NoPeer));
}

#[tokio::test]
async fn closing_a_producer_closes_remote_consumers() {
    let h = harness();
    let host = Client::new("teacher", Role::Teacher);
    let mut a = Client::new("student-a", Role::Student);
    let mut b = Client::new("student-b", Role::Student);
    h.svc.create_room(&host.session, lecture()).await.unwrap();
    h.svc.join_room(&a.session, lecture()).await.unwrap();
    h.svc.join_room(&b.session, lecture()).await.unwrap();

    let video = publish(&h, &a, MediaKind::Video).await;
    let announced = b.expect("new-producer").await;
    assert_eq!(announced["producerId"], video.as_str());
    assert_eq!(announced["kind"], "video");
    assert_eq!(announced["metadata"]["label"], "main");
    assert_eq!(announced["metadata"]["lectureId"], "L1");

    let consumer = subscribe(&h, &b, &video).await;
    assert_eq!(consumer["producerId"], video.as_str());
    assert_eq!(consumer_count(&h, &b).await, 1);

    h.svc
        .close_producer(&a.session, Some(&lecture()), &video)
        .await
        .unwrap();

    let closed = b.expect("consumer-closed").await;
    assert_eq!(closed["consumerId"], consumer["id"]);
    assert_eq!(consumer_count(&h, &b).await, 0);
    a.drain();
    let err = h
        .svc
        .close_producer(&a.session, Some(&lecture()), &video)
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::ProducerNotFound(_)));
}

#[tokio::test]
async fn get_producers_excludes_own_tracks() {
    let h = harness();
    let host = Client::new("teacher", Role::Teacher);
    let s1 = Client::new("student-1", Role::Student);
    h.svc.create_room(&host.session, lecture()).await.unwrap();
    h.svc.join_room(&s1.session, lecture()).await.unwrap();

    let host_audio = publish(&h, &host, MediaKind::Audio).await;
    let own = publish(&h, &s1, MediaKind::Video).await;

    let seen_by_student = h.svc.get_producers(&s1.session, None).await.unwrap();
    assert_eq!(seen_by_student.len(), 1);
    assert_eq!(seen_by_student[0].producer_id, host_audio);

    let seen_by_host = h.svc.get_producers(&host.session, None).await.unwrap();
    assert_eq!(seen_by_host.len(), 1);
    assert_eq!(seen_by_host[0].producer_id, own);
}

#[tokio::test]
async fn duplicate_join_evicts_the_previous_session() {
    let mut h = harness();
    let mut host = Client::new("teacher", Role::Teacher);
    let mut first = Client::new("student", Role::Student);
    h.svc.create_room(&host.session, lecture()).await.unwrap();
    h.svc.join_room(&first.session, lecture()).await.unwrap();

    let host_track = publish(&h, &host, MediaKind::Video).await;
    let student_track = publish(&h, &first, MediaKind::Audio).await;
    subscribe(&h, &first, &host_track).await;
    subscribe(&h, &host, &student_track).await;
    host.drain();

    // Same user, new connection (page reload)
    let second = Client::new("student", Role::Student);
    h.svc.join_room(&second.session, lecture()).await.unwrap();

    first.expect("session-replaced").await;
    let closed = host.expect("producer-closed").await;
    assert_eq!(closed["producerId"], student_track.as_str());
    host.expect("peer-left").await;
    host.expect("new-user-joined").await;
    assert_eq!(consumer_count(&h, &host).await, 0);

    let registry = h.svc.registry();
    assert!(registry.get_peer(&first.session.connection_id).is_none());
    assert!(registry.get_peer(&second.session.connection_id).is_some());
    {
        let room = registry.get_room(&lecture()).unwrap();
        let state = room.lock().await;
        assert_eq!(state.peer_count(), 2);
        assert!(!state.has_peer(&first.session.connection_id));
        assert_eq!(
            state.connection_of(&UserId::new("student")),
            Some(&second.session.connection_id)
        );
    }

    let err = h
        .svc
        .create_transport(&first.session, None, Direction::Send)
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::NoPeer));

    // The evicted socket closing later changes nothing
    h.svc.disconnect(&first.session.connection_id).await;
    assert!(registry.get_peer(&second.session.connection_id).is_some());

    let record = h.attendance.recv().await.unwrap();
    assert_eq!(record.reason, LeaveReason::Replaced);
    assert!(h.attendance.try_recv().is_err());
}

#[tokio::test]
async fn host_reconnect_keeps_the_lecture_alive() {
    let h = harness();
    let old_host = Client::new("teacher", Role::Teacher);
    let mut student = Client::new("student", Role::Student);
    h.svc.create_room(&old_host.session, lecture()).await.unwrap();
    h.svc.join_room(&student.session, lecture()).await.unwrap();

    let new_host = Client::new("teacher", Role::Teacher);
    h.svc.join_room(&new_host.session, lecture()).await.unwrap();
    h.svc.disconnect(&old_host.session.connection_id).await;
    assert!(h.svc.registry().has_room(&lecture()));

    let err = h
        .svc
        .end_lecture(&student.session, Some(&lecture()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    h.svc
        .end_lecture(&new_host.session, Some(&lecture()))
        .await
        .unwrap();
    student.expect("lecture-ended").await;
    assert!(!h.svc.registry().has_room(&lecture()));
}

#[tokio::test]
async fn pause_is_visible_as_soon_as_it_is_acked() {
    let h = harness();
    let host = Client::new("teacher", Role::Teacher);
    let mut student = Client::new("student", Role::Student);
    h.svc.create_room(&host.session, lecture()).await.unwrap();
    h.svc.join_room(&student.session, lecture()).await.unwrap();

    let track = publish(&h, &host, MediaKind::Video).await;
    h.svc
        .set_producer_paused(&host.session, None, &track, true)
        .await
        .unwrap();

    // Straight after the ack, whether or not the engine event was pumped yet
    let consumer = subscribe(&h, &student, &track).await;
    assert_eq!(consumer["producerPaused"], true);
    assert_eq!(consumer["paused"], true);
    let listed = h.svc.get_producers(&student.session, None).await.unwrap();
    assert!(listed[0].paused);

    let paused = student.expect("producer-paused").await;
    assert_eq!(paused["producerId"], track.as_str());
    // The engine's own pause event must not announce it a second time
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(student.drain().iter().all(|m| m["type"] != "producer-paused"));

    h.svc
        .set_producer_paused(&host.session, None, &track, false)
        .await
        .unwrap();
    student.expect("producer-resumed").await;
    let listed = h.svc.get_producers(&student.session, None).await.unwrap();
    assert!(!listed[0].paused);

    // Only the owner may pause
    let err = h
        .svc
        .set_producer_paused(&student.session, None, &track, true)
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::ProducerNotFound(_)));
}

#[tokio::test]
async fn chat_reaches_everyone_but_the_sender() {
    let h = harness();
    let mut host = Client::new("teacher", Role::Teacher);
    let mut student = Client::new("student", Role::Student);
    h.svc.create_room(&host.session, lecture()).await.unwrap();
    h.svc.join_room(&student.session, lecture()).await.unwrap();
    host.drain();

    h.svc
        .send_message(&student.session, Some(&lecture()), "question!".to_string())
        .await
        .unwrap();

    let msg = host.expect("receive-message").await;
    assert_eq!(msg["text"], "question!");
    assert_eq!(msg["senderId"], "student");
    assert_eq!(msg["senderName"], "student name");
    assert!(student.drain().iter().all(|m| m["type"] != "receive-message"));
}

#[tokio::test]
async fn engine_failure_leaves_no_partial_state() {
    let h = harness();
    let host = Client::new("teacher", Role::Teacher);
    h.svc.create_room(&host.session, lecture()).await.unwrap();
    let send = h
        .svc
        .create_transport(&host.session, None, Direction::Send)
        .await
        .unwrap();

    h.engine.fail_next(EngineOp::Produce);
    let err = h
        .svc
        .produce(
            &host.session,
            None,
            &send.id,
            MediaKind::Audio,
            json!({}),
            None,
            Value::Null,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineFailure);

    let room = h.svc.registry().get_room(&lecture()).unwrap();
    assert_eq!(
        room.lock()
            .await
            .peer(&host.session.connection_id)
            .unwrap()
            .producer_count(),
        0
    );

    h.engine.fail_next(EngineOp::CreateRouter);
    let other = Client::new("teacher-2", Role::Teacher);
    let err = h
        .svc
        .create_room(&other.session, LectureId::new("L2"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineFailure);
    assert!(!h.svc.registry().has_room(&LectureId::new("L2")));
}

#[tokio::test]
async fn shutdown_ends_every_room() {
    let h = harness();
    let t1 = Client::new("teacher-1", Role::Teacher);
    let t2 = Client::new("teacher-2", Role::Teacher);
    let mut student = Client::new("student", Role::Student);
    h.svc.create_room(&t1.session, LectureId::new("L1")).await.unwrap();
    h.svc.create_room(&t2.session, LectureId::new("L2")).await.unwrap();
    h.svc.join_room(&student.session, LectureId::new("L2")).await.unwrap();

    h.svc.shutdown().await;

    student.expect("lecture-ended").await;
    assert_eq!(h.svc.registry().room_count(), 0);
    assert_eq!(h.svc.registry().peer_count(), 0);
}

#[tokio::test]
async fn consumer_pause_is_owner_only() {
    let h = harness();
    let host = Client::new("teacher", Role::Teacher);
    let student = Client::new("student", Role::Student);
    h.svc.create_room(&host.session, lecture()).await.unwrap();
    h.svc.join_room(&student.session, lecture()).await.unwrap();

    let track = publish(&h, &host, MediaKind::Audio).await;
    let consumer = subscribe(&h, &student, &track).await;
    let consumer_id: ConsumerId = serde_json::from_value(consumer["id"].clone()).unwrap();

    h.svc
        .set_consumer_paused(&student.session, None, &consumer_id, true)
        .await
        .unwrap();
    assert!(consumer_paused(&h, &student, &consumer_id).await);

    let err = h
        .svc
        .set_consumer_paused(&host.session, None, &consumer_id, false)
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::ConsumerNotFound(_)));
    assert!(consumer_paused(&h, &student, &consumer_id).await);

    h.svc
        .set_consumer_paused(&student.session, Some(&lecture()), &consumer_id, false)
        .await
        .unwrap();
    assert!(!consumer_paused(&h, &student, &consumer_id).await);
}

#[tokio::test]
async fn failed_create_room_keeps_the_current_lecture() {
    let h = harness();
    let host = Client::new("teacher", Role::Teacher);
    let mut student = Client::new("student", Role::Student);
    h.svc.create_room(&host.session, lecture()).await.unwrap();
    h.svc.join_room(&student.session, lecture()).await.unwrap();

    h.engine.fail_next(EngineOp::CreateRouter);
    let err = h
        .svc
        .create_room(&host.session, LectureId::new("L2"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineFailure);

    let other = Client::new("teacher-2", Role::Teacher);
    h.svc.create_room(&other.session, LectureId::new("L3")).await.unwrap();
    let err = h
        .svc
        .create_room(&host.session, LectureId::new("L3"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let registry = h.svc.registry();
    assert!(registry.has_room(&lecture()));
    assert!(!registry.has_room(&LectureId::new("L2")));
    assert_eq!(registry.get_peer(&host.session.connection_id).unwrap().lecture_id, lecture());
    assert_eq!(registry.get_peer(&student.session.connection_id).unwrap().lecture_id, lecture());
    {
        let room = registry.get_room(&lecture()).unwrap();
        let state = room.lock().await;
        assert!(state.ensure_active().is_ok());
        assert_eq!(state.peer_count(), 2);
        assert!(state.is_host(&host.session.connection_id));
    }
    assert!(student.drain().iter().all(|m| m["type"] != "lecture-ended"));

    // A successful create moves the host, which ends the old lecture
    h.svc.create_room(&host.session, LectureId::new("L2")).await.unwrap();
    let ended = student.expect("lecture-ended").await;
    assert_eq!(ended["lectureId"], "L1");
    assert!(!registry.has_room(&lecture()));
    assert_eq!(
        registry.get_peer(&host.session.connection_id).unwrap().lecture_id,
        LectureId::new("L2")
    );
}

#[tokio::test]
async fn join_moves_between_lectures_only_when_the_target_is_live() {
    let h = harness();
    let t1 = Client::new("teacher-1", Role::Teacher);
    let mut t2 = Client::new("teacher-2", Role::Teacher);
    let student = Client::new("student", Role::Student);
    h.svc.create_room(&t1.session, lecture()).await.unwrap();
    h.svc.create_room(&t2.session, LectureId::new("L2")).await.unwrap();
    h.svc.join_room(&student.session, lecture()).await.unwrap();

    let err = h
        .svc
        .join_room(&student.session, LectureId::new("L9"))
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::RoomNotFound(_)));
    let registry = h.svc.registry();
    assert_eq!(registry.get_peer(&student.session.connection_id).unwrap().lecture_id, lecture());

    h.svc.join_room(&student.session, LectureId::new("L2")).await.unwrap();
    t2.expect("new-user-joined").await;
    assert_eq!(
        registry.get_peer(&student.session.connection_id).unwrap().lecture_id,
        LectureId::new("L2")
    );
    {
        let l1 = registry.get_room(&lecture()).unwrap();
        let state = l1.lock().await;
        assert_eq!(state.peer_count(), 1);
        assert!(!state.has_peer(&student.session.connection_id));
    }
    assert_eq!(registry.room_count(), 2);
}

#[tokio::test]
async fn unknown_transport_is_not_found() {
    let h = harness();
    let host = Client::new("teacher", Role::Teacher);
    let student = Client::new("student", Role::Student);
    h.svc.create_room(&host.session, lecture()).await.unwrap();
    h.svc.join_room(&student.session, lecture()).await.unwrap();
    let track = publish(&h, &host, MediaKind::Audio).await;
    let host_send = h
        .svc
        .create_transport(&host.session, None, Direction::Send)
        .await
        .unwrap();

    let missing = TransportId::new("missing");
    for transport_id in [&missing, &host_send.id] {
        let err = h
            .svc
            .connect_transport(&student.session, None, transport_id, handshake())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::TransportNotFound(_)));

        let err = h
            .svc
            .produce(
                &student.session,
                None,
                transport_id,
                MediaKind::Video,
                json!({}),
                None,
                Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::TransportNotFound(_)));

        let err = h
            .svc
            .consume(&student.session, None, &track, transport_id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::TransportNotFound(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
    assert_eq!(consumer_count(&h, &student).await, 0);
    assert_eq!(index_sizes(&h, &lecture()).await, (2, 1, 0));
}

#[tokio::test]
async fn failed_consume_registers_nothing() {
    let h = harness();
    let host = Client::new("teacher", Role::Teacher);
    let student = Client::new("student", Role::Student);
    h.svc.create_room(&host.session, lecture()).await.unwrap();
    h.svc.join_room(&student.session, lecture()).await.unwrap();
    let track = publish(&h, &host, MediaKind::Video).await;
    let recv = h
        .svc
        .create_transport(&student.session, None, Direction::Recv)
        .await
        .unwrap();

    h.engine.fail_next(EngineOp::Consume);
    let err = h
        .svc
        .consume(&student.session, None, &track, &recv.id, json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineFailure);
    assert_eq!(consumer_count(&h, &student).await, 0);
    assert_eq!(index_sizes(&h, &lecture()).await, (2, 1, 0));

    let info = h
        .svc
        .consume(&student.session, None, &track, &recv.id, json!({}))
        .await
        .unwrap();
    assert_eq!(info.producer_id, track);
    assert_eq!(consumer_count(&h, &student).await, 1);
    assert_eq!(index_sizes(&h, &lecture()).await, (2, 1, 1));
}

#[tokio::test]
async fn failed_connect_can_be_retried() {
    let h = harness();
    let host = Client::new("teacher", Role::Teacher);
    h.svc.create_room(&host.session, lecture()).await.unwrap();
    let send = h
        .svc
        .create_transport(&host.session, None, Direction::Send)
        .await
        .unwrap();

    h.engine.fail_next(EngineOp::Connect);
    let err = h
        .svc
        .connect_transport(&host.session, None, &send.id, handshake())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineFailure);
    assert_eq!(index_sizes(&h, &lecture()).await, (1, 0, 0));

    h.svc
        .connect_transport(&host.session, None, &send.id, handshake())
        .await
        .unwrap();
    h.svc
        .produce(
            &host.session,
            None,
            &send.id,
            MediaKind::Audio,
            json!({}),
            None,
            Value::Null,
        )
        .await
        .unwrap();

    let room = h.svc.registry().get_room(&lecture()).unwrap();
    let state = room.lock().await;
    let peer = state.peer(&host.session.connection_id).unwrap();
    assert_eq!(peer.transport_count(), 1);
    assert_eq!(peer.producer_count(), 1);
    assert_eq!(state.index_sizes(), (1, 1, 0));
}
