#![forbid(unsafe_code)]

// Loopback media engine - in-process engine with no packet I/O
// Mirrors the resource lifecycle of a real SFU (closing a producer closes its
// consumers, closing a transport closes everything on it) so the signaling
// layer can run signaling-only or under test.

use super::types::{
    ConsumerId, Direction, LectureId, MediaError, MediaKind, MediaResult, ProducerId, RouterId,
    TransportId, TransportInfo,
};
use super::{
    EngineEvent, EngineEventSender, MediaConsumer, MediaEngine, MediaProducer, MediaRouter,
    MediaTransport,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Engine operation that can be made to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    CreateRouter,
    CreateTransport,
    Connect,
    Produce,
    Consume,
}

/// One-shot failures armed by tests
#[derive(Default)]
struct Faults {
    armed: Mutex<HashMap<EngineOp, usize>>,
}

impl Faults {
    fn arm(&self, op: EngineOp) {
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        *armed.entry(op).or_insert(0) += 1;
    }

    fn take(&self, op: EngineOp) -> bool {
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        match armed.get_mut(&op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

/// In-process media engine
#[derive(Clone, Default)]
pub struct LoopbackEngine {
    faults: Arc<Faults>,
    routers_created: Arc<AtomicUsize>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call of `op` fail with an engine error
    pub fn fail_next(&self, op: EngineOp) {
        self.faults.arm(op);
    }

    /// Number of routers created so far
    pub fn routers_created(&self) -> usize {
        self.routers_created.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(
        &self,
        lecture_id: &LectureId,
        events: EngineEventSender,
    ) -> MediaResult<Arc<dyn MediaRouter>> {
        if self.faults.take(EngineOp::CreateRouter) {
            return Err(MediaError::RouterError("router creation rejected".to_string()));
        }
        self.routers_created.fetch_add(1, Ordering::Relaxed);
        let router = Arc::new(LoopbackRouter::new(events, self.faults.clone()));
        debug!("Loopback router {} created for lecture {}", router.id, lecture_id);
        Ok(router)
    }
}

struct RouterShared {
    events: EngineEventSender,
    faults: Arc<Faults>,
    producers: Mutex<HashMap<ProducerId, Weak<LoopbackProducer>>>,
    consumers: Mutex<HashMap<ConsumerId, Weak<LoopbackConsumer>>>,
    transports: Mutex<HashMap<TransportId, Weak<LoopbackTransport>>>,
    closed: AtomicBool,
}

/// What rides on one transport. Members remove themselves when they close.
#[derive(Default)]
struct Carried {
    producers: Mutex<HashMap<ProducerId, Weak<LoopbackProducer>>>,
    consumers: Mutex<HashMap<ConsumerId, Weak<LoopbackConsumer>>>,
}

impl RouterShared {
    fn emit(&self, event: EngineEvent) {
        // Receiver is gone once the room is torn down
        let _ = self.events.send(event);
    }

    fn producer(&self, producer_id: &ProducerId) -> Option<Arc<LoopbackProducer>> {
        let producers = self.producers.lock().unwrap_or_else(|e| e.into_inner());
        producers.get(producer_id).and_then(Weak::upgrade)
    }

    fn consumers_of(&self, producer_id: &ProducerId) -> Vec<Arc<LoopbackConsumer>> {
        let consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
        consumers
            .values()
            .filter_map(Weak::upgrade)
            .filter(|c| &c.producer_id == producer_id)
            .collect()
    }
}

pub struct LoopbackRouter {
    id: RouterId,
    shared: Arc<RouterShared>,
}

impl LoopbackRouter {
    fn new(events: EngineEventSender, faults: Arc<Faults>) -> Self {
        Self {
            id: RouterId::random(),
            shared: Arc::new(RouterShared {
                events,
                faults,
                producers: Mutex::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
                transports: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn open_transport(&self, direction: Direction) -> MediaResult<Arc<LoopbackTransport>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed(format!("router {}", self.id)));
        }
        if self.shared.faults.take(EngineOp::CreateTransport) {
            return Err(MediaError::TransportError("transport creation rejected".to_string()));
        }
        let transport = Arc::new(LoopbackTransport {
            id: TransportId::random(),
            direction,
            router: self.shared.clone(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            carried: Arc::default(),
        });
        self.shared
            .transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(transport.id.clone(), Arc::downgrade(&transport));
        Ok(transport)
    }
}

#[async_trait]
impl MediaRouter for LoopbackRouter {
    fn id(&self) -> RouterId {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        json!({
            "codecs": [
                {
                    "kind": "audio",
                    "mimeType": "audio/opus",
                    "clockRate": 48000,
                    "channels": 2,
                    "preferredPayloadType": 111,
                    "rtcpFeedback": [{ "type": "transport-cc" }]
                },
                {
                    "kind": "video",
                    "mimeType": "video/VP8",
                    "clockRate": 90000,
                    "preferredPayloadType": 96,
                    "rtcpFeedback": [
                        { "type": "nack" },
                        { "type": "nack", "parameter": "pli" },
                        { "type": "ccm", "parameter": "fir" },
                        { "type": "goog-remb" },
                        { "type": "transport-cc" }
                    ]
                }
            ],
            "headerExtensions": []
        })
    }

    async fn create_transport(&self, direction: Direction) -> MediaResult<Arc<dyn MediaTransport>> {
        Ok(self.open_transport(direction)?)
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &Value) -> bool {
        rtp_capabilities.is_object() && self.shared.producer(producer_id).is_some()
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let transports: Vec<_> = {
            let mut transports = self.shared.transports.lock().unwrap_or_else(|e| e.into_inner());
            transports.drain().filter_map(|(_, t)| t.upgrade()).collect()
        };
        for transport in transports {
            transport.close();
        }
        debug!("Loopback router {} closed", self.id);
    }
}

pub struct LoopbackTransport {
    id: TransportId,
    direction: Direction,
    router: Arc<RouterShared>,
    connected: AtomicBool,
    closed: AtomicBool,
    carried: Arc<Carried>,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> MediaResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(MediaError::Closed(format!("transport {}", self.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            id: self.id.clone(),
            handshake_params: json!({
                "iceParameters": {
                    "usernameFragment": format!("lb-{}", &self.id.as_str()[..8.min(self.id.as_str().len())]),
                    "password": "loopback",
                    "iceLite": true
                },
                "iceCandidates": [],
                "dtlsParameters": { "role": "auto", "fingerprints": [] }
            }),
        }
    }

    async fn connect(&self, handshake: Value) -> MediaResult<()> {
        self.ensure_open()?;
        if self.router.faults.take(EngineOp::Connect) {
            return Err(MediaError::TransportError("handshake rejected".to_string()));
        }
        if !handshake.is_object() {
            return Err(MediaError::InvalidParameters(
                "handshake parameters must be an object".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(MediaError::TransportError(format!(
                "transport {} already connected",
                self.id
            )));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Arc<dyn MediaProducer>> {
        self.ensure_open()?;
        if self.direction != Direction::Send {
            return Err(MediaError::TransportError(format!(
                "cannot produce on {} transport {}",
                self.direction, self.id
            )));
        }
        if self.router.faults.take(EngineOp::Produce) {
            return Err(MediaError::ProducerError("producer rejected".to_string()));
        }
        if !rtp_parameters.is_object() {
            return Err(MediaError::InvalidParameters(
                "rtp parameters must be an object".to_string(),
            ));
        }
        let producer = Arc::new(LoopbackProducer {
            id: ProducerId::random(),
            kind,
            router: self.router.clone(),
            carrier: self.carried.clone(),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.router
            .producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(producer.id.clone(), Arc::downgrade(&producer));
        self.carried
            .producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(producer.id.clone(), Arc::downgrade(&producer));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Arc<dyn MediaConsumer>> {
        self.ensure_open()?;
        if self.direction != Direction::Recv {
            return Err(MediaError::TransportError(format!(
                "cannot consume on {} transport {}",
                self.direction, self.id
            )));
        }
        if self.router.faults.take(EngineOp::Consume) {
            return Err(MediaError::ConsumerError("consumer rejected".to_string()));
        }
        if !rtp_capabilities.is_object() {
            return Err(MediaError::InvalidParameters(
                "rtp capabilities must be an object".to_string(),
            ));
        }
        let producer = self
            .router
            .producer(producer_id)
            .ok_or_else(|| MediaError::ConsumerError(format!("producer {producer_id} not found")))?;

        let consumer = Arc::new(LoopbackConsumer {
            id: ConsumerId::random(),
            producer_id: producer_id.clone(),
            kind: producer.kind,
            router: self.router.clone(),
            carrier: self.carried.clone(),
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
        });
        self.router
            .consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(consumer.id.clone(), Arc::downgrade(&consumer));
        self.carried
            .consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(consumer.id.clone(), Arc::downgrade(&consumer));
        Ok(consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let consumers: Vec<_> = self
            .carried
            .consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .filter_map(|(_, c)| c.upgrade())
            .collect();
        for consumer in consumers {
            consumer.close();
        }
        let producers: Vec<_> = self
            .carried
            .producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .filter_map(|(_, p)| p.upgrade())
            .collect();
        for producer in producers {
            producer.close();
        }
        self.router
            .transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        self.router.emit(EngineEvent::TransportClosed {
            transport_id: self.id.clone(),
        });
    }
}

pub struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    router: Arc<RouterShared>,
    carrier: Arc<Carried>,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl MediaProducer for LoopbackProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn pause(&self) -> MediaResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed(format!("producer {}", self.id)));
        }
        if !self.paused.swap(true, Ordering::AcqRel) {
            self.router.emit(EngineEvent::ProducerPaused {
                producer_id: self.id.clone(),
            });
        }
        Ok(())
    }

    async fn resume(&self) -> MediaResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed(format!("producer {}", self.id)));
        }
        if self.paused.swap(false, Ordering::AcqRel) {
            self.router.emit(EngineEvent::ProducerResumed {
                producer_id: self.id.clone(),
            });
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.router
            .producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        self.carrier
            .producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        for consumer in self.router.consumers_of(&self.id) {
            consumer.close();
        }
        self.router.emit(EngineEvent::ProducerClosed {
            producer_id: self.id.clone(),
        });
    }
}

pub struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    router: Arc<RouterShared>,
    carrier: Arc<Carried>,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl MediaConsumer for LoopbackConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        json!({
            "mid": self.id.as_str(),
            "codecs": [],
            "encodings": [],
            "rtcp": { "reducedSize": true }
        })
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn pause(&self) -> MediaResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed(format!("consumer {}", self.id)));
        }
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    async fn resume(&self) -> MediaResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed(format!("consumer {}", self.id)));
        }
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.router
            .consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        self.carrier
            .consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        self.router.emit(EngineEvent::ConsumerClosed {
            consumer_id: self.id.clone(),
        });
    }
}
