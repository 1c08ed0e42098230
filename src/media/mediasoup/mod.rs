#![forbid(unsafe_code)]

// mediasoup-backed media engine
// Handles mediasoup workers, routers, transports, producers, and consumers.
// mediasoup closes a resource when its last handle is dropped, so every
// wrapper keeps its handle in an Option and `close` takes it.

pub mod config;
pub mod worker_pool;

pub use config::MediasoupConfig;
pub use worker_pool::WorkerPool;

use crate::media::types::{
    ConsumerId, Direction, LectureId, MediaError, MediaKind, MediaResult, ProducerId, RouterId,
    TransportId, TransportInfo,
};
use crate::media::{
    EngineEvent, EngineEventSender, MediaConsumer, MediaEngine, MediaProducer, MediaRouter,
    MediaTransport,
};
use async_trait::async_trait;
use ::mediasoup::prelude::{
    Consumer, ConsumerOptions, DtlsParameters, Producer, ProducerOptions, Router, RouterOptions,
    RtpCapabilities, RtpParameters, WebRtcServer, WebRtcTransport, WebRtcTransportOptions,
    WebRtcTransportRemoteParameters,
};
use ::mediasoup::prelude::{Transport as _, TransportGeneric as _};
use ::mediasoup::worker::WorkerId;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

fn to_mediasoup_kind(kind: MediaKind) -> ::mediasoup::rtp_parameters::MediaKind {
    match kind {
        MediaKind::Audio => ::mediasoup::rtp_parameters::MediaKind::Audio,
        MediaKind::Video => ::mediasoup::rtp_parameters::MediaKind::Video,
    }
}

fn from_mediasoup_kind(kind: ::mediasoup::rtp_parameters::MediaKind) -> MediaKind {
    match kind {
        ::mediasoup::rtp_parameters::MediaKind::Audio => MediaKind::Audio,
        ::mediasoup::rtp_parameters::MediaKind::Video => MediaKind::Video,
    }
}

fn parse_producer_id(producer_id: &ProducerId) -> MediaResult<::mediasoup::producer::ProducerId> {
    producer_id
        .as_str()
        .parse()
        .map_err(|_| MediaError::InvalidParameters(format!("Invalid producer ID: {producer_id}")))
}

/// Main engine struct that coordinates all mediasoup operations
pub struct MediasoupEngine {
    pool: Arc<WorkerPool>,
    config: MediasoupConfig,
}

impl MediasoupEngine {
    /// Creates a new engine, spawning the worker pool
    pub async fn new(config: MediasoupConfig) -> MediaResult<Self> {
        info!("Initializing mediasoup engine with {} workers", config.num_workers);
        let pool = Arc::new(WorkerPool::new(&config).await?);
        Ok(Self { pool, config })
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_router(
        &self,
        lecture_id: &LectureId,
        events: EngineEventSender,
    ) -> MediaResult<Arc<dyn MediaRouter>> {
        let (worker, webrtc_server) = self.pool.acquire()?;
        let worker_id = worker.id();

        let router = match worker
            .create_router(RouterOptions::new(self.config.media_codecs.clone()))
            .await
        {
            Ok(router) => router,
            Err(e) => {
                self.pool.release(worker_id);
                return Err(MediaError::RouterError(format!("Failed to create router: {e}")));
            }
        };

        info!("Created router {} for lecture {} on worker {}", router.id(), lecture_id, worker_id);

        router
            .on_worker_close({
                let lecture_id = lecture_id.clone();
                move || warn!("Worker closed for router of lecture {}", lecture_id)
            })
            .detach();

        Ok(Arc::new(MediasoupRouter {
            id: RouterId::new(router.id().to_string()),
            router: Mutex::new(Some(router)),
            webrtc_server,
            worker_id,
            pool: self.pool.clone(),
            events,
        }))
    }

    async fn shutdown(&self) {
        self.pool.shutdown();
    }
}

pub struct MediasoupRouter {
    id: RouterId,
    router: Mutex<Option<Router>>,
    webrtc_server: WebRtcServer,
    worker_id: WorkerId,
    pool: Arc<WorkerPool>,
    events: EngineEventSender,
}

impl MediasoupRouter {
    fn router(&self) -> MediaResult<Router> {
        self.router
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Closed(format!("router {}", self.id)))
    }
}

#[async_trait]
impl MediaRouter for MediasoupRouter {
    fn id(&self) -> RouterId {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        self.router()
            .ok()
            .and_then(|router| serde_json::to_value(router.rtp_capabilities()).ok())
            .unwrap_or(Value::Null)
    }

    async fn create_transport(&self, direction: Direction) -> MediaResult<Arc<dyn MediaTransport>> {
        let router = self.router()?;
        let transport = router
            .create_webrtc_transport(WebRtcTransportOptions::new_with_server(
                self.webrtc_server.clone(),
            ))
            .await
            .map_err(|e| {
                MediaError::TransportError(format!("Failed to create {direction} transport: {e}"))
            })?;

        let id = TransportId::new(transport.id().to_string());
        transport
            .on_close({
                let events = self.events.clone();
                let transport_id = id.clone();
                Box::new(move || {
                    let _ = events.send(EngineEvent::TransportClosed { transport_id });
                })
            })
            .detach();
        transport
            .on_dtls_state_change({
                let transport_id = id.clone();
                move |dtls_state| {
                    debug!("DTLS state: {:?} for {} transport {}", dtls_state, direction, transport_id);
                }
            })
            .detach();

        let info = TransportInfo {
            id: id.clone(),
            handshake_params: json!({
                "iceParameters": transport.ice_parameters(),
                "iceCandidates": transport.ice_candidates(),
                "dtlsParameters": transport.dtls_parameters(),
            }),
        };

        Ok(Arc::new(MediasoupTransport {
            id,
            direction,
            info,
            transport: Mutex::new(Some(transport)),
            events: self.events.clone(),
        }))
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &Value) -> bool {
        let (Ok(router), Ok(producer_id)) = (self.router(), parse_producer_id(producer_id)) else {
            return false;
        };
        match serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) {
            Ok(caps) => router.can_consume(&producer_id, &caps),
            Err(_) => false,
        }
    }

    fn close(&self) {
        let taken = self.router.lock().unwrap_or_else(|e| e.into_inner()).take();
        if taken.is_some() {
            self.pool.release(self.worker_id);
            debug!("Closed router {}", self.id);
        }
    }
}

pub struct MediasoupTransport {
    id: TransportId,
    direction: Direction,
    info: TransportInfo,
    transport: Mutex<Option<WebRtcTransport>>,
    events: EngineEventSender,
}

impl MediasoupTransport {
    fn transport(&self) -> MediaResult<WebRtcTransport> {
        self.transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Closed(format!("transport {}", self.id)))
    }
}

#[async_trait]
impl MediaTransport for MediasoupTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn info(&self) -> TransportInfo {
        self.info.clone()
    }

    async fn connect(&self, handshake: Value) -> MediaResult<()> {
        let dtls_value = handshake.get("dtlsParameters").cloned().unwrap_or(handshake);
        let dtls_parameters: DtlsParameters = serde_json::from_value(dtls_value)
            .map_err(|e| MediaError::InvalidParameters(format!("Invalid DTLS parameters: {e}")))?;

        self.transport()?
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect transport: {e}")))
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Arc<dyn MediaProducer>> {
        let rtp_parameters: RtpParameters = serde_json::from_value(rtp_parameters)
            .map_err(|e| MediaError::InvalidParameters(format!("Invalid RTP parameters: {e}")))?;

        let producer = self
            .transport()?
            .produce(ProducerOptions::new(to_mediasoup_kind(kind), rtp_parameters))
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to create producer: {e}")))?;

        let id = ProducerId::new(producer.id().to_string());
        setup_producer_handlers(&producer, &id, &self.events);

        Ok(Arc::new(MediasoupProducer {
            id,
            kind,
            producer: Mutex::new(Some(producer)),
        }))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Arc<dyn MediaConsumer>> {
        let rtp_capabilities: RtpCapabilities = serde_json::from_value(rtp_capabilities)
            .map_err(|e| MediaError::InvalidParameters(format!("Invalid RTP capabilities: {e}")))?;

        let mut options = ConsumerOptions::new(parse_producer_id(producer_id)?, rtp_capabilities);
        options.paused = paused;

        let consumer = self
            .transport()?
            .consume(options)
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to create consumer: {e}")))?;

        let id = ConsumerId::new(consumer.id().to_string());
        consumer
            .on_close({
                let events = self.events.clone();
                let consumer_id = id.clone();
                move || {
                    let _ = events.send(EngineEvent::ConsumerClosed { consumer_id });
                }
            })
            .detach();

        Ok(Arc::new(MediasoupConsumer {
            id,
            producer_id: producer_id.clone(),
            kind: from_mediasoup_kind(consumer.kind()),
            consumer: Mutex::new(Some(consumer)),
        }))
    }

    fn close(&self) {
        self.transport.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

/// Forwards producer lifecycle callbacks onto the room's event channel.
/// Handlers are detached so they persist for the producer's lifetime.
fn setup_producer_handlers(producer: &Producer, id: &ProducerId, events: &EngineEventSender) {
    producer
        .on_pause({
            let events = events.clone();
            let producer_id = id.clone();
            move || {
                let _ = events.send(EngineEvent::ProducerPaused {
                    producer_id: producer_id.clone(),
                });
            }
        })
        .detach();

    producer
        .on_resume({
            let events = events.clone();
            let producer_id = id.clone();
            move || {
                let _ = events.send(EngineEvent::ProducerResumed {
                    producer_id: producer_id.clone(),
                });
            }
        })
        .detach();

    producer
        .on_close({
            let events = events.clone();
            let producer_id = id.clone();
            move || {
                let _ = events.send(EngineEvent::ProducerClosed { producer_id });
            }
        })
        .detach();
}

pub struct MediasoupProducer {
    id: ProducerId,
    kind: MediaKind,
    producer: Mutex<Option<Producer>>,
}

impl MediasoupProducer {
    fn producer(&self) -> MediaResult<Producer> {
        self.producer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Closed(format!("producer {}", self.id)))
    }
}

#[async_trait]
impl MediaProducer for MediasoupProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.producer().map(|p| p.paused()).unwrap_or(false)
    }

    async fn pause(&self) -> MediaResult<()> {
        self.producer()?
            .pause()
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to pause producer: {e}")))
    }

    async fn resume(&self) -> MediaResult<()> {
        self.producer()?
            .resume()
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to resume producer: {e}")))
    }

    fn close(&self) {
        self.producer.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

pub struct MediasoupConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    consumer: Mutex<Option<Consumer>>,
}

impl MediasoupConsumer {
    fn consumer(&self) -> MediaResult<Consumer> {
        self.consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Closed(format!("consumer {}", self.id)))
    }
}

#[async_trait]
impl MediaConsumer for MediasoupConsumer {
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
        self.consumer()
            .ok()
            .and_then(|c| serde_json::to_value(c.rtp_parameters()).ok())
            .unwrap_or(Value::Null)
    }

    fn paused(&self) -> bool {
        self.consumer().map(|c| c.paused()).unwrap_or(false)
    }

    async fn pause(&self) -> MediaResult<()> {
        self.consumer()?
            .pause()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to pause consumer: {e}")))
    }

    async fn resume(&self) -> MediaResult<()> {
        self.consumer()?
            .resume()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to resume consumer: {e}")))
    }

    fn close(&self) {
        self.consumer.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
