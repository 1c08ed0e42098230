#![forbid(unsafe_code)]

// Media module - seam to the media transport engine
// The engine owns routers, transports, producers and consumers; the
// signaling core only drives it and reacts to its lifecycle events.

pub mod loopback;
#[cfg(feature = "mediasoup")]
pub mod mediasoup;
pub mod types;

pub use loopback::LoopbackEngine;
pub use types::{
    ConnectionId, ConsumerId, ConsumerInfo, Direction, LectureId, MediaError, MediaKind,
    MediaResult, ProducerId, RouterId, TrackSource, TransportId, TransportInfo, UserId,
};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle transitions reported by the engine for resources of one router.
///
/// Delivered on the router's event channel; the owning room applies them
/// under its critical section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ProducerPaused { producer_id: ProducerId },
    ProducerResumed { producer_id: ProducerId },
    ProducerClosed { producer_id: ProducerId },
    ConsumerClosed { consumer_id: ConsumerId },
    TransportClosed { transport_id: TransportId },
}

/// Sending half handed to the engine when a router is created.
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Creates routers. One router backs one live lecture.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Creates a router whose resources report lifecycle events on `events`
    async fn create_router(
        &self,
        lecture_id: &LectureId,
        events: EngineEventSender,
    ) -> MediaResult<Arc<dyn MediaRouter>>;

    /// Releases engine-wide resources (workers)
    async fn shutdown(&self) {}
}

#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> RouterId;

    /// Codec/parameter descriptor clients need before negotiating transports
    fn rtp_capabilities(&self) -> Value;

    async fn create_transport(&self, direction: Direction) -> MediaResult<Arc<dyn MediaTransport>>;

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &Value) -> bool;

    fn close(&self);
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn direction(&self) -> Direction;

    fn info(&self) -> TransportInfo;

    /// Completes the network handshake with the client's parameters
    async fn connect(&self, handshake: Value) -> MediaResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Arc<dyn MediaProducer>>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Arc<dyn MediaConsumer>>;

    fn close(&self);
}

#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn paused(&self) -> bool;

    async fn pause(&self) -> MediaResult<()>;

    async fn resume(&self) -> MediaResult<()>;

    fn close(&self);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> Value;

    fn paused(&self) -> bool;

    async fn pause(&self) -> MediaResult<()>;

    async fn resume(&self) -> MediaResult<()>;

    fn close(&self);
}
