#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{AckFrame, ClientFrame, Identity, ServerMessage};
use super::service::{ClientSession, SignalingService};
use crate::error::ErrorKind;
use crate::media::types::ConnectionId;
use crate::metrics::Counter;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale, drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;

/// Per-connection limits
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Close the socket if nothing arrives within this duration
    pub idle_timeout: Duration,
    /// Token bucket refill rate and burst size
    pub rate_limit_per_sec: u64,
}

/// Token bucket over inbound frames
struct RateLimiter {
    tokens_us: u64,
    max_tokens_us: u64,
    refill_per_sec: u64,
    last_refill: Instant,
    warned: bool,
}

impl RateLimiter {
    fn new(per_sec: u64) -> Self {
        let per_sec = per_sec.max(1);
        Self {
            tokens_us: per_sec * TOKEN_US,
            max_tokens_us: per_sec * TOKEN_US,
            refill_per_sec: per_sec,
            last_refill: Instant::now(),
            warned: false,
        }
    }

    /// Takes a token. Returns false when the bucket is empty.
    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed_us = now.duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(self.refill_per_sec))
            .min(self.max_tokens_us);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            true
        } else {
            false
        }
    }

    /// True the first time in a limited streak
    fn should_warn(&mut self) -> bool {
        !std::mem::replace(&mut self.warned, true)
    }
}

/// Serialize a frame and send it through the channel as pre-serialized JSON.
fn send_json<T: Serialize>(sender: &mpsc::Sender<Arc<String>>, frame: &T) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(frame)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Queues a reply to the client, logging when it cannot be delivered.
/// A full channel means the client has stopped reading; its request stays
/// unanswered.
fn reply<T: Serialize>(
    sender: &mpsc::Sender<Arc<String>>,
    frame: &T,
    connection_id: &ConnectionId,
) -> bool {
    match send_json(sender, frame) {
        Ok(()) => true,
        Err(e) => {
            warn!("Dropped reply to {}: {}", connection_id, e);
            false
        }
    }
}

fn send_error(
    sender: &mpsc::Sender<Arc<String>>,
    message: String,
    code: Option<ErrorKind>,
    connection_id: &ConnectionId,
) {
    reply(sender, &ServerMessage::Error { message, code }, connection_id);
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    identity: Identity,
    service: Arc<SignalingService>,
    limits: ConnectionLimits,
    _permit: OwnedSemaphorePermit,
) {
    let metrics = service.metrics().clone();
    metrics.inc(Counter::Connections);
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);
    let session = ClientSession::new(identity, tx.clone());
    let connection_id = session.connection_id.clone();
    info!(
        "New WebSocket connection {} for user {} ({})",
        connection_id, session.identity.user_id, session.identity.role
    );

    // Spawn task to send messages to client
    let send_metrics = metrics.clone();
    let send_connection_id = connection_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc(Counter::FramesSent);
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
        debug!("Send task finished for connection: {}", send_connection_id);
    });

    let mut limiter = RateLimiter::new(limits.rate_limit_per_sec);

    loop {
        // Idle timeout: close connection if no message within the limit
        let msg = match tokio::time::timeout(limits.idle_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc(Counter::FramesReceived);

                if !limiter.try_acquire(Instant::now()) {
                    if limiter.should_warn() {
                        warn!("Rate limit exceeded for connection {}", connection_id);
                        send_error(
                            &tx,
                            format!(
                                "Rate limit exceeded: max {} messages/second",
                                limits.rate_limit_per_sec
                            ),
                            None,
                            &connection_id,
                        );
                    }
                    continue;
                }

                let frame = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Invalid message format from {}: {}", connection_id, e);
                        metrics.inc(Counter::Errors);
                        send_error(
                            &tx,
                            format!("Invalid message format: {e}"),
                            Some(ErrorKind::InvalidRequest),
                            &connection_id,
                        );
                        continue;
                    }
                };

                let op = frame.request.name();
                let start = Instant::now();
                let result = service.handle(&session, frame.request).await;
                metrics.observe_operation(start.elapsed());

                match (frame.ack, result) {
                    (Some(ack), Ok(response)) => {
                        reply(&tx, &AckFrame::ok(ack, response), &connection_id);
                    }
                    (None, Ok(_)) => {}
                    (ack, Err(e)) => {
                        debug!("{} failed for {}: {}", op, connection_id, e);
                        metrics.inc(Counter::Errors);
                        match ack {
                            Some(ack) => {
                                reply(&tx, &AckFrame::err(ack, &e), &connection_id);
                            }
                            None => send_error(&tx, e.to_string(), Some(e.kind()), &connection_id),
                        }
                    }
                }

                // If channel is closed, send task has exited
                if tx.is_closed() {
                    break;
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            Message::Binary(_) => {
                warn!("Unexpected binary message from client {}", connection_id);
            }
        }
    }

    service.disconnect(&connection_id).await;

    // _conn_guard dropped here, decrementing connections_active
    // _permit dropped here, releasing the semaphore
    drop(session);
    drop(tx);
    if let Err(e) = send_task.await {
        error!("Send task for {} panicked: {}", connection_id, e);
    }

    info!("Connection handler finished for connection: {}", connection_id);
}
