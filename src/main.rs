#![forbid(unsafe_code)]

use anyhow::Result;
use lecture_sfu::attendance::TracingLedger;
use lecture_sfu::config::Config;
use lecture_sfu::media::MediaEngine;
use lecture_sfu::metrics::ServerMetrics;
use lecture_sfu::registry::SessionRegistry;
use lecture_sfu::signaling::service::{ServiceSettings, SignalingService};
use lecture_sfu::signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "mediasoup")]
async fn build_engine() -> Result<Arc<dyn MediaEngine>> {
    use lecture_sfu::media::mediasoup::{MediasoupConfig, MediasoupEngine};

    let config = MediasoupConfig::from_lookup(&|key| std::env::var(key).ok())?;
    info!("Using ANNOUNCE_IP={}", config.announced_ip);
    let engine = MediasoupEngine::new(config).await?;
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "mediasoup"))]
async fn build_engine() -> Result<Arc<dyn MediaEngine>> {
    info!("Built without the mediasoup feature, running the loopback media engine");
    Ok(Arc::new(lecture_sfu::media::LoopbackEngine::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lecture_sfu=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("lecture-sfu - Starting server");

    let config = Config::from_env()?;
    let engine = build_engine().await?;
    info!("Media engine initialized");

    let metrics = ServerMetrics::new();
    let service = Arc::new(SignalingService::new(
        engine,
        Arc::new(SessionRegistry::new()),
        Arc::new(TracingLedger),
        metrics,
        ServiceSettings {
            max_consumers_per_peer: config.max_consumers_per_peer,
            notify_replaced_session: config.notify_replaced_session,
        },
    ));

    let signaling_server = SignalingServer::new(service.clone(), &config);
    info!("Starting signaling server on port {}", config.port);

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }
    service.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
