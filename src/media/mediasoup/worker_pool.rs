#![forbid(unsafe_code)]

// Worker pool management for mediasoup

use super::config::MediasoupConfig;
use crate::media::types::{MediaError, MediaResult};
use ::mediasoup::prelude::*;
use ::mediasoup::worker::WorkerId;
use std::sync::Mutex;
use tracing::{debug, error, info};

struct PooledWorker {
    worker: Worker,
    webrtc_server: WebRtcServer,
    routers: usize,
}

/// Pool of mediasoup workers, each with a WebRtcServer on its own UDP port
pub struct WorkerPool {
    workers: Mutex<Vec<PooledWorker>>,
    _manager: ::mediasoup::worker_manager::WorkerManager,
}

impl WorkerPool {
    /// Spawns `num_workers` workers
    ///
    /// # Errors
    /// Returns an error if a worker or its WebRtcServer cannot be created
    pub async fn new(config: &MediasoupConfig) -> MediaResult<Self> {
        info!("Creating worker pool with {} workers", config.num_workers);

        let manager = ::mediasoup::worker_manager::WorkerManager::new();
        let mut workers = Vec::with_capacity(config.num_workers);

        for index in 0..config.num_workers {
            let worker = manager
                .create_worker(config.to_worker_settings())
                .await
                .map_err(|e| MediaError::RouterError(format!("Failed to create worker: {e}")))?;
            let worker_id = worker.id();

            worker
                .on_dead(move |_reason| {
                    error!("Worker {} (index {}) died", worker_id, index);
                })
                .detach();

            let listen_info = config.server_listen_info(index);
            let port = listen_info.port.unwrap_or_default();
            let webrtc_server = worker
                .create_webrtc_server(WebRtcServerOptions::new(WebRtcServerListenInfos::new(
                    listen_info,
                )))
                .await
                .map_err(|e| {
                    MediaError::RouterError(format!(
                        "Failed to create WebRtcServer on port {port} for worker {worker_id}: {e}"
                    ))
                })?;

            info!("Created worker {} with WebRtcServer on UDP port {}", worker_id, port);
            workers.push(PooledWorker {
                worker,
                webrtc_server,
                routers: 0,
            });
        }

        Ok(Self {
            workers: Mutex::new(workers),
            _manager: manager,
        })
    }

    /// Picks the worker hosting the fewest routers and charges one router to it
    pub fn acquire(&self) -> MediaResult<(Worker, WebRtcServer)> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let pooled = workers
            .iter_mut()
            .filter(|w| !w.worker.closed())
            .min_by_key(|w| w.routers)
            .ok_or_else(|| MediaError::RouterError("No workers available".to_string()))?;
        pooled.routers += 1;
        debug!("Selected worker {} ({} routers)", pooled.worker.id(), pooled.routers);
        Ok((pooled.worker.clone(), pooled.webrtc_server.clone()))
    }

    /// Returns a router slot to its worker
    pub fn release(&self, worker_id: WorkerId) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pooled) = workers.iter_mut().find(|w| w.worker.id() == worker_id) {
            pooled.routers = pooled.routers.saturating_sub(1);
        }
    }

    /// Drops every WebRtcServer and worker
    pub fn shutdown(&self) {
        info!("Shutting down all workers");
        // Workers close when their last handle is dropped
        self.workers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
