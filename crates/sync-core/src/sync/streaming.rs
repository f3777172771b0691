//! Sensor streaming session
//!
//! Drains a sample source through the chunk builder:
//! - Sealed chunks go straight to the ingest endpoint when auto-sync is on
//! - Failed or deferred chunks land in the offline queue
//! - Stopping seals the partial window and waits for dispatched chunks

use crate::config::SensorConfig;
use crate::models::{Chunk, Priority, RecordType};
use crate::observability::{StructuredLogger, SyncMetrics};
use crate::sensor::{ChunkBuilder, SampleSource};
use crate::sync::queue::OfflineQueue;
use crate::sync::transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Counters for one streaming session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingStats {
    pub samples_received: u64,
    pub chunks_sealed: u64,
    pub chunks_sent: u64,
    pub chunks_queued: u64,
    /// Chunks that could neither be sent nor queued
    pub chunks_lost: u64,
    pub last_error: Option<String>,
}

/// Streams sensor samples to the collection service in chunks
pub struct SensorStreamer {
    config: SensorConfig,
    record_type: RecordType,
    transport: Arc<dyn Transport>,
    queue: Arc<OfflineQueue>,
    stats: Arc<RwLock<StreamingStats>>,
    logger: StructuredLogger,
    metrics: SyncMetrics,
}

impl SensorStreamer {
    pub fn new(
        config: SensorConfig,
        record_type: RecordType,
        transport: Arc<dyn Transport>,
        queue: Arc<OfflineQueue>,
    ) -> Self {
        let logger = StructuredLogger::new(config.device_id.clone());
        Self {
            config,
            record_type,
            transport,
            queue,
            stats: Arc::new(RwLock::new(StreamingStats::default())),
            logger,
            metrics: SyncMetrics::new(),
        }
    }

    pub fn stats_handle(&self) -> Arc<RwLock<StreamingStats>> {
        Arc::clone(&self.stats)
    }

    /// Start draining `source` on a background task
    pub fn start(self: Arc<Self>, mut source: Box<dyn SampleSource>) -> StreamHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let streamer = self;

        let task = tokio::spawn(async move {
            let mut builder = ChunkBuilder::new(&streamer.config);
            let mut dispatched = JoinSet::new();

            info!(
                source = source.name(),
                record_type = %streamer.record_type,
                max_samples = builder.max_samples(),
                "Sensor streaming started"
            );

            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown_rx => {
                        debug!("Sensor streaming stop requested");
                        break;
                    }

                    sample = source.next_sample() => {
                        let Some(sample) = sample else {
                            debug!("Sample source ended");
                            break;
                        };
                        streamer.stats.write().await.samples_received += 1;

                        if let Some(chunk) = builder.add_sample(sample.x, sample.y, sample.z, sample.t_offset_ms, sample.ts) {
                            let streamer = Arc::clone(&streamer);
                            dispatched.spawn(async move { streamer.dispatch(chunk).await });
                        }
                    }

                    // Reap finished dispatches so the set does not grow
                    Some(_) = dispatched.join_next(), if !dispatched.is_empty() => {}
                }
            }

            // Readings already delivered still count
            while let Some(sample) = source.try_next_sample() {
                streamer.stats.write().await.samples_received += 1;
                if let Some(chunk) = builder.add_sample(sample.x, sample.y, sample.z, sample.t_offset_ms, sample.ts) {
                    let streamer = Arc::clone(&streamer);
                    dispatched.spawn(async move { streamer.dispatch(chunk).await });
                }
            }

            // A partial window is sealed rather than dropped
            if let Some(chunk) = builder.force_flush() {
                let streamer = Arc::clone(&streamer);
                dispatched.spawn(async move { streamer.dispatch(chunk).await });
            }

            // Dispatched requests run to completion
            while dispatched.join_next().await.is_some() {}

            let stats = streamer.stats.read().await.clone();
            info!(
                samples = stats.samples_received,
                chunks = stats.chunks_sealed,
                sent = stats.chunks_sent,
                queued = stats.chunks_queued,
                "Sensor streaming stopped"
            );
            stats
        });

        StreamHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// Send a sealed chunk, or queue it when sending is off or fails
    pub async fn dispatch(&self, chunk: Chunk) {
        self.metrics.inc_chunks_sealed();
        self.stats.write().await.chunks_sealed += 1;

        let samples = chunk.samples.len();
        let payload = match serde_json::to_value(&chunk) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize chunk");
                let mut stats = self.stats.write().await;
                stats.chunks_lost += 1;
                stats.last_error = Some(e.to_string());
                return;
            }
        };

        if self.config.auto_sync {
            let endpoint = format!("ingest/{}", self.record_type);
            match self.transport.send(&endpoint, &payload).await {
                Ok(_) => {
                    self.logger.log_chunk_sealed(samples, &endpoint);
                    self.stats.write().await.chunks_sent += 1;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, kind = e.kind().as_str(), "Chunk upload failed, queueing");
                    self.stats.write().await.last_error = Some(e.to_string());
                }
            }
        }

        match self
            .queue
            .enqueue(self.record_type.as_str(), payload, Priority::Low)
            .await
        {
            Ok(_) => {
                self.logger.log_chunk_sealed(samples, "queue");
                self.stats.write().await.chunks_queued += 1;
            }
            Err(e) => {
                warn!(error = %e, "Failed to queue chunk");
                let mut stats = self.stats.write().await;
                stats.chunks_lost += 1;
                stats.last_error = Some(e.to_string());
            }
        }
    }
}

/// Handle to a running streaming session
pub struct StreamHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<StreamingStats>,
}

impl StreamHandle {
    /// Stop streaming, flush the partial chunk and wait for dispatched chunks
    pub async fn stop(mut self) -> StreamingStats {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match (&mut self.task).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Sensor streaming task ended abnormally");
                StreamingStats::default()
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
