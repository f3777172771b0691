//! Sync orchestration
//!
//! Reads records from the data source and submits them type by type:
//! - Record types are processed sequentially; one failing type never aborts the run
//! - Each type goes to its routed endpoint, to both endpoints in parallel mode,
//!   or one record at a time for configured legacy types
//! - Progress is reported per type and completion is published to subscribers

use crate::config::{OrchestratorConfig, RoutingConfig};
use crate::models::{Priority, RecordType, SyncEvent, SyncPhase, SyncProgress, SyncSummary};
use crate::observability::{StructuredLogger, SyncMetrics};
use crate::source::{HealthDataSource, SourceError, TimeRange};
use crate::sync::queue::OfflineQueue;
use crate::sync::remote::{CommandError, CommandOutcome, RemoteCommand};
use crate::sync::transport::{Transport, TransportError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Capacity of the event channel; slow subscribers miss older events
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Receives progress updates during a sync run
pub type ProgressCallback = Arc<dyn Fn(&SyncProgress) + Send + Sync>;

/// Window and progress reporting for one run
#[derive(Clone, Default)]
pub struct SyncOptions {
    /// Window start; each type's watermark (or the default lookback) when unset
    pub from: Option<DateTime<Utc>>,
    /// Window end; now when unset
    pub to: Option<DateTime<Utc>>,
    pub on_progress: Option<ProgressCallback>,
}

impl SyncOptions {
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }
}

/// Errors from operations that act on a single record type
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Why one record type failed within a run
enum TypeFailure {
    Read(SourceError),
    Submit {
        error: TransportError,
        /// Records not accepted by the service
        pending: Vec<Value>,
    },
}

/// Drives sync runs from the data source to the collection service
pub struct SyncOrchestrator {
    config: OrchestratorConfig,
    routing: RoutingConfig,
    source: Arc<dyn HealthDataSource>,
    transport: Arc<dyn Transport>,
    queue: Option<Arc<OfflineQueue>>,
    /// End of the last window each type was delivered or queued for
    watermarks: RwLock<BTreeMap<RecordType, DateTime<Utc>>>,
    events: broadcast::Sender<SyncEvent>,
    // Runs are serialized so their watermarks never interleave
    run_lock: Mutex<()>,
    logger: StructuredLogger,
    metrics: SyncMetrics,
}

impl SyncOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        routing: RoutingConfig,
        source: Arc<dyn HealthDataSource>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            routing,
            source,
            transport,
            queue: None,
            watermarks: RwLock::new(BTreeMap::new()),
            events,
            run_lock: Mutex::new(()),
            logger: StructuredLogger::new("orchestrator"),
            metrics: SyncMetrics::new(),
        }
    }

    /// Queue records of failed types for later delivery
    pub fn with_queue(mut self, queue: Arc<OfflineQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Subscribe to completion and error events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// End of the last window whose records of `record_type` were delivered or queued
    pub async fn last_sync(&self, record_type: &RecordType) -> Option<DateTime<Utc>> {
        self.watermarks.read().await.get(record_type).copied()
    }

    pub async fn watermarks(&self) -> BTreeMap<RecordType, DateTime<Utc>> {
        self.watermarks.read().await.clone()
    }

    /// Restore watermarks persisted elsewhere
    pub async fn set_watermarks(&self, watermarks: BTreeMap<RecordType, DateTime<Utc>>) {
        *self.watermarks.write().await = watermarks;
    }

    /// Record types covered by `sync_all`
    pub fn record_types(&self) -> Vec<RecordType> {
        if self.config.record_types.is_empty() {
            return RecordType::all_health();
        }
        self.config
            .record_types
            .iter()
            .filter_map(|raw| match RecordType::parse(raw) {
                Ok(record_type) => Some(record_type),
                Err(e) => {
                    warn!(error = %e, "Skipping configured record type");
                    None
                }
            })
            .collect()
    }

    /// Sync every configured record type
    pub async fn sync_all(&self, options: SyncOptions) -> SyncSummary {
        let types = self.record_types();
        self.run(&types, options).await
    }

    /// Sync only `types`, for partial on-demand syncs
    pub async fn sync_specific_types(&self, types: &[RecordType], options: SyncOptions) -> SyncSummary {
        self.run(types, options).await
    }

    async fn run(&self, types: &[RecordType], options: SyncOptions) -> SyncSummary {
        let _run = self.run_lock.lock().await;
        let started = Instant::now();
        let end_time = options.to.unwrap_or_else(Utc::now);
        let windows = self.windows(types, &options, end_time).await;
        let earliest = windows
            .iter()
            .map(|(_, range)| range.start_time)
            .min()
            .unwrap_or(end_time);
        self.logger.log_sync_started(
            types.len(),
            &earliest.to_rfc3339(),
            &end_time.to_rfc3339(),
        );

        let ready = match self.source.initialize().await {
            Ok(true) => true,
            Ok(false) => {
                warn!("Data source unavailable, no records read");
                false
            }
            Err(e) => {
                warn!(error = %e, "Data source failed to initialize");
                false
            }
        };

        // Read everything first so progress has a stable denominator
        let mut batches = Vec::with_capacity(windows.len());
        for (record_type, range) in windows {
            let read = if ready {
                self.source.read_records(&record_type, &range).await
            } else {
                Err(SourceError::NotInitialized)
            };
            batches.push((record_type, range, read));
        }
        let total: usize = batches
            .iter()
            .map(|(_, _, read)| read.as_ref().map(Vec::len).unwrap_or(0))
            .sum();

        let mut synced = 0;
        let mut current = 0;
        let mut failed_types = Vec::new();
        let mut covered = Vec::new();

        for (record_type, range, read) in batches {
            let outcome = match read {
                Ok(records) if records.is_empty() => {
                    covered.push(record_type);
                    continue;
                }
                Ok(records) => {
                    current += records.len();
                    self.submit(&record_type, records).await
                }
                Err(e) => Err((0, TypeFailure::Read(e))),
            };

            match outcome {
                Ok(sent) => {
                    synced += sent;
                    self.metrics.inc_records_synced(sent);
                    debug!(record_type = %record_type, records = sent, "Record type synced");
                    covered.push(record_type.clone());
                }
                Err((sent, failure)) => {
                    synced += sent;
                    self.metrics.inc_records_synced(sent);
                    self.metrics.inc_record_type_failures();
                    failed_types.push(record_type.to_string());
                    if self.handle_failure(&record_type, failure).await {
                        covered.push(record_type.clone());
                    } else {
                        // The next run reads this window again
                        debug!(
                            record_type = %record_type,
                            from = %range.start_time.to_rfc3339(),
                            "Watermark held back"
                        );
                    }
                }
            }

            Self::report(
                &options,
                SyncProgress {
                    current,
                    total,
                    phase: SyncPhase::Syncing,
                    current_type: Some(record_type.to_string()),
                },
            );
        }

        Self::report(
            &options,
            SyncProgress {
                current,
                total,
                phase: SyncPhase::Completed,
                current_type: None,
            },
        );

        let summary = SyncSummary {
            total,
            synced,
            timestamp: Utc::now(),
            failed_types,
        };
        {
            let mut watermarks = self.watermarks.write().await;
            for record_type in covered {
                watermarks.insert(record_type, end_time);
            }
        }

        let elapsed = started.elapsed();
        self.metrics.observe_sync_duration(elapsed);
        self.logger.log_sync_completed(&summary, elapsed);

        // No subscribers is not an error
        let _ = self.events.send(SyncEvent::SyncCompleted {
            timestamp: summary.timestamp,
            total: summary.total,
        });

        summary
    }

    /// Read window of each type: `options.from`, else its own watermark, else the default lookback
    async fn windows(
        &self,
        types: &[RecordType],
        options: &SyncOptions,
        end_time: DateTime<Utc>,
    ) -> Vec<(RecordType, TimeRange)> {
        let lookback = end_time - ChronoDuration::hours(self.config.default_lookback_hours);
        let watermarks = self.watermarks.read().await;
        types
            .iter()
            .map(|record_type| {
                let start_time = options
                    .from
                    .or_else(|| watermarks.get(record_type).copied())
                    .unwrap_or(lookback);
                (record_type.clone(), TimeRange::new(start_time, end_time))
            })
            .collect()
    }

    fn report(options: &SyncOptions, progress: SyncProgress) {
        if let Some(callback) = &options.on_progress {
            callback(&progress);
        }
    }

    /// Submit one type's records, returning how many the service accepted
    async fn submit(
        &self,
        record_type: &RecordType,
        records: Vec<Value>,
    ) -> Result<usize, (usize, TypeFailure)> {
        let rt = record_type.as_str();

        if self.routing.is_legacy(rt) {
            return self.submit_paced(record_type, records).await;
        }

        let count = records.len();
        let payload = Value::Array(records);
        let primary = self.routing.primary_endpoint(rt);

        let result = match self.routing.secondary_endpoint(rt) {
            Some(secondary) => {
                let (primary_result, secondary_result) = tokio::join!(
                    self.transport.send(&primary, &payload),
                    self.transport.send(&secondary, &payload)
                );
                if let Err(e) = secondary_result {
                    warn!(
                        record_type = %rt,
                        endpoint = %secondary,
                        error = %e,
                        "Secondary write failed"
                    );
                }
                primary_result
            }
            None => self.transport.send(&primary, &payload).await,
        };

        match result {
            Ok(_) => Ok(count),
            Err(error) => {
                let pending = match payload {
                    Value::Array(records) => records,
                    other => vec![other],
                };
                Err((0, TypeFailure::Submit { error, pending }))
            }
        }
    }

    /// One record per request with a pause between requests
    async fn submit_paced(
        &self,
        record_type: &RecordType,
        records: Vec<Value>,
    ) -> Result<usize, (usize, TypeFailure)> {
        let endpoint = self.routing.primary_endpoint(record_type.as_str());
        let pacing = self.routing.legacy_pacing();
        let mut sent = 0;
        let mut remaining = records.into_iter();

        while let Some(record) = remaining.next() {
            if sent > 0 {
                tokio::time::sleep(pacing).await;
            }
            if let Err(error) = self.transport.send(&endpoint, &record).await {
                let mut pending = vec![record];
                pending.extend(remaining);
                return Err((sent, TypeFailure::Submit { error, pending }));
            }
            sent += 1;
        }

        Ok(sent)
    }

    /// Log and queue a failed type, returning whether its records are now queued
    async fn handle_failure(&self, record_type: &RecordType, failure: TypeFailure) -> bool {
        let (error, pending) = match failure {
            TypeFailure::Read(e) => (e.to_string(), Vec::new()),
            TypeFailure::Submit { error, pending } => (error.to_string(), pending),
        };

        let mut queued = false;
        if self.config.queue_on_failure && !pending.is_empty() {
            if let Some(queue) = &self.queue {
                match queue
                    .enqueue(record_type.as_str(), Value::Array(pending.clone()), Priority::Normal)
                    .await
                {
                    Ok(_) => queued = true,
                    Err(e) => warn!(record_type = %record_type, error = %e, "Failed to queue records"),
                }
            }
        }

        self.logger
            .log_record_type_failed(record_type.as_str(), pending.len(), &error, queued);
        let _ = self.events.send(SyncEvent::SyncError {
            error: format!("{}: {}", record_type, error),
        });
        queued
    }

    /// Count records per type in `range`, reading all types concurrently.
    ///
    /// Types whose read fails are left out.
    pub async fn fetch_snapshot(
        &self,
        types: &[RecordType],
        range: TimeRange,
    ) -> BTreeMap<String, usize> {
        let mut reads = JoinSet::new();
        for record_type in types.iter().cloned() {
            let source = Arc::clone(&self.source);
            reads.spawn(async move {
                let read = source.read_records(&record_type, &range).await;
                (record_type, read)
            });
        }

        let mut counts = BTreeMap::new();
        while let Some(joined) = reads.join_next().await {
            match joined {
                Ok((record_type, Ok(records))) => {
                    counts.insert(record_type.to_string(), records.len());
                }
                Ok((record_type, Err(e))) => {
                    warn!(record_type = %record_type, error = %e, "Snapshot read failed");
                }
                Err(e) => warn!(error = %e, "Snapshot read task failed"),
            }
        }
        counts
    }

    /// Delete records on the device, then on the service
    pub async fn delete_records(
        &self,
        record_type: &RecordType,
        uuids: &[String],
    ) -> Result<(), OrchestratorError> {
        self.source.delete_records_by_uuids(record_type, uuids).await?;
        self.transport
            .delete_records(record_type.as_str(), uuids)
            .await?;
        debug!(record_type = %record_type, count = uuids.len(), "Records deleted");
        Ok(())
    }

    /// Apply a server-initiated `PUSH` or `DEL` message to the device store.
    ///
    /// Deletions requested by the service are only applied locally.
    pub async fn apply_remote_command(
        &self,
        message: &Value,
    ) -> Result<CommandOutcome, OrchestratorError> {
        let command = RemoteCommand::parse(message)?;
        if !self.source.initialize().await? {
            return Err(SourceError::NotInitialized.into());
        }

        let outcome = match command {
            RemoteCommand::Push { records } => {
                let ids = self.source.insert_records(records).await?;
                CommandOutcome::Inserted(ids)
            }
            RemoteCommand::Delete { record_type, uuids } => {
                self.source
                    .delete_records_by_uuids(&record_type, &uuids)
                    .await?;
                CommandOutcome::Deleted {
                    record_type: record_type.to_string(),
                    count: uuids.len(),
                }
            }
        };
        info!(outcome = ?outcome, "Remote command applied");
        Ok(outcome)
    }
}
