//! Durable offline queue
//!
//! Payloads that could not be delivered wait here until a flush succeeds:
//! - Bounded size with priority-aware eviction
//! - Priority-then-FIFO dequeue, removed atomically with selection
//! - Single-flight flush with per-item retry and scheduled backoff
//! - Optional JSON file persistence (atomic temp-file rename)

use crate::config::{QueueConfig, RoutingConfig};
use crate::models::{Priority, QueueItem};
use crate::observability::SyncMetrics;
use crate::sync::transport::Transport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Errors from queue persistence
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue file is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Delay before processing the next item after a failed delivery.
///
/// `retries` is the item's retry count after the failure; the index is
/// capped at the last schedule entry.
pub fn backoff_delay(schedule_ms: &[u64], retries: u32) -> Duration {
    match schedule_ms.len() {
        0 => Duration::ZERO,
        len => {
            let index = (retries as usize).min(len - 1);
            Duration::from_millis(schedule_ms[index])
        }
    }
}

/// Counts from one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushOutcome {
    pub success: usize,
    pub failed: usize,
    pub retried: usize,
}

/// Queue statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub capacity: usize,
    pub by_priority: BTreeMap<String, usize>,
    pub by_record_type: BTreeMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueState {
    items: Vec<QueueItem>,
    next_seq: u64,
}

impl QueueState {
    /// Make room for one more item, returning the evicted item
    fn evict_one(&mut self) -> Option<QueueItem> {
        let victim = self
            .items
            .iter()
            .enumerate()
            .min_by_key(|(_, item)| (item.priority, item.enqueued_at, item.seq))
            .map(|(index, _)| index)?;
        Some(self.items.remove(victim))
    }

    /// Highest priority first, FIFO within a tier
    fn sort_for_delivery(&mut self) {
        self.items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
                .then(a.seq.cmp(&b.seq))
        });
    }
}

/// Bounded, prioritized, optionally persistent queue of undelivered payloads
pub struct OfflineQueue {
    config: QueueConfig,
    routing: RoutingConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<QueueState>,
    processing: AtomicBool,
    metrics: SyncMetrics,
}

impl OfflineQueue {
    /// Create an in-memory queue (persistence is ignored until `open`)
    pub fn new(config: QueueConfig, routing: RoutingConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            routing,
            transport,
            state: Mutex::new(QueueState::default()),
            processing: AtomicBool::new(false),
            metrics: SyncMetrics::new(),
        }
    }

    /// Create the queue and load previously persisted items
    pub async fn open(
        config: QueueConfig,
        routing: RoutingConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, QueueError> {
        let queue = Self::new(config, routing, transport);

        if let Some(path) = queue.config.persistence_path.clone() {
            let loaded = load_state(&path).await?;
            let count = loaded.items.len();
            let mut state = queue.state.lock().await;
            *state = loaded;
            while state.items.len() > queue.config.max_queue_size {
                state.evict_one();
            }
            queue.metrics.set_queue_depth(state.items.len());
            drop(state);
            info!(path = %path.display(), entries = count, "Loaded offline queue from disk");
        }

        Ok(queue)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a payload, evicting one item first if the queue is full.
    ///
    /// When the queue file cannot be written the queue is left as it was and
    /// the error is returned.
    pub async fn enqueue(
        &self,
        record_type: &str,
        payload: Value,
        priority: Priority,
    ) -> Result<String, QueueError> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;

        let item = QueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            record_type: record_type.to_string(),
            payload,
            priority,
            enqueued_at: Utc::now(),
            retries: 0,
            seq,
        };
        let id = item.id.clone();

        let evicted = Self::insert(&mut state, item, self.config.max_queue_size);
        if let Err(e) = self.persist(&state).await {
            state.items.retain(|queued| queued.id != id);
            state.items.extend(evicted);
            return Err(e);
        }
        self.metrics.inc_queue_enqueued();
        self.log_evicted(&evicted);
        self.metrics.set_queue_depth(state.items.len());

        debug!(id = %id, record_type = %record_type, priority = priority.as_str(), "Payload queued");
        Ok(id)
    }

    /// Push `item`, returning the items evicted to make room
    fn insert(state: &mut QueueState, item: QueueItem, capacity: usize) -> Vec<QueueItem> {
        let mut evicted = Vec::new();
        while state.items.len() >= capacity {
            match state.evict_one() {
                Some(item) => evicted.push(item),
                None => break,
            }
        }
        state.items.push(item);
        evicted
    }

    fn log_evicted(&self, evicted: &[QueueItem]) {
        for item in evicted {
            self.metrics.inc_queue_evicted();
            warn!(
                event = "queue_evicted",
                id = %item.id,
                record_type = %item.record_type,
                priority = item.priority.as_str(),
                "Queue full, evicted item"
            );
        }
    }

    /// Remove and return up to `batch_size` items, highest priority first.
    ///
    /// The items stay queued when the queue file cannot be written.
    pub async fn dequeue(&self, batch_size: usize) -> Result<Vec<QueueItem>, QueueError> {
        let mut state = self.state.lock().await;
        state.sort_for_delivery();
        let count = batch_size.min(state.items.len());
        let batch: Vec<QueueItem> = state.items.drain(..count).collect();
        if let Err(e) = self.persist(&state).await {
            let rest = std::mem::replace(&mut state.items, batch);
            state.items.extend(rest);
            return Err(e);
        }
        self.metrics.set_queue_depth(state.items.len());
        Ok(batch)
    }

    /// Deliver up to `max_batch` items (the configured batch size when `None`).
    ///
    /// Returns zero counts without touching the queue when another flush is
    /// already running.
    pub async fn flush(&self, max_batch: Option<usize>) -> Result<FlushOutcome, QueueError> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Flush already in progress, skipping");
            return Ok(FlushOutcome::default());
        }
        let _guard = ProcessingGuard(&self.processing);

        let started = Instant::now();
        let batch = self
            .dequeue(max_batch.unwrap_or(self.config.batch_size))
            .await?;
        let mut outcome = FlushOutcome::default();

        if batch.is_empty() {
            return Ok(outcome);
        }

        let mut items = batch.into_iter().peekable();
        while let Some(mut item) = items.next() {
            let endpoint = self.routing.primary_endpoint(&item.record_type);
            match self.transport.send(&endpoint, &item.payload).await {
                Ok(_) => {
                    outcome.success += 1;
                }
                Err(e) if item.retries < self.config.max_retries => {
                    item.retries += 1;
                    let delay = backoff_delay(&self.config.backoff_schedule_ms, item.retries);
                    debug!(
                        id = %item.id,
                        retries = item.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Delivery failed, re-queued"
                    );
                    self.requeue(item).await;
                    outcome.retried += 1;
                    if items.peek().is_some() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    outcome.failed += 1;
                    self.metrics.inc_queue_dropped();
                    warn!(
                        event = "queue_item_dropped",
                        id = %item.id,
                        record_type = %item.record_type,
                        retries = item.retries,
                        error = %e,
                        "Retries exhausted, dropping item"
                    );
                }
            }
        }

        self.metrics.observe_flush(
            outcome.success,
            outcome.failed,
            outcome.retried,
            started.elapsed(),
        );
        info!(
            event = "queue_flushed",
            success = outcome.success,
            failed = outcome.failed,
            retried = outcome.retried,
            "Queue flush completed"
        );

        Ok(outcome)
    }

    /// Put a failed item back. It stays in memory even if the file write
    /// fails; the next successful write picks it up.
    async fn requeue(&self, item: QueueItem) {
        let id = item.id.clone();
        let mut state = self.state.lock().await;
        let evicted = Self::insert(&mut state, item, self.config.max_queue_size);
        self.log_evicted(&evicted);
        self.metrics.set_queue_depth(state.items.len());
        if let Err(e) = self.persist(&state).await {
            warn!(
                event = "queue_persist_failed",
                id = %id,
                error = %e,
                "Re-queued item kept in memory only"
            );
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Snapshot of queued items in delivery order
    pub async fn items(&self) -> Vec<QueueItem> {
        let mut state = self.state.lock().await;
        state.sort_for_delivery();
        state.items.clone()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            total: state.items.len(),
            capacity: self.config.max_queue_size,
            ..Default::default()
        };

        for item in &state.items {
            *stats
                .by_priority
                .entry(item.priority.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_record_type
                .entry(item.record_type.clone())
                .or_default() += 1;
        }
        stats.oldest = state.items.iter().map(|i| i.enqueued_at).min();
        stats.newest = state.items.iter().map(|i| i.enqueued_at).max();
        stats
    }

    /// Remove every queued item
    pub async fn clear(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let removed = std::mem::take(&mut state.items);
        if let Err(e) = self.persist(&state).await {
            state.items = removed;
            return Err(e);
        }
        self.metrics.set_queue_depth(0);
        Ok(removed.len())
    }

    /// Flush periodically while items are pending
    pub fn start_auto_processing(self: &Arc<Self>, interval: Duration) -> AutoFlushHandle {
        let queue = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!(interval_ms = interval.as_millis() as u64, "Queue auto-flush started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if queue.pending_count().await > 0 {
                            if let Err(e) = queue.flush(None).await {
                                warn!(error = %e, "Scheduled queue flush failed");
                            }
                            // Next flush one full interval after this one ends
                            ticker.reset();
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Queue auto-flush stopped");
                        break;
                    }
                }
            }
        });

        AutoFlushHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn persist(&self, state: &QueueState) -> Result<(), QueueError> {
        match &self.config.persistence_path {
            Some(path) => save_state(path, state).await,
            None => Ok(()),
        }
    }
}

/// Handle to the periodic flush task
pub struct AutoFlushHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl AutoFlushHandle {
    /// Stop the timer, letting a flush that is already running finish
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Queue auto-flush task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn save_state(path: &Path, state: &QueueState) -> Result<(), QueueError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_vec(state)?;
    let temp_path: PathBuf = path.with_extension("tmp");
    tokio::fs::write(&temp_path, &json).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn load_state(path: &Path) -> Result<QueueState, QueueError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let mut state: QueueState = serde_json::from_slice(&bytes)?;
            let max_seq = state.items.iter().map(|i| i.seq + 1).max().unwrap_or(0);
            state.next_seq = state.next_seq.max(max_seq);
            Ok(state)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(QueueState::default()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::transport::TransportError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Transport answering from a script of results, recording every call
    #[derive(Default)]
    struct ScriptedTransport {
        script: StdMutex<VecDeque<bool>>,
        calls: StdMutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(script: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.iter().copied().collect()),
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, endpoint: &str, _payload: &Value) -> Result<Value, TransportError> {
            self.calls.lock().unwrap().push(endpoint.to_string());
            let ok = self.script.lock().unwrap().pop_front().unwrap_or(true);
            if ok {
                Ok(json!({"success": true}))
            } else {
                Err(TransportError::Network {
                    endpoint: endpoint.to_string(),
                    message: "offline".to_string(),
                })
            }
        }
    }

    fn queue_with(config: QueueConfig, transport: Arc<ScriptedTransport>) -> OfflineQueue {
        OfflineQueue::new(config, RoutingConfig::default(), transport)
    }

    fn small_config(max_queue_size: usize) -> QueueConfig {
        QueueConfig {
            max_queue_size,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_delay_caps_at_last_entry() {
        let schedule = [1_000, 5_000, 15_000];
        assert_eq!(backoff_delay(&schedule, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&schedule, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(&schedule, 2), Duration::from_secs(15));
        assert_eq!(backoff_delay(&schedule, 9), Duration::from_secs(15));
        assert_eq!(backoff_delay(&[], 3), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_full_queue_keeps_most_recent() {
        let queue = queue_with(small_config(2), ScriptedTransport::new(&[]));

        queue.enqueue("steps", json!(1), Priority::Normal).await.unwrap();
        let second = queue.enqueue("steps", json!(2), Priority::Normal).await.unwrap();
        let third = queue.enqueue("steps", json!(3), Priority::Normal).await.unwrap();

        let ids: Vec<String> = queue.items().await.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![second, third]);
    }

    #[tokio::test]
    async fn test_eviction_prefers_low_priority() {
        let queue = queue_with(small_config(3), ScriptedTransport::new(&[]));

        let high = queue.enqueue("steps", json!("h"), Priority::High).await.unwrap();
        queue.enqueue("steps", json!("l"), Priority::Low).await.unwrap();
        let normal = queue.enqueue("steps", json!("n"), Priority::Normal).await.unwrap();
        let newest = queue.enqueue("steps", json!("n2"), Priority::Normal).await.unwrap();

        let items = queue.items().await;
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i.priority != Priority::Low));

        // With no low items left the oldest normal goes before any high
        queue.enqueue("steps", json!("n3"), Priority::Normal).await.unwrap();
        let ids: Vec<String> = queue.items().await.into_iter().map(|i| i.id).collect();
        assert!(ids.contains(&high));
        assert!(!ids.contains(&normal));
        assert!(ids.contains(&newest));
        assert_eq!(queue.pending_count().await, 3);
    }

    #[tokio::test]
    async fn test_dequeue_orders_by_priority_then_fifo() {
        let queue = queue_with(QueueConfig::default(), ScriptedTransport::new(&[]));

        let n1 = queue.enqueue("steps", json!(1), Priority::Normal).await.unwrap();
        let l1 = queue.enqueue("steps", json!(2), Priority::Low).await.unwrap();
        let h1 = queue.enqueue("steps", json!(3), Priority::High).await.unwrap();
        let n2 = queue.enqueue("steps", json!(4), Priority::Normal).await.unwrap();

        let batch: Vec<String> = queue.dequeue(3).await.unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(batch, vec![h1, n1, n2]);

        let rest: Vec<String> = queue.dequeue(10).await.unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(rest, vec![l1]);
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_flush_empty_queue_is_noop() {
        let transport = ScriptedTransport::new(&[]);
        let queue = queue_with(QueueConfig::default(), transport.clone());

        let outcome = queue.flush(None).await.unwrap();
        assert_eq!(outcome, FlushOutcome::default());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_recovers_after_two_failures() {
        let transport = ScriptedTransport::new(&[false, false, true]);
        let queue = queue_with(QueueConfig::default(), transport.clone());
        queue.enqueue("heartRate", json!([{"bpm": 61}]), Priority::Normal).await.unwrap();

        let first = queue.flush(None).await.unwrap();
        assert_eq!(first, FlushOutcome { success: 0, failed: 0, retried: 1 });
        assert_eq!(queue.items().await[0].retries, 1);

        let second = queue.flush(None).await.unwrap();
        assert_eq!(second.retried, 1);
        assert_eq!(queue.items().await[0].retries, 2);

        let third = queue.flush(None).await.unwrap();
        assert_eq!(third, FlushOutcome { success: 1, failed: 0, retried: 0 });
        assert_eq!(queue.pending_count().await, 0);
        assert_eq!(transport.calls(), vec!["sync/heartRate"; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_dropped_after_max_retries() {
        let transport = ScriptedTransport::new(&[false; 4]);
        let config = QueueConfig {
            max_retries: 3,
            ..Default::default()
        };
        let queue = queue_with(config, transport.clone());
        queue.enqueue("steps", json!([]), Priority::High).await.unwrap();

        let mut seen_retries = Vec::new();
        for _ in 0..3 {
            let outcome = queue.flush(None).await.unwrap();
            assert_eq!(outcome.retried, 1);
            seen_retries.push(queue.items().await[0].retries);
        }
        assert_eq!(seen_retries, vec![1, 2, 3]);

        let last = queue.flush(None).await.unwrap();
        assert_eq!(last, FlushOutcome { success: 0, failed: 1, retried: 0 });
        assert_eq!(queue.pending_count().await, 0);
        assert_eq!(transport.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_in_batch_does_not_abort_others() {
        let transport = ScriptedTransport::new(&[true, false, true]);
        let queue = queue_with(QueueConfig::default(), transport.clone());
        for n in 0..3 {
            queue.enqueue("steps", json!(n), Priority::Normal).await.unwrap();
        }

        let started = tokio::time::Instant::now();
        let outcome = queue.flush(None).await.unwrap();
        assert_eq!(outcome, FlushOutcome { success: 2, failed: 0, retried: 1 });
        assert_eq!(queue.pending_count().await, 1);
        // one backoff wait for the first retry
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_flush_is_noop() {
        let transport = ScriptedTransport::new(&[false]);
        let queue = Arc::new(queue_with(QueueConfig::default(), transport.clone()));
        queue.enqueue("steps", json!(1), Priority::Normal).await.unwrap();
        queue.enqueue("steps", json!(2), Priority::Normal).await.unwrap();

        let background = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.flush(None).await })
        };
        // Let the first flush reach its backoff wait
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.is_processing());

        let overlapping = queue.flush(None).await.unwrap();
        assert_eq!(overlapping, FlushOutcome::default());

        let first = background.await.unwrap().unwrap();
        assert_eq!(first, FlushOutcome { success: 1, failed: 0, retried: 1 });
        assert!(!queue.is_processing());
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_backoff_wait_after_last_item() {
        let transport = ScriptedTransport::new(&[false]);
        let queue = queue_with(QueueConfig::default(), transport);
        queue.enqueue("steps", json!(1), Priority::Normal).await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = queue.flush(None).await.unwrap();
        assert_eq!(outcome.retried, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!queue.is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_processing_flushes_pending_items() {
        let transport = ScriptedTransport::new(&[]);
        let queue = Arc::new(queue_with(QueueConfig::default(), transport.clone()));
        queue.enqueue("steps", json!(1), Priority::Normal).await.unwrap();

        let handle = queue.start_auto_processing(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(queue.pending_count().await, 0);
        assert_eq!(transport.calls().len(), 1);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_flush_is_not_followed_by_catch_up_ticks() {
        let transport = ScriptedTransport::new(&[false; 10]);
        let config = QueueConfig {
            max_retries: 10,
            backoff_schedule_ms: vec![5_000],
            ..Default::default()
        };
        let queue = Arc::new(queue_with(config, transport.clone()));
        queue.enqueue("steps", json!(1), Priority::Normal).await.unwrap();
        queue.enqueue("steps", json!(2), Priority::Normal).await.unwrap();

        // First flush runs from 1s to 6s (one backoff wait between the two items)
        let handle = queue.start_auto_processing(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(6_500)).await;
        assert_eq!(transport.calls().len(), 2);

        // The next tick comes one full interval after the slow flush
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(transport.calls().len(), 3);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stats_aggregate_by_priority_and_type() {
        let queue = queue_with(QueueConfig::default(), ScriptedTransport::new(&[]));
        queue.enqueue("steps", json!(1), Priority::High).await.unwrap();
        queue.enqueue("steps", json!(2), Priority::Low).await.unwrap();
        queue.enqueue("accelerometer", json!(3), Priority::Low).await.unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_priority.get("low"), Some(&2));
        assert_eq!(stats.by_priority.get("high"), Some(&1));
        assert_eq!(stats.by_record_type.get("steps"), Some(&2));
        assert!(stats.oldest.unwrap() <= stats.newest.unwrap());
    }

    #[tokio::test]
    async fn test_persisted_queue_survives_restart() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig {
            persistence_path: Some(dir.path().join("queue").join("offline.json")),
            ..Default::default()
        };

        let id = {
            let queue = OfflineQueue::open(
                config.clone(),
                RoutingConfig::default(),
                ScriptedTransport::new(&[]),
            )
            .await
            .unwrap();
            queue.enqueue("sleep", json!({"stage": "deep"}), Priority::High).await.unwrap()
        };

        let reopened = OfflineQueue::open(config, RoutingConfig::default(), ScriptedTransport::new(&[]))
            .await
            .unwrap();
        let items = reopened.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);
        assert_eq!(items[0].payload["stage"], "deep");

        // New items sort after the restored one
        let later = reopened.enqueue("sleep", json!({}), Priority::High).await.unwrap();
        assert_eq!(reopened.items().await[1].id, later);
    }

    fn persisted_config(dir: &TempDir) -> QueueConfig {
        QueueConfig {
            persistence_path: Some(dir.path().join("offline.json")),
            ..Default::default()
        }
    }

    /// Make the temp file used for atomic writes impossible to create
    fn block_writes(dir: &TempDir) {
        std::fs::create_dir(dir.path().join("offline.tmp")).unwrap();
    }

    fn unblock_writes(dir: &TempDir) {
        std::fs::remove_dir(dir.path().join("offline.tmp")).unwrap();
    }

    #[tokio::test]
    async fn test_unwritable_file_keeps_batch_queued() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(&[]);
        let queue = OfflineQueue::open(persisted_config(&dir), RoutingConfig::default(), transport.clone())
            .await
            .unwrap();
        queue.enqueue("steps", json!(1), Priority::Normal).await.unwrap();
        queue.enqueue("steps", json!(2), Priority::High).await.unwrap();

        block_writes(&dir);
        assert!(queue.flush(None).await.is_err());
        assert!(queue.dequeue(10).await.is_err());
        assert_eq!(queue.pending_count().await, 2);
        assert!(transport.calls().is_empty());
        assert!(!queue.is_processing());

        unblock_writes(&dir);
        let outcome = queue.flush(None).await.unwrap();
        assert_eq!(outcome.success, 2);
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_enqueue_leaves_queue_unchanged() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig {
            max_queue_size: 2,
            ..persisted_config(&dir)
        };
        let queue = OfflineQueue::open(config, RoutingConfig::default(), ScriptedTransport::new(&[]))
            .await
            .unwrap();
        let first = queue.enqueue("steps", json!(1), Priority::Low).await.unwrap();
        let second = queue.enqueue("steps", json!(2), Priority::Normal).await.unwrap();

        block_writes(&dir);
        // Would evict the low item if it succeeded
        assert!(queue.enqueue("steps", json!(3), Priority::High).await.is_err());

        let ids: Vec<String> = queue.items().await.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![second, first]);
    }

    /// Transport that fails every send and blocks queue file writes from then on
    struct BlockingTransport {
        dir: PathBuf,
        calls: StdMutex<usize>,
    }

    #[async_trait]
    impl Transport for BlockingTransport {
        async fn send(&self, endpoint: &str, _payload: &Value) -> Result<Value, TransportError> {
            *self.calls.lock().unwrap() += 1;
            let blocker = self.dir.join("offline.tmp");
            if !blocker.exists() {
                std::fs::create_dir(&blocker).unwrap();
            }
            Err(TransportError::Network {
                endpoint: endpoint.to_string(),
                message: "offline".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_write_failure_keeps_processing_batch() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(BlockingTransport {
            dir: dir.path().to_path_buf(),
            calls: StdMutex::new(0),
        });
        let config = persisted_config(&dir);
        let queue = OfflineQueue::open(config.clone(), RoutingConfig::default(), transport.clone())
            .await
            .unwrap();
        queue.enqueue("steps", json!(1), Priority::Normal).await.unwrap();
        queue.enqueue("heartRate", json!(2), Priority::Normal).await.unwrap();

        let outcome = queue.flush(None).await.unwrap();
        assert_eq!(outcome, FlushOutcome { success: 0, failed: 0, retried: 2 });
        assert_eq!(*transport.calls.lock().unwrap(), 2);
        assert_eq!(queue.pending_count().await, 2);

        // The next successful write stores the re-queued items as well
        unblock_writes(&dir);
        queue.enqueue("weight", json!(3), Priority::Normal).await.unwrap();
        let reopened = OfflineQueue::open(config, RoutingConfig::default(), ScriptedTransport::new(&[]))
            .await
            .unwrap();
        assert_eq!(reopened.pending_count().await, 3);
        assert!(reopened.items().await.iter().filter(|i| i.retries == 1).count() == 2);
    }
}
