use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::batch::{Batch, BatchError};
use super::labels::{merge_external, tenant_id};
use super::metrics::{
    QueueClientMetrics, REASON_LINE_TOO_LONG, REASON_STREAM_LIMITED, REASON_GENERIC,
};
use super::push::{HttpPushClient, PushClient, PushError};
use super::queue::{BatchSender, QueuedBatch, SendQueue};
use super::series::SeriesCache;
use crate::config::{ClientConfig, LimitsConfig};
use crate::marker::MarkerHandle;
use crate::wal::record::{Entry, LabelSet, RefEntries, RefSeries};
use crate::wal::watcher::{AppendError, WriteCleanup, WriteTo};

/// Shortest interval between checks for batches that waited long enough.
const MIN_FLUSH_CHECK_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum QueueClientError {
    #[error("failed to build push client: {0}")]
    Push(#[from] PushError),

    #[error("queue client is stopping")]
    Stopping,
}

/// Turns WAL entries into batches per tenant and ships them through a
/// bounded send queue.
///
/// Every entry accepted here is eventually reported to the marker, either
/// when its batch is done or right away if the entry is dropped by a limit.
pub struct QueueClient {
    inner: Arc<Inner>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

struct Inner {
    config: ClientConfig,
    limits: LimitsConfig,
    host: String,
    metrics: QueueClientMetrics,
    series: SeriesCache,
    batches: Mutex<HashMap<String, Batch>>,
    queue: SendQueue,
    marker: Arc<dyn MarkerHandle>,
    initialized_tenants: Mutex<HashSet<String>>,
    /// Stops accepting entries and the periodic flush.
    quit: CancellationToken,
    /// Aborts in-flight pushes on an immediate stop.
    cancel: CancellationToken,
}

impl QueueClient {
    pub fn new(
        metrics: QueueClientMetrics,
        config: ClientConfig,
        limits: LimitsConfig,
        marker: Arc<dyn MarkerHandle>,
    ) -> Result<Self, QueueClientError> {
        let push_client = HttpPushClient::new(&config)?;
        let host = push_client.host().to_string();
        Ok(Self::with_push_client(
            metrics,
            config,
            limits,
            marker,
            Arc::new(push_client),
            host,
        ))
    }

    /// Builds a client on top of any push transport.
    pub fn with_push_client(
        metrics: QueueClientMetrics,
        config: ClientConfig,
        limits: LimitsConfig,
        marker: Arc<dyn MarkerHandle>,
        push_client: Arc<dyn PushClient>,
        host: String,
    ) -> Self {
        let cancel = CancellationToken::new();
        let sender = BatchSender::new(
            push_client,
            host.clone(),
            metrics.clone(),
            config.backoff,
            config.drop_rate_limited_batches,
            Arc::clone(&marker),
            cancel.clone(),
        );
        let capacity = queue_slots(config.queue.capacity, config.batch_size);
        let queue = SendQueue::new(capacity, Arc::new(sender));

        info!(
            host = %host,
            queue_slots = capacity,
            batch_size = config.batch_size,
            batch_wait = ?config.batch_wait,
            "Starting queue client"
        );

        let inner = Arc::new(Inner {
            config,
            limits,
            host,
            metrics,
            series: SeriesCache::new(),
            batches: Mutex::new(HashMap::new()),
            queue,
            marker,
            initialized_tenants: Mutex::new(HashSet::new()),
            quit: CancellationToken::new(),
            cancel,
        });

        let flush_task = tokio::spawn(run_send_old_batches(Arc::clone(&inner)));

        Self {
            inner,
            flush_task: Mutex::new(Some(flush_task)),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Graceful stop: pending batches are queued and the queue is drained,
    /// all bounded by the queue drain timeout.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;
        inner.quit.cancel();
        let deadline = Instant::now() + inner.config.queue.drain_timeout;

        let flush_task = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = flush_task {
            if timeout_at(deadline, &mut task).await.is_err() {
                warn!(host = %inner.host, "Batch flush still running at drain deadline");
                task.abort();
            }
        }

        let pending: Vec<(String, Batch)> = inner
            .batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (tenant_id, batch) in pending {
            let queued = QueuedBatch { tenant_id, batch };
            if !inner.queue.enqueue_with_deadline(deadline, queued).await {
                warn!(host = %inner.host, "Drain deadline exceeded while queueing pending batches");
                break;
            }
        }

        inner.queue.close_and_drain(deadline).await;
        inner.marker.stop().await;
        info!(host = %inner.host, "Queue client stopped");
    }

    /// Immediate stop. Pending and queued batches are discarded and will be
    /// replayed from the WAL after a restart.
    pub async fn stop_now(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;
        inner.quit.cancel();
        inner.cancel.cancel();

        let flush_task = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = flush_task {
            task.abort();
            let _ = task.await;
        }

        inner.queue.close_now().await;
        inner.marker.stop().await;
        info!(host = %inner.host, "Queue client stopped immediately");
    }
}

impl Inner {
    /// Labels as sent plus the tenant they are pushed as.
    fn process_labels(&self, labels: &LabelSet) -> (LabelSet, String) {
        let merged = merge_external(&self.config.external_labels, labels);
        let tenant = tenant_id(&merged, &self.config.tenant_id).to_string();
        (merged, tenant)
    }

    fn init_tenant_metrics(&self, tenant: &str) {
        let mut initialized = self
            .initialized_tenants
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if initialized.insert(tenant.to_string()) {
            self.metrics.init_tenant(&self.host, tenant);
        }
    }

    /// Entry is gone for good. Count it and let the marker move on.
    fn drop_entry(&self, segment: i64, tenant: &str, reason: &str, bytes: usize) {
        self.metrics
            .record_dropped(&self.host, tenant, reason, 1, bytes as u64);
        self.marker.update_sent_data(segment, 1);
    }

    async fn append_single_entry(&self, segment: i64, labels: &LabelSet, mut entry: Entry) {
        let (labels, tenant) = self.process_labels(labels);
        self.init_tenant_metrics(&tenant);

        let max_line_size = self.limits.max_line_size;
        if max_line_size != 0 && entry.line.len() > max_line_size {
            if !self.limits.max_line_size_truncate {
                self.drop_entry(segment, &tenant, REASON_LINE_TOO_LONG, entry.line.len());
                return;
            }
            let removed = truncate_line(&mut entry.line, max_line_size);
            let metric_labels = [self.host.as_str(), tenant.as_str(), REASON_LINE_TOO_LONG];
            self.metrics
                .mutated_entries
                .with_label_values(&metric_labels)
                .inc();
            self.metrics
                .mutated_bytes
                .with_label_values(&metric_labels)
                .inc_by(removed as u64);
        }

        let line_len = entry.line.len();
        let (result, full) = {
            let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
            match batches.get_mut(&tenant) {
                None => {
                    let mut batch = Batch::new(self.limits.max_streams);
                    let result = batch.add_from_wal(&labels, entry, segment);
                    batches.insert(tenant.clone(), batch);
                    (result, None)
                }
                Some(batch) if batch.size_bytes_after(&entry.line) > self.config.batch_size => {
                    let mut fresh = Batch::new(self.limits.max_streams);
                    let result = fresh.add_from_wal(&labels, entry, segment);
                    (result, Some(mem::replace(batch, fresh)))
                }
                Some(batch) => (batch.add_from_wal(&labels, entry, segment), None),
            }
        };

        if let Err(e) = result {
            let reason = match e {
                BatchError::StreamLimitExceeded { .. } => REASON_STREAM_LIMITED,
                _ => REASON_GENERIC,
            };
            error!(host = %self.host, tenant = %tenant, error = %e, "Batch add err");
            self.drop_entry(segment, &tenant, reason, line_len);
        }

        if let Some(batch) = full {
            self.enqueue(tenant, batch).await;
        }
    }

    async fn enqueue(&self, tenant_id: String, batch: Batch) {
        let queued = QueuedBatch { tenant_id, batch };
        if !self.queue.enqueue(queued).await {
            warn!(host = %self.host, "Send queue closed, batch discarded");
        }
    }

    fn take_expired_batches(&self) -> Vec<QueuedBatch> {
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<String> = batches
            .iter()
            .filter(|(_, batch)| batch.age() >= self.config.batch_wait)
            .map(|(tenant, _)| tenant.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|tenant_id| {
                batches
                    .remove(&tenant_id)
                    .map(|batch| QueuedBatch { tenant_id, batch })
            })
            .collect()
    }
}

#[async_trait]
impl WriteTo for QueueClient {
    fn store_series(&self, series: &[RefSeries], segment: i64) {
        self.inner.series.store(series, segment);
    }

    async fn append_entries(&self, entries: RefEntries, segment: i64) -> Result<(), AppendError> {
        let inner = &self.inner;
        if inner.quit.is_cancelled() {
            return Err(QueueClientError::Stopping.into());
        }

        let Some(labels) = inner.series.get(entries.series_ref) else {
            debug!(
                host = %inner.host,
                series_ref = entries.series_ref,
                "Series for entry not found"
            );
            return Ok(());
        };

        inner
            .marker
            .update_received_data(segment, entries.entries.len() as i64);
        for entry in entries.entries {
            inner.append_single_entry(segment, &labels, entry).await;
        }
        Ok(())
    }
}

impl WriteCleanup for QueueClient {
    fn series_reset(&self, segment: i64) {
        let removed = self.inner.series.reset(segment);
        debug!(host = %self.inner.host, segment, removed, "Series reset");
    }
}

/// Queues batches once they waited `batch_wait`, whether full or not.
async fn run_send_old_batches(inner: Arc<Inner>) {
    let period = (inner.config.batch_wait / 10).max(MIN_FLUSH_CHECK_PERIOD);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.quit.cancelled() => return,
            _ = ticker.tick() => {
                for queued in inner.take_expired_batches() {
                    inner.enqueue(queued.tenant_id, queued.batch).await;
                }
            }
        }
    }
}

/// Number of batch slots a byte capacity buys. Always at least one.
pub fn queue_slots(capacity_bytes: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        return 1;
    }
    (capacity_bytes / batch_size).max(1)
}

/// Cuts `line` to at most `max` bytes on a char boundary. Returns the number
/// of bytes removed.
fn truncate_line(line: &mut String, max: usize) -> usize {
    let mut cut = max.min(line.len());
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    let removed = line.len() - cut;
    line.truncate(cut);
    removed
}
