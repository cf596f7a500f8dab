use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::batch::Batch;
use super::metrics::{QueueClientMetrics, REASON_GENERIC, REASON_RATE_LIMITED};
use super::push::PushClient;
use crate::config::BackoffConfig;
use crate::marker::MarkerHandle;

/// A batch ready to go, with the tenant it is pushed as.
#[derive(Debug)]
pub struct QueuedBatch {
    pub tenant_id: String,
    pub batch: Batch,
}

/// Pushes batches with retries and reports them to the marker afterwards.
pub struct BatchSender {
    client: Arc<dyn PushClient>,
    host: String,
    metrics: QueueClientMetrics,
    backoff: BackoffConfig,
    drop_rate_limited_batches: bool,
    marker: Arc<dyn MarkerHandle>,
    /// Cancelled by an immediate stop. Aborts in-flight pushes and backoff.
    cancel: CancellationToken,
}

impl BatchSender {
    pub fn new(
        client: Arc<dyn PushClient>,
        host: String,
        metrics: QueueClientMetrics,
        backoff: BackoffConfig,
        drop_rate_limited_batches: bool,
        marker: Arc<dyn MarkerHandle>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            host,
            metrics,
            backoff,
            drop_rate_limited_batches,
            marker,
            cancel,
        }
    }

    /// Sends the batch and reports its entries as done, whatever the outcome.
    /// Delivery is at-most-once from here on: a batch that ultimately fails
    /// is counted as dropped, not retried from the WAL.
    pub async fn send_and_report(&self, queued: QueuedBatch) {
        self.send_batch(&queued.tenant_id, &queued.batch).await;
        queued.batch.report_as_sent_data(self.marker.as_ref());
    }

    async fn send_batch(&self, tenant_id: &str, batch: &Batch) {
        let (body, entries_count) = match batch.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(host = %self.host, error = %e, "Error encoding batch");
                return;
            }
        };
        let buf_bytes = body.len() as u64;
        let batch_bytes = batch.size_bytes() as u64;
        let entries_count = entries_count as u64;
        self.metrics
            .encoded_bytes
            .with_label_values(&[&self.host])
            .inc_by(buf_bytes);

        let mut backoff = Backoff::new(self.backoff, self.cancel.clone());
        let mut last_status: Option<u16> = None;

        loop {
            let start = Instant::now();
            let result = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = self.client.push(tenant_id, body.clone()) => Some(result),
            };
            let Some(result) = result else {
                debug!(host = %self.host, "Push cancelled");
                break;
            };

            let status = match &result {
                Ok(status) => Some(*status),
                Err(e) => e.status(),
            };
            last_status = status;
            self.metrics
                .request_duration
                .with_label_values(&[
                    &status.map_or_else(|| "-1".to_string(), |s| s.to_string()),
                    &self.host,
                ])
                .observe(start.elapsed().as_secs_f64());

            let err = match result {
                Ok(_) => {
                    self.metrics
                        .sent_bytes
                        .with_label_values(&[&self.host])
                        .inc_by(buf_bytes);
                    self.metrics
                        .sent_entries
                        .with_label_values(&[&self.host])
                        .inc_by(entries_count);
                    return;
                }
                Err(e) => e,
            };

            if status == Some(429) && self.drop_rate_limited_batches {
                warn!(
                    host = %self.host,
                    tenant = tenant_id,
                    error = %err,
                    "Dropping batch due to rate limiting"
                );
                self.metrics.record_dropped(
                    &self.host,
                    tenant_id,
                    REASON_RATE_LIMITED,
                    entries_count,
                    batch_bytes,
                );
                return;
            }

            // Only 429s, 5xx and transport errors are worth retrying.
            if let Some(status) = status {
                if status != 429 && status / 100 != 5 {
                    error!(
                        host = %self.host,
                        tenant = tenant_id,
                        status,
                        error = %err,
                        "Final error sending batch"
                    );
                    break;
                }
            }

            warn!(
                host = %self.host,
                tenant = tenant_id,
                attempt = backoff.num_retries() + 1,
                error = %err,
                "Error sending batch, will retry"
            );
            self.metrics
                .batch_retries
                .with_label_values(&[&self.host, tenant_id])
                .inc();
            backoff.wait().await;

            if !backoff.ongoing() {
                break;
            }
        }

        let reason = if last_status == Some(429) {
            REASON_RATE_LIMITED
        } else {
            REASON_GENERIC
        };
        if !self.cancel.is_cancelled() {
            error!(
                host = %self.host,
                tenant = tenant_id,
                retries = backoff.num_retries(),
                reason,
                "Giving up on batch"
            );
        }
        self.metrics
            .record_dropped(&self.host, tenant_id, reason, entries_count, batch_bytes);
    }
}

/// Bounded queue of batches drained by a single sending worker.
///
/// Enqueueing blocks while the queue is full, which pushes back on the WAL
/// watcher feeding the client.
pub struct SendQueue {
    tx: mpsc::Sender<QueuedBatch>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedBatch>>>,
    sender: Arc<BatchSender>,
    quit: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SendQueue {
    pub fn new(capacity: usize, sender: Arc<BatchSender>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let quit = CancellationToken::new();

        let worker = tokio::spawn(run_worker(
            Arc::clone(&rx),
            Arc::clone(&sender),
            quit.clone(),
        ));

        Self {
            tx,
            rx,
            sender,
            quit,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Waits for room in the queue. Returns false if the queue was closed.
    pub async fn enqueue(&self, queued: QueuedBatch) -> bool {
        self.tx.send(queued).await.is_ok()
    }

    /// Like [`SendQueue::enqueue`] but gives up at `deadline`, dropping the
    /// batch unreported.
    pub async fn enqueue_with_deadline(&self, deadline: Instant, queued: QueuedBatch) -> bool {
        matches!(timeout_at(deadline, self.tx.send(queued)).await, Ok(Ok(())))
    }

    /// Stops the worker and sends whatever is still queued until the queue
    /// is empty or `deadline` passes. Later enqueues fail.
    pub async fn close_and_drain(&self, deadline: Instant) {
        self.quit.cancel();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut worker) = worker {
            if timeout_at(deadline, &mut worker).await.is_err() {
                warn!("Send queue worker still busy at drain deadline, abandoning queued batches");
                worker.abort();
                let _ = worker.await;
                self.rx.lock().await.close();
                return;
            }
        }

        let Ok(mut rx) = timeout_at(deadline, self.rx.lock()).await else {
            return;
        };
        rx.close();

        let mut drained = 0usize;
        while let Ok(queued) = rx.try_recv() {
            if timeout_at(deadline, self.sender.send_and_report(queued))
                .await
                .is_err()
            {
                warn!(drained, "Send queue drain deadline exceeded, accepting data loss");
                return;
            }
            drained += 1;
        }
        info!(drained, "Send queue drained");
    }

    /// Stops the worker right away. Queued batches are discarded and never
    /// reported as sent.
    pub async fn close_now(&self) {
        self.quit.cancel();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.abort();
            let _ = worker.await;
        }

        let mut rx = self.rx.lock().await;
        rx.close();
        let mut discarded = 0usize;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "Discarded queued batches on immediate stop");
        }
    }
}

async fn run_worker(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedBatch>>>,
    sender: Arc<BatchSender>,
    quit: CancellationToken,
) {
    let mut rx = rx.lock().await;
    loop {
        tokio::select! {
            biased;
            _ = quit.cancelled() => return,
            queued = rx.recv() => match queued {
                Some(queued) => sender.send_and_report(queued).await,
                None => return,
            },
        }
    }
}
