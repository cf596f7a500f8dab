use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::file::MarkerStore;
use super::metrics::CurriedMarkerMetrics;
use crate::wal::watcher::Marker;

/// Delivery accounting used by the queue client and its batches.
#[async_trait]
pub trait MarkerHandle: Send + Sync {
    /// `count` entries from `segment` were accepted for delivery.
    fn update_received_data(&self, segment: i64, count: i64);

    /// `count` entries from `segment` are done, delivered or dropped.
    fn update_sent_data(&self, segment: i64, count: i64);

    fn last_marked_segment(&self) -> i64;

    /// Applies updates already handed in, then stops the handler.
    async fn stop(&self);
}

/// Tracks outstanding entries per segment and advances the persisted marker
/// to the highest segment with nothing left in flight.
///
/// Updates are applied by a single task in arrival order, so callers never
/// block on the counters.
pub struct MarkerHandler {
    tx: mpsc::UnboundedSender<(i64, i64)>,
    store: Arc<dyn MarkerStore>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MarkerHandler {
    pub fn new(store: Arc<dyn MarkerStore>, metrics: CurriedMarkerMetrics) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_updates(
            rx,
            Arc::clone(&store),
            metrics,
            cancel.clone(),
        ));

        Self {
            tx,
            store,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    fn send(&self, segment: i64, delta: i64) {
        if self.tx.send((segment, delta)).is_err() {
            debug!(segment, delta, "Marker handler stopped, dropping update");
        }
    }
}

#[async_trait]
impl MarkerHandle for MarkerHandler {
    fn update_received_data(&self, segment: i64, count: i64) {
        self.send(segment, count);
    }

    fn update_sent_data(&self, segment: i64, count: i64) {
        self.send(segment, -count);
    }

    fn last_marked_segment(&self) -> i64 {
        self.store.last_marked_segment()
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Marker for MarkerHandler {
    fn last_marked_segment(&self) -> i64 {
        self.store.last_marked_segment()
    }
}

async fn run_updates(
    mut rx: mpsc::UnboundedReceiver<(i64, i64)>,
    store: Arc<dyn MarkerStore>,
    metrics: CurriedMarkerMetrics,
    cancel: CancellationToken,
) {
    let mut tracker = SegmentTracker::new(store.last_marked_segment());
    metrics.last_marked_segment.set(tracker.last_marked);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Apply what was already reported so the final watermark
                // reflects everything delivered before shutdown.
                while let Ok((segment, delta)) = rx.try_recv() {
                    tracker.apply(segment, delta, store.as_ref(), &metrics);
                }
                info!(last_marked_segment = tracker.last_marked, "Marker handler stopped");
                return;
            }
            update = rx.recv() => match update {
                Some((segment, delta)) => tracker.apply(segment, delta, store.as_ref(), &metrics),
                None => return,
            },
        }
    }
}

struct SegmentTracker {
    outstanding: HashMap<i64, i64>,
    last_marked: i64,
}

impl SegmentTracker {
    fn new(last_marked: i64) -> Self {
        Self {
            outstanding: HashMap::new(),
            last_marked,
        }
    }

    fn apply(
        &mut self,
        segment: i64,
        delta: i64,
        store: &dyn MarkerStore,
        metrics: &CurriedMarkerMetrics,
    ) {
        *self.outstanding.entry(segment).or_insert(0) += delta;

        let Some(markable) = find_markable_segment(&mut self.outstanding) else {
            return;
        };
        if markable <= self.last_marked {
            return;
        }

        match store.mark_segment(markable) {
            Ok(()) => {
                debug!(segment = markable, "Marked segment as delivered");
                self.last_marked = markable;
                metrics.last_marked_segment.set(markable);
            }
            Err(e) => {
                metrics.marker_write_failures.inc();
                warn!(segment = markable, error = %e, "Failed to persist segment marker");
            }
        }
    }
}

/// Highest segment whose outstanding count is zero. Zero-count segments are
/// forgotten afterwards; negative counts are transient and left alone.
///
/// This does not check that lower segments are also settled, so the marker
/// can move past a segment that still has entries in flight.
fn find_markable_segment(outstanding: &mut HashMap<i64, i64>) -> Option<i64> {
    let markable = outstanding
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(segment, _)| *segment)
        .max();
    outstanding.retain(|_, count| *count != 0);
    markable
}
