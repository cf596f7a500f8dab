use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn};

use super::metrics::WatcherMetrics;
use super::record::{Record, RefEntries, RefSeries};
use super::segment::{
    find_next_segment, first_and_last, open_read_segment, segment_size, LiveReader, Reader,
    SegmentError,
};
use super::state::{State, WatcherState};
use super::writer::WriteEventSubscriber;
use crate::config::WatchConfig;

/// How often the watcher checks whether a newer segment showed up.
pub const SEGMENT_CHECK_PERIOD: Duration = Duration::from_millis(100);

/// Pause before restarting the read loop after an error.
const RETRY_DELAY: Duration = Duration::from_secs(5);

pub type AppendError = Box<dyn std::error::Error + Send + Sync>;

/// Told when the WAL has reclaimed segments.
pub trait WriteCleanup: Send + Sync {
    /// Series last seen in `segment` or earlier won't be referenced again.
    fn series_reset(&self, segment: i64);
}

/// Consumer of decoded WAL records.
#[async_trait]
pub trait WriteTo: WriteCleanup {
    fn store_series(&self, series: &[RefSeries], segment: i64);

    /// May wait, which holds back further reads from the WAL.
    async fn append_entries(&self, entries: RefEntries, segment: i64) -> Result<(), AppendError>;
}

/// Source of the segment to resume from.
pub trait Marker: Send + Sync {
    /// Last fully delivered segment, or -1 if unknown.
    fn last_marked_segment(&self) -> i64;
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error appending entries: {0}")]
    Append(AppendError),
}

impl WatchError {
    fn is_not_found(&self) -> bool {
        match self {
            WatchError::Segment(e) => e.is_not_found(),
            WatchError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            WatchError::Append(_) => false,
        }
    }
}

/// Read timer that backs off while the segment stays idle.
struct ReadTimer {
    min: Duration,
    max: Duration,
    current: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl ReadTimer {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
            sleep: Box::pin(tokio::time::sleep(min)),
        }
    }

    fn reset(&mut self) {
        self.current = self.min;
        self.rearm();
    }

    fn backoff(&mut self) {
        self.current = (self.current * 2).min(self.max);
        self.rearm();
    }

    fn rearm(&mut self) {
        let deadline = Instant::now() + self.current;
        self.sleep.as_mut().reset(deadline);
    }

    async fn tick(&mut self) {
        self.sleep.as_mut().await
    }
}

enum Trigger {
    SegmentCheck,
    Timer,
    Notification,
}

impl Trigger {
    fn reason(&self) -> &'static str {
        match self {
            Trigger::SegmentCheck => "segment_check",
            Trigger::Timer => "timer",
            Trigger::Notification => "notification",
        }
    }
}

/// Tails the WAL segment by segment and hands every record to a [`WriteTo`].
///
/// On start it resumes right after the last marked segment when a marker is
/// available, otherwise at the newest segment. Reads are triggered by write
/// notifications, with a backing-off timer as a fallback.
pub struct Watcher {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    id: String,
    wal_dir: PathBuf,
    write_to: Arc<dyn WriteTo>,
    marker: Option<Arc<dyn Marker>>,
    state: WatcherState,
    read_notify: Notify,
    /// Set while the read loop is parked waiting for a trigger.
    listening: AtomicBool,
    metrics: WatcherMetrics,
    config: WatchConfig,
}

impl Watcher {
    pub fn new(
        wal_dir: &Path,
        id: &str,
        metrics: WatcherMetrics,
        write_to: Arc<dyn WriteTo>,
        config: WatchConfig,
        marker: Option<Arc<dyn Marker>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.to_string(),
                wal_dir: wal_dir.to_path_buf(),
                write_to,
                marker,
                state: WatcherState::new(),
                read_notify: Notify::new(),
                listening: AtomicBool::new(false),
                metrics,
                config,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> State {
        self.inner.state.get()
    }

    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        info!(id = %self.inner.id, wal_dir = %self.inner.wal_dir.display(), "Starting WAL watcher");
        self.inner.metrics.watchers_running.inc();
        *task = Some(tokio::spawn(Arc::clone(&self.inner).main_loop()));
    }

    /// Reads whatever is left in the WAL, then stops reading. Returns once
    /// the watcher reached the end or the drain timeout passed.
    pub async fn drain(&self) {
        let inner = &self.inner;
        info!(id = %inner.id, "Draining WAL watcher");
        inner.state.transition(State::Draining);

        tokio::select! {
            _ = inner.state.wait_for_stopping() => {
                info!(id = %inner.id, "WAL watcher drained");
            }
            _ = tokio::time::sleep(inner.config.drain_timeout) => {
                warn!(
                    id = %inner.id,
                    timeout = ?inner.config.drain_timeout,
                    "WAL watcher drain timed out, stopping"
                );
                inner.state.transition(State::Stopping);
            }
        }
    }

    pub async fn stop(&self) {
        self.inner.state.transition(State::Stopping);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(id = %self.inner.id, error = %e, "WAL watcher task failed");
            }
            self.inner.metrics.watchers_running.dec();
            info!(id = %self.inner.id, "WAL watcher stopped");
        }
    }
}

impl WriteEventSubscriber for Watcher {
    /// Wakes the read loop if it is waiting. A notification arriving while
    /// the loop is busy is dropped, the read in progress or the timer will
    /// pick up the new data.
    fn notify_write(&self) {
        if self.inner.listening.load(Ordering::SeqCst) {
            self.inner.read_notify.notify_waiters();
        } else {
            self.inner
                .metrics
                .dropped_write_notifications
                .with_label_values(&[&self.inner.id])
                .inc();
        }
    }
}

impl Inner {
    async fn main_loop(self: Arc<Self>) {
        while !self.state.is_stopping() {
            let saved_segment = self
                .marker
                .as_ref()
                .map_or(-1, |marker| marker.last_marked_segment());
            debug!(id = %self.id, saved_segment, "Starting WAL read loop");

            let result = self.run(saved_segment).await;
            if let Err(e) = &result {
                if self.state.is_draining() && e.is_not_found() {
                    info!(id = %self.id, "Reached a missing segment while draining, assuming end of WAL");
                    self.state.transition(State::Stopping);
                } else {
                    error!(id = %self.id, error = %e, "Error tailing WAL");
                }
            }

            tokio::select! {
                _ = self.state.wait_for_stopping() => return,
                _ = tokio::time::sleep(RETRY_DELAY) => {}
            }
        }
    }

    async fn run(&self, saved_segment: i64) -> Result<(), WatchError> {
        let (_, last_segment) = first_and_last(&self.wal_dir)?;
        let mut current_segment = last_segment;

        if saved_segment != -1 {
            match find_next_segment(&self.wal_dir, saved_segment) {
                Ok(Some(next)) => {
                    current_segment = next;
                    self.metrics
                        .replay_segment
                        .with_label_values(&[&self.id])
                        .set(next);
                    info!(id = %self.id, saved_segment, replay_from = next, "Replaying WAL from marker");
                }
                Ok(None) => {
                    debug!(id = %self.id, saved_segment, "No segment after marker, starting at head");
                }
                Err(e) => {
                    warn!(id = %self.id, saved_segment, error = %e, "Failed to look up segment after marker");
                }
            }
        }

        debug!(id = %self.id, current_segment, last_segment, "Tailing WAL");
        while !self.state.is_stopping() {
            self.metrics
                .current_segment
                .with_label_values(&[&self.id])
                .set(current_segment);

            self.watch(current_segment, current_segment >= last_segment)
                .await?;
            current_segment += 1;
        }
        Ok(())
    }

    /// Reads one segment. A closed segment is read once to its end; the
    /// segment at the head is followed until a newer one appears.
    async fn watch(&self, segment: i64, tail: bool) -> Result<(), WatchError> {
        debug!(id = %self.id, segment, tail, "Watching segment");
        let mut reader = open_read_segment(&self.wal_dir, segment)?;

        if !tail {
            let size = segment_size(&self.wal_dir, segment)?;
            match self.read_segment(&mut reader, segment).await {
                Err(e) => {
                    warn!(id = %self.id, segment, error = %e, "Ignoring error reading to end of segment, may have dropped data");
                }
                Ok(_) if reader.offset() != size && !self.state.is_stopping() => {
                    warn!(
                        id = %self.id,
                        segment,
                        read = reader.offset(),
                        size,
                        "Expected to have read the whole segment, may have dropped data"
                    );
                }
                Ok(_) => {}
            }
            return Ok(());
        }

        let mut read_timer =
            ReadTimer::new(self.config.min_read_frequency, self.config.max_read_frequency);
        let mut segment_ticker =
            interval_at(Instant::now() + SEGMENT_CHECK_PERIOD, SEGMENT_CHECK_PERIOD);
        segment_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let notified = self.read_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            self.listening.store(true, Ordering::SeqCst);

            let trigger = tokio::select! {
                _ = self.state.wait_for_stopping() => None,
                _ = segment_ticker.tick() => Some(Trigger::SegmentCheck),
                _ = read_timer.tick() => Some(Trigger::Timer),
                _ = &mut notified => Some(Trigger::Notification),
            };
            self.listening.store(false, Ordering::SeqCst);

            let Some(trigger) = trigger else {
                return Ok(());
            };

            if let Trigger::SegmentCheck = trigger {
                let (_, last_segment) = first_and_last(&self.wal_dir)?;
                let draining = self.state.is_draining();
                if last_segment <= segment && !draining {
                    continue;
                }
                if draining {
                    debug!(id = %self.id, segment, "Draining segment completely");
                } else {
                    debug!(id = %self.id, segment, last_segment, "Newer segment found, finishing current");
                }
                // Writes to this segment are over; read the rest and move on.
                self.read_segment(&mut reader, segment).await?;
                return Ok(());
            }

            self.metrics
                .segment_read
                .with_label_values(&[&self.id, trigger.reason()])
                .inc();
            if self.read_segment(&mut reader, segment).await? {
                read_timer.reset();
            } else {
                read_timer.backoff();
            }
        }
    }

    /// Dispatches every complete record currently in the segment. Returns
    /// whether anything was read.
    async fn read_segment(
        &self,
        reader: &mut LiveReader,
        segment: i64,
    ) -> Result<bool, WatchError> {
        let mut read_data = false;
        while !self.state.is_stopping() {
            let Some(bytes) = reader.next_record()? else {
                break;
            };
            self.metrics
                .records_read
                .with_label_values(&[&self.id])
                .inc();
            read_data |= self.decode_and_dispatch(&bytes, segment).await?;
        }
        Ok(read_data)
    }

    async fn decode_and_dispatch(&self, bytes: &[u8], segment: i64) -> Result<bool, WatchError> {
        let record = match Record::decode(bytes) {
            Ok(record) => record,
            Err(e) => {
                self.metrics
                    .record_decode_fails
                    .with_label_values(&[&self.id])
                    .inc();
                warn!(id = %self.id, segment, error = %e, "Skipping record that failed to decode");
                return Ok(false);
            }
        };

        self.write_to.store_series(&record.series, segment);

        let mut first_err = None;
        for entries in record.entries {
            if let Some(newest) = entries.entries.iter().map(|e| e.timestamp).max() {
                let seconds = newest.timestamp_nanos_opt().unwrap_or_default() as f64 / 1e9;
                let gauge = self
                    .metrics
                    .last_read_timestamp
                    .with_label_values(&[&self.id]);
                if seconds > gauge.get() {
                    gauge.set(seconds);
                }
            }
            if let Err(e) = self.write_to.append_entries(entries, segment).await {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(WatchError::Append(e)),
            None => Ok(true),
        }
    }
}
