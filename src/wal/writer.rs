use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info};

use super::record::{Entry, LabelSet, Record, RecordError, RefEntries, RefSeries, SeriesRef};
use super::segment::{encode_frame, first_and_last, read_segment_numbers, segment_name};
use super::watcher::WriteCleanup;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("WAL io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Wants to hear about every write to the WAL.
pub trait WriteEventSubscriber: Send + Sync {
    fn notify_write(&self);
}

/// Where subscribers register for WAL events.
pub trait WriterEventsNotifier: Send + Sync {
    fn subscribe_write(&self, subscriber: Arc<dyn WriteEventSubscriber>);
    fn subscribe_cleanup(&self, subscriber: Arc<dyn WriteCleanup>);
}

/// Notifier for setups without a local writer. Subscriptions go nowhere and
/// watchers rely on their read timer.
pub struct NilNotifier;

impl WriterEventsNotifier for NilNotifier {
    fn subscribe_write(&self, _subscriber: Arc<dyn WriteEventSubscriber>) {}
    fn subscribe_cleanup(&self, _subscriber: Arc<dyn WriteCleanup>) {}
}

struct WriterState {
    segment: i64,
    file: File,
    refs: HashMap<LabelSet, SeriesRef>,
    next_ref: SeriesRef,
    /// Series already defined in the current segment.
    defined: HashSet<SeriesRef>,
}

/// Appends records to the WAL.
///
/// A series is defined (ref plus labels) the first time it is used in each
/// segment, so every segment can be read on its own after older ones are
/// reclaimed.
pub struct WalWriter {
    dir: PathBuf,
    state: Mutex<WriterState>,
    write_subscribers: RwLock<Vec<Arc<dyn WriteEventSubscriber>>>,
    cleanup_subscribers: RwLock<Vec<Arc<dyn WriteCleanup>>>,
}

impl WalWriter {
    /// Opens the WAL in `dir`, starting a fresh segment after any existing ones.
    pub fn open(dir: &Path) -> Result<Self, WriterError> {
        fs::create_dir_all(dir)?;
        let (_, last) = first_and_last(dir)?;
        let segment = last + 1;
        let file = create_segment(dir, segment)?;
        info!(wal_dir = %dir.display(), segment, "Opened WAL for writing");

        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(WriterState {
                segment,
                file,
                refs: HashMap::new(),
                next_ref: 1,
                defined: HashSet::new(),
            }),
            write_subscribers: RwLock::new(Vec::new()),
            cleanup_subscribers: RwLock::new(Vec::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn current_segment(&self) -> i64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .segment
    }

    /// Appends entries for one label set as a single record.
    pub fn write_entries(&self, labels: &LabelSet, entries: Vec<Entry>) -> Result<(), WriterError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let series_ref = match state.refs.get(labels) {
                Some(series_ref) => *series_ref,
                None => {
                    let series_ref = state.next_ref;
                    state.next_ref += 1;
                    state.refs.insert(labels.clone(), series_ref);
                    series_ref
                }
            };

            let mut record = Record::default();
            if state.defined.insert(series_ref) {
                record.series.push(RefSeries {
                    series_ref,
                    labels: labels.clone(),
                });
            }
            record.entries.push(RefEntries {
                series_ref,
                entries,
            });

            let payload = record.encode()?;
            state.file.write_all(&encode_frame(&payload))?;
            state.file.flush()?;
        }
        self.notify_write();
        Ok(())
    }

    /// Appends an already encoded record payload.
    pub fn write_raw(&self, payload: &[u8]) -> Result<(), WriterError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.file.write_all(&encode_frame(payload))?;
            state.file.flush()?;
        }
        self.notify_write();
        Ok(())
    }

    /// Closes the current segment and starts the next one.
    pub fn next_segment(&self) -> Result<i64, WriterError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.file.sync_all()?;
        let segment = state.segment + 1;
        state.file = create_segment(&self.dir, segment)?;
        state.segment = segment;
        state.defined.clear();
        debug!(segment, "Started new WAL segment");
        Ok(segment)
    }

    pub fn sync(&self) -> Result<(), WriterError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.file.sync_all()?;
        Ok(())
    }

    /// Deletes closed segments up to and including `up_to` and tells cleanup
    /// subscribers their series can go. Returns how many segments were removed.
    pub fn truncate(&self, up_to: i64) -> Result<usize, WriterError> {
        let current = self.current_segment();
        let up_to = up_to.min(current - 1);
        let mut removed = 0;
        for segment in read_segment_numbers(&self.dir)? {
            if segment > up_to {
                break;
            }
            fs::remove_file(segment_name(&self.dir, segment))?;
            removed += 1;
        }

        if removed > 0 {
            info!(up_to, removed, "Reclaimed WAL segments");
            let subscribers = self
                .cleanup_subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for subscriber in subscribers.iter() {
                subscriber.series_reset(up_to);
            }
        }
        Ok(removed)
    }

    fn notify_write(&self) {
        let subscribers = self
            .write_subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for subscriber in subscribers.iter() {
            subscriber.notify_write();
        }
    }
}

impl WriterEventsNotifier for WalWriter {
    fn subscribe_write(&self, subscriber: Arc<dyn WriteEventSubscriber>) {
        self.write_subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    fn subscribe_cleanup(&self, subscriber: Arc<dyn WriteCleanup>) {
        self.cleanup_subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }
}

fn create_segment(dir: &Path, segment: i64) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(segment_name(dir, segment))
}
