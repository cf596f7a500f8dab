use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::labels::{labels_key, without_reserved};
use super::push::{encode_push_request, PushRequest, PushStream};
use crate::marker::MarkerHandle;
use crate::wal::record::{Entry, LabelSet};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("streams limit exceeded, streams: {current} exceeds limit: {limit}, stream: '{stream}'")]
    StreamLimitExceeded {
        current: usize,
        limit: usize,
        stream: String,
    },

    #[error("failed to encode batch: {0}")]
    Encode(#[from] std::io::Error),
}

#[derive(Debug)]
struct Stream {
    labels: LabelSet,
    entries: Vec<Entry>,
}

/// Entries for one tenant, grouped by stream, waiting to be pushed.
///
/// Besides the entries themselves a batch remembers how many came from each
/// WAL segment, so delivery can be reported back to the marker once the
/// batch is done.
#[derive(Debug)]
pub struct Batch {
    streams: BTreeMap<String, Stream>,
    bytes: usize,
    created_at: Instant,
    max_streams: usize,
    segment_counter: HashMap<i64, i64>,
}

impl Batch {
    /// `max_streams` of 0 means no limit.
    pub fn new(max_streams: usize) -> Self {
        Self {
            streams: BTreeMap::new(),
            bytes: 0,
            created_at: Instant::now(),
            max_streams,
            segment_counter: HashMap::new(),
        }
    }

    /// Adds an entry to the stream for `labels`. A rejected entry leaves the
    /// batch untouched.
    pub fn add(&mut self, labels: &LabelSet, entry: Entry) -> Result<(), BatchError> {
        let key = labels_key(labels);

        if let Some(stream) = self.streams.get_mut(&key) {
            self.bytes += entry.line.len();
            stream.entries.push(entry);
            return Ok(());
        }

        if self.max_streams > 0 && self.streams.len() >= self.max_streams {
            return Err(BatchError::StreamLimitExceeded {
                current: self.streams.len(),
                limit: self.max_streams,
                stream: key,
            });
        }

        self.bytes += entry.line.len();
        self.streams.insert(
            key,
            Stream {
                labels: without_reserved(labels),
                entries: vec![entry],
            },
        );
        Ok(())
    }

    /// Like [`Batch::add`], also counting the entry against `segment`.
    pub fn add_from_wal(
        &mut self,
        labels: &LabelSet,
        entry: Entry,
        segment: i64,
    ) -> Result<(), BatchError> {
        self.add(labels, entry)?;
        *self.segment_counter.entry(segment).or_insert(0) += 1;
        Ok(())
    }

    /// Total bytes of line text held.
    pub fn size_bytes(&self) -> usize {
        self.bytes
    }

    pub fn size_bytes_after(&self, line: &str) -> usize {
        self.bytes + line.len()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn entry_count(&self) -> usize {
        self.streams.values().map(|s| s.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Builds the gzip-compressed push payload. Returns it with the number
    /// of entries it carries.
    pub fn encode(&self) -> Result<(Vec<u8>, usize), BatchError> {
        let request = PushRequest {
            streams: self
                .streams
                .values()
                .map(|stream| PushStream::new(stream.labels.clone(), &stream.entries))
                .collect(),
        };
        let body = encode_push_request(&request)?;
        Ok((body, self.entry_count()))
    }

    /// Tells the marker that every WAL entry in this batch is done.
    pub fn report_as_sent_data(&self, marker: &dyn MarkerHandle) {
        for (segment, count) in &self.segment_counter {
            marker.update_sent_data(*segment, *count);
        }
    }
}
