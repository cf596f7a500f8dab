use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Upper bound for a single framed record. Anything larger is treated as corruption.
pub const MAX_RECORD_SIZE: usize = 128 * 1024 * 1024;

/// `len: u32 | crc32: u32`
const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt record in segment {segment} at offset {offset}: {reason}")]
    Corruption {
        segment: i64,
        offset: u64,
        reason: String,
    },
}

impl SegmentError {
    /// True when the underlying cause is a missing segment file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SegmentError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

/// Reader over the records of a single WAL segment.
///
/// `Ok(None)` means no complete record is available right now. For a segment
/// that is still being written this is the normal end-of-stream condition,
/// and calling again later may yield more records.
pub trait Reader {
    fn next_record(&mut self) -> Result<Option<Vec<u8>>, SegmentError>;

    /// Bytes of the segment consumed so far, including frame headers.
    fn offset(&self) -> u64;
}

/// Path of the segment with the given index inside `dir`.
pub fn segment_name(dir: &Path, index: i64) -> PathBuf {
    dir.join(format!("{:08}", index))
}

/// Lists segment indices present in `dir`, sorted ascending. Entries whose
/// name is not a number are skipped.
pub fn read_segment_numbers(dir: &Path) -> io::Result<Vec<i64>> {
    let mut refs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(index) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i64>().ok())
        {
            refs.push(index);
        }
    }
    refs.sort_unstable();
    Ok(refs)
}

/// First and last segment index in `dir`, or `(-1, -1)` if there are none.
pub fn first_and_last(dir: &Path) -> io::Result<(i64, i64)> {
    let refs = read_segment_numbers(dir)?;
    match (refs.first(), refs.last()) {
        (Some(first), Some(last)) => Ok((*first, *last)),
        _ => Ok((-1, -1)),
    }
}

/// Smallest existing segment index strictly greater than `index`.
pub fn find_next_segment(dir: &Path, index: i64) -> io::Result<Option<i64>> {
    Ok(read_segment_numbers(dir)?
        .into_iter()
        .find(|segment| *segment > index))
}

pub fn segment_size(dir: &Path, index: i64) -> io::Result<u64> {
    Ok(fs::metadata(segment_name(dir, index))?.len())
}

/// Frames a record payload the way [`LiveReader`] expects it on disk.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Opens a segment for reading from its beginning.
pub fn open_read_segment(dir: &Path, index: i64) -> Result<LiveReader, SegmentError> {
    let file = File::open(segment_name(dir, index))?;
    Ok(LiveReader::new(index, file))
}

/// Reads framed records from a segment that may still be growing.
///
/// Bytes belonging to a partially written frame are kept buffered until the
/// rest of the frame shows up.
pub struct LiveReader {
    segment: i64,
    file: File,
    buf: Vec<u8>,
    pos: usize,
    offset: u64,
}

impl LiveReader {
    pub fn new(segment: i64, file: File) -> Self {
        Self {
            segment,
            file,
            buf: Vec::new(),
            pos: 0,
            offset: 0,
        }
    }

    pub fn segment(&self) -> i64 {
        self.segment
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, SegmentError> {
        let available = &self.buf[self.pos..];
        if available.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([available[0], available[1], available[2], available[3]])
            as usize;
        let crc = u32::from_be_bytes([available[4], available[5], available[6], available[7]]);

        if len > MAX_RECORD_SIZE {
            return Err(SegmentError::Corruption {
                segment: self.segment,
                offset: self.offset,
                reason: format!("record length {} exceeds maximum {}", len, MAX_RECORD_SIZE),
            });
        }

        if available.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        let payload = &available[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
        if crc32fast::hash(payload) != crc {
            return Err(SegmentError::Corruption {
                segment: self.segment,
                offset: self.offset,
                reason: "checksum mismatch".to_string(),
            });
        }

        let record = payload.to_vec();
        self.pos += FRAME_HEADER_LEN + len;
        self.offset += (FRAME_HEADER_LEN + len) as u64;
        Ok(Some(record))
    }

    /// Pulls whatever the file currently holds past our read position.
    fn fill(&mut self) -> Result<usize, SegmentError> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        Ok(self.file.read_to_end(&mut self.buf)?)
    }
}

impl Reader for LiveReader {
    fn next_record(&mut self) -> Result<Option<Vec<u8>>, SegmentError> {
        loop {
            if let Some(record) = self.take_frame()? {
                return Ok(Some(record));
            }
            if self.fill()? == 0 {
                return Ok(None);
            }
        }
    }

    fn offset(&self) -> u64 {
        self.offset
    }
}
