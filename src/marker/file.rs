use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const MARKER_FOLDER_NAME: &str = "remote";
pub const MARKER_FILE_NAME: &str = "segment_marker";

const MARKER_VERSION_V1: u16 = 1;
/// `version: u16 | segment: u64 | crc32: u32`
const MARKER_V1_LEN: usize = 14;
const MARKER_DIR_MODE: u32 = 0o775;

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("marker io error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported marker version {0}")]
    UnsupportedVersion(u16),

    #[error("marker has invalid length {0}")]
    InvalidLength(usize),

    #[error("marker checksum mismatch")]
    ChecksumMismatch,

    #[error("cannot mark negative segment {0}")]
    NegativeSegment(i64),
}

/// Durable storage for the last fully delivered segment.
pub trait MarkerStore: Send + Sync {
    /// Last persisted segment, or -1 when nothing valid has been persisted.
    fn last_marked_segment(&self) -> i64;

    fn mark_segment(&self, segment: i64) -> Result<(), MarkerError>;
}

pub fn encode_marker_v1(segment: u64) -> [u8; MARKER_V1_LEN] {
    let mut buf = [0u8; MARKER_V1_LEN];
    buf[0..2].copy_from_slice(&MARKER_VERSION_V1.to_be_bytes());
    buf[2..10].copy_from_slice(&segment.to_be_bytes());
    let crc = crc32fast::hash(&buf[0..10]);
    buf[10..14].copy_from_slice(&crc.to_be_bytes());
    buf
}

pub fn decode_marker(bytes: &[u8]) -> Result<u64, MarkerError> {
    if bytes.len() < 2 {
        return Err(MarkerError::InvalidLength(bytes.len()));
    }
    let version = u16::from_be_bytes([bytes[0], bytes[1]]);
    if version != MARKER_VERSION_V1 {
        return Err(MarkerError::UnsupportedVersion(version));
    }
    if bytes.len() != MARKER_V1_LEN {
        return Err(MarkerError::InvalidLength(bytes.len()));
    }

    let crc = u32::from_be_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
    if crc32fast::hash(&bytes[0..10]) != crc {
        return Err(MarkerError::ChecksumMismatch);
    }

    let mut segment = [0u8; 8];
    segment.copy_from_slice(&bytes[2..10]);
    Ok(u64::from_be_bytes(segment))
}

/// Marker kept at `<wal_dir>/remote/<client_name>/segment_marker`.
pub struct MarkerFileHandler {
    dir: PathBuf,
    path: PathBuf,
}

impl MarkerFileHandler {
    pub fn new(wal_dir: &Path, client_name: &str) -> Result<Self, MarkerError> {
        let dir = wal_dir.join(MARKER_FOLDER_NAME).join(client_name);
        create_marker_dir(&dir)?;
        let path = dir.join(MARKER_FILE_NAME);
        Ok(Self { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<u64, MarkerError> {
        let bytes = fs::read(&self.path)?;
        decode_marker(&bytes)
    }
}

impl MarkerStore for MarkerFileHandler {
    fn last_marked_segment(&self) -> i64 {
        match self.read() {
            Ok(segment) => i64::try_from(segment).unwrap_or_else(|_| {
                warn!(path = %self.path.display(), segment, "Ignoring out of range segment marker");
                -1
            }),
            Err(MarkerError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No segment marker found");
                -1
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable segment marker");
                -1
            }
        }
    }

    fn mark_segment(&self, segment: i64) -> Result<(), MarkerError> {
        if segment < 0 {
            return Err(MarkerError::NegativeSegment(segment));
        }

        // Write to a sibling temp file and rename over the marker so a crash
        // never leaves a half-written marker behind.
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&encode_marker_v1(segment as u64))?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        sync_dir(&self.dir);
        Ok(())
    }
}

#[cfg(unix)]
fn create_marker_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(MARKER_DIR_MODE)
        .create(dir)
}

#[cfg(not(unix))]
fn create_marker_dir(dir: &Path) -> io::Result<()> {
    let _ = MARKER_DIR_MODE;
    fs::create_dir_all(dir)
}

/// Best effort, the rename is already durable on most filesystems.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
