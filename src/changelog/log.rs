//! Append-only change-log file.
//!
//! Layout: a 5-byte header (magic + version) followed by frames. Each frame is
//! `len: u32 LE | MessagePack body | crc32: u32 LE`. A transaction commits as
//! exactly one frame, so a crash can only ever leave a torn final frame, which
//! is truncated away when the log is reopened.

use crate::error::{Result, SyncError};
use crate::types::{ChangeLogEntry, EntityKey, EntryId, Timestamp, Version};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the change log.
const LOG_MAGIC: &[u8; 4] = b"CHG\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_SIZE: u64 = 5;

/// Frame overhead (length prefix + checksum).
const FRAME_OVERHEAD: u64 = 8;

/// Sanity bound on a single frame body.
const MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;

/// A unit of durable state in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogFrame {
    /// All entries of one committed transaction.
    Commit(Vec<ChangeLogEntry>),

    /// Per-key version counters and id/time high-water marks. Written first
    /// on compaction so versions and ids keep increasing after the entries
    /// that produced them are pruned.
    Checkpoint {
        counters: Vec<(EntityKey, Version)>,
        max_id: EntryId,
        last_created_at: Timestamp,
    },
}

struct LogState {
    file: File,
    size: u64,
    writes_since_sync: u64,
}

/// Append-only change-log file.
pub struct ChangeLogFile {
    /// Path to the log file.
    path: PathBuf,

    state: Mutex<LogState>,

    /// Sync every N commits (1 = every commit).
    sync_interval: u64,
}

impl ChangeLogFile {
    /// Default sync interval. Every commit is made durable before it returns.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 1;

    /// Open or create a log with the default sync interval, returning the
    /// frames recovered from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<LogFrame>)> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a log with a custom sync interval.
    /// - sync_interval = 0 or 1: sync every commit (safest)
    /// - sync_interval = 100: sync every 100 commits (faster, a crash may lose
    ///   the unsynced tail)
    pub fn open_with_sync_interval(
        path: impl AsRef<Path>,
        sync_interval: u64,
    ) -> Result<(Self, Vec<LogFrame>)> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_size = file.metadata()?.len();

        let (frames, size) = if file_size == 0 {
            Self::write_header(&mut file)?;
            file.sync_all()?;
            (Vec::new(), HEADER_SIZE)
        } else {
            let (frames, good_len) = Self::replay(&file, file_size)?;
            if good_len < file_size {
                tracing::warn!(
                    path = %path.display(),
                    truncated_bytes = file_size - good_len,
                    "truncating torn tail of change log"
                );
                file.set_len(good_len)?;
                file.sync_all()?;
            }
            (frames, good_len)
        };

        Ok((
            Self {
                path,
                state: Mutex::new(LogState {
                    file,
                    size,
                    writes_since_sync: 0,
                }),
                sync_interval: sync_interval.max(1),
            },
            frames,
        ))
    }

    /// Append a frame. Returns the offset it was written at.
    ///
    /// On failure the file is cut back to its previous length so a failed
    /// commit never leaves a partial frame in front of later ones.
    pub fn append(&self, frame: &LogFrame) -> Result<u64> {
        let bytes = Self::encode_frame(frame)?;

        let mut state = self.state.lock();
        let offset = state.size;

        let file = &mut state.file;
        let written = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(&bytes));

        if let Err(e) = written {
            let _ = state.file.set_len(offset);
            return Err(e.into());
        }

        state.writes_since_sync += 1;
        if state.writes_since_sync >= self.sync_interval {
            if let Err(e) = state.file.sync_data() {
                let _ = state.file.set_len(offset);
                return Err(e.into());
            }
            state.writes_since_sync = 0;
        }

        state.size = offset + bytes.len() as u64;
        Ok(offset)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.file.sync_all()?;
        state.writes_since_sync = 0;
        Ok(())
    }

    /// Atomically replace the log contents with `frames`.
    ///
    /// Writes a sibling file, syncs it, and renames it over the log.
    pub fn rewrite(&self, frames: &[LogFrame]) -> Result<()> {
        let mut state = self.state.lock();

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        Self::write_header(&mut tmp)?;
        let mut size = HEADER_SIZE;
        for frame in frames {
            let bytes = Self::encode_frame(frame)?;
            tmp.write_all(&bytes)?;
            size += bytes.len() as u64;
        }
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        state.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        state.size = size;
        state.writes_since_sync = 0;
        Ok(())
    }

    /// Current file size.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(LOG_MAGIC)?;
        file.write_all(&[LOG_VERSION])?;
        Ok(())
    }

    fn encode_frame(frame: &LogFrame) -> Result<Vec<u8>> {
        let body = rmp_serde::to_vec(frame)?;
        if body.len() as u64 > MAX_FRAME_BYTES {
            return Err(SyncError::Serialization(format!(
                "frame of {} bytes exceeds limit",
                body.len()
            )));
        }

        let mut out = Vec::with_capacity(body.len() + FRAME_OVERHEAD as usize);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        Ok(out)
    }

    /// Read every intact frame. Returns the frames and the length of the
    /// valid prefix of the file.
    fn replay(file: &File, file_size: u64) -> Result<(Vec<LogFrame>, u64)> {
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);

        if file_size < HEADER_SIZE {
            return Err(SyncError::InvalidFormat("Change log header truncated".into()));
        }

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid change log magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported change log version: {}",
                version[0]
            )));
        }

        let mut frames = Vec::new();
        let mut offset = HEADER_SIZE;

        while offset < file_size {
            let remaining = file_size - offset;
            if remaining < FRAME_OVERHEAD {
                break;
            }

            let mut len_bytes = [0u8; 4];
            reader.read_exact(&mut len_bytes)?;
            let len = u64::from(u32::from_le_bytes(len_bytes));

            if len > MAX_FRAME_BYTES {
                return Err(SyncError::Corruption(format!(
                    "frame at offset {} claims {} bytes",
                    offset, len
                )));
            }

            let frame_end = offset + len + FRAME_OVERHEAD;
            if frame_end > file_size {
                // Torn final frame.
                break;
            }

            let mut body = vec![0u8; len as usize];
            reader.read_exact(&mut body)?;

            let mut checksum_bytes = [0u8; 4];
            reader.read_exact(&mut checksum_bytes)?;
            let stored = u32::from_le_bytes(checksum_bytes);
            let computed = crc32fast::hash(&body);

            if stored != computed {
                if frame_end == file_size {
                    break;
                }
                return Err(SyncError::ChecksumMismatch {
                    expected: stored,
                    got: computed,
                });
            }

            frames.push(rmp_serde::from_slice(&body)?);
            offset = frame_end;
        }

        Ok((frames, offset))
    }
}
