//! Compaction: checkpoints that let old log segments go.
//!
//! A checkpoint is a sorted image of every live key at one sequence number.
//! Once it is durable, log segments holding only batches at or below that
//! sequence, and older checkpoints, can be deleted.
//!
//! Checkpoints use the atomic rename pattern:
//! 1. Write `checkpoint-{seq}.ckpt.tmp`
//! 2. durable_sync the temp file
//! 3. Rename over the final name (atomic on POSIX)
//! 4. sync the directory
//!
//! A crash before the rename leaves an orphaned temp file, removed on the
//! next open; a crash after it leaves a complete checkpoint.
//!
//! File layout:
//! header (32 bytes) + count × [key_len(u32) + value_len(u32) + key + value] + CRC32C(u32)
//!
//! The trailing CRC covers everything before it.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{StoreError, StoreResult};
use crate::format::MAX_FIELD_SIZE;
use crate::platform_durability::{durable_sync, sync_dir};

/// Magic bytes identifying checkpoint files: "OSCP"
const CHECKPOINT_MAGIC: [u8; 4] = [0x4F, 0x53, 0x43, 0x50];

/// Checkpoint format version
const CHECKPOINT_VERSION: u32 = 1;

/// Checkpoint header size in bytes
///
/// Layout:
///   [0..4]   magic:    "OSCP"
///   [4..8]   version:  u32
///   [8..16]  sequence: u64
///   [16..24] count:    u64
///   [24..32] reserved: zero
const CHECKPOINT_HEADER_SIZE: usize = 32;

const CHECKPOINT_PREFIX: &str = "checkpoint-";
const CHECKPOINT_SUFFIX: &str = ".ckpt";
const TEMP_SUFFIX: &str = ".tmp";

/// Summary of one compaction run.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Path of the checkpoint written
    pub checkpoint_path: PathBuf,
    /// Sequence the checkpoint captures
    pub sequence: u64,
    /// Live keys written
    pub live_entries: usize,
    /// Checkpoint size in bytes
    pub checkpoint_bytes: u64,
    /// Log bytes on disk before the run
    pub log_bytes_before: u64,
    /// Log segments deleted
    pub segments_removed: usize,
    /// Older checkpoints deleted
    pub checkpoints_removed: usize,
    /// Index versions no open view needed any more
    pub versions_purged: usize,
    /// Index nodes dropped because no version of their key remained
    pub nodes_purged: usize,
}

impl CompactionResult {
    /// Log bytes minus checkpoint bytes; negative when the checkpoint is larger.
    pub fn bytes_saved(&self) -> i64 {
        self.log_bytes_before as i64 - self.checkpoint_bytes as i64
    }
}

/// A checkpoint loaded during open.
#[derive(Debug)]
pub struct Checkpoint {
    pub path: PathBuf,
    pub sequence: u64,
    /// Entries in the order they were written (the comparator order at write time)
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Path of the checkpoint for `sequence` inside `data_dir`.
pub fn checkpoint_path(data_dir: &Path, sequence: u64) -> PathBuf {
    data_dir.join(format!("{}{:016x}{}", CHECKPOINT_PREFIX, sequence, CHECKPOINT_SUFFIX))
}

/// All complete checkpoints in `data_dir`, sorted by sequence.
pub fn list_checkpoints(data_dir: &Path) -> StoreResult<Vec<(u64, PathBuf)>> {
    let entries = fs::read_dir(data_dir)
        .map_err(|e| StoreError::io_at(data_dir, &e, "Failed to read data directory"))?;

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(hex) = name
            .strip_prefix(CHECKPOINT_PREFIX)
            .and_then(|rest| rest.strip_suffix(CHECKPOINT_SUFFIX))
        else {
            continue;
        };
        if let Ok(sequence) = u64::from_str_radix(hex, 16) {
            found.push((sequence, entry.path()));
        }
    }
    found.sort_by_key(|(sequence, _)| *sequence);
    Ok(found)
}

/// Remove temp files left by a crash mid-checkpoint. Returns how many.
pub fn remove_orphans(data_dir: &Path) -> StoreResult<usize> {
    let entries = fs::read_dir(data_dir)
        .map_err(|e| StoreError::io_at(data_dir, &e, "Failed to read data directory"))?;

    let mut removed = 0;
    for entry in entries.flatten() {
        let is_orphan = entry
            .file_name()
            .to_str()
            .map_or(false, |n| n.starts_with(CHECKPOINT_PREFIX) && n.ends_with(TEMP_SUFFIX));
        if is_orphan {
            let path = entry.path();
            fs::remove_file(&path)
                .map_err(|e| StoreError::io_at(&path, &e, "Failed to remove orphaned checkpoint"))?;
            tracing::warn!(path = %path.display(), "Removed orphaned checkpoint temp file");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Write a checkpoint of `entries` at `sequence`. Returns its path and size.
pub fn write_checkpoint(
    data_dir: &Path,
    sequence: u64,
    entries: &[(Vec<u8>, Vec<u8>)],
) -> StoreResult<(PathBuf, u64)> {
    let mut body_len = CHECKPOINT_HEADER_SIZE;
    for (key, value) in entries {
        for (component, len) in [("key", key.len()), ("value", value.len())] {
            if len as u64 > MAX_FIELD_SIZE {
                return Err(StoreError::EntryTooLarge {
                    component,
                    size: len as u64,
                    max: MAX_FIELD_SIZE,
                });
            }
        }
        body_len += 8 + key.len() + value.len();
    }

    let mut buf = Vec::with_capacity(body_len + 4);
    buf.extend_from_slice(&CHECKPOINT_MAGIC);
    buf.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
    buf.extend_from_slice(&sequence.to_le_bytes());
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    buf.extend_from_slice(&[0u8; 8]);
    for (key, value) in entries {
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
    }
    let checksum = crc32c::crc32c(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());

    let final_path = checkpoint_path(data_dir, sequence);
    let mut temp_name = final_path.clone().into_os_string();
    temp_name.push(TEMP_SUFFIX);
    let temp_path = PathBuf::from(temp_name);

    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| StoreError::io_at(&temp_path, &e, "Failed to create checkpoint"))?;
        file.write_all(&buf)
            .map_err(|e| StoreError::io_at(&temp_path, &e, "Failed to write checkpoint"))?;
        durable_sync(&file)
            .map_err(|e| StoreError::io_at(&temp_path, &e, "Failed to sync checkpoint"))?;
    }

    fs::rename(&temp_path, &final_path)
        .map_err(|e| StoreError::io_at(&final_path, &e, "Failed to install checkpoint"))?;
    sync_dir(data_dir)?;

    Ok((final_path, buf.len() as u64))
}

fn corrupt(path: &Path, offset: usize, reason: &str) -> StoreError {
    StoreError::Corruption {
        path: path.to_path_buf(),
        offset: offset as u64,
        reason: reason.to_string(),
    }
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Read and verify one checkpoint file.
pub fn read_checkpoint(path: &Path) -> StoreResult<Checkpoint> {
    let buf = fs::read(path).map_err(|e| StoreError::io_at(path, &e, "Failed to read checkpoint"))?;
    if buf.len() < CHECKPOINT_HEADER_SIZE + 4 {
        return Err(corrupt(path, 0, "checkpoint shorter than header"));
    }

    let body_end = buf.len() - 4;
    let expected = le_u32(&buf, body_end);
    let actual = crc32c::crc32c(&buf[..body_end]);
    if expected != actual {
        return Err(StoreError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
            offset: body_end as u64,
        });
    }

    if buf[0..4] != CHECKPOINT_MAGIC {
        return Err(corrupt(path, 0, "bad checkpoint magic"));
    }
    if le_u32(&buf, 4) != CHECKPOINT_VERSION {
        return Err(corrupt(path, 4, "unsupported checkpoint version"));
    }
    let sequence = le_u64(&buf, 8);
    let count = le_u64(&buf, 16);

    let mut entries = Vec::new();
    let mut at = CHECKPOINT_HEADER_SIZE;
    for _ in 0..count {
        if at + 8 > body_end {
            return Err(corrupt(path, at, "entry header past end of checkpoint"));
        }
        let key_len = le_u32(&buf, at) as usize;
        let value_len = le_u32(&buf, at + 4) as usize;
        let key_start = at + 8;
        let value_end = key_start + key_len + value_len;
        if value_end > body_end {
            return Err(corrupt(path, at, "entry past end of checkpoint"));
        }
        entries.push((
            buf[key_start..key_start + key_len].to_vec(),
            buf[key_start + key_len..value_end].to_vec(),
        ));
        at = value_end;
    }
    if at != body_end {
        return Err(corrupt(path, at, "trailing bytes after last entry"));
    }

    Ok(Checkpoint {
        path: path.to_path_buf(),
        sequence,
        entries,
    })
}

/// Load the newest checkpoint, if any.
pub fn load_latest(data_dir: &Path) -> StoreResult<Option<Checkpoint>> {
    match list_checkpoints(data_dir)?.pop() {
        Some((_, path)) => read_checkpoint(&path).map(Some),
        None => Ok(None),
    }
}

/// Delete checkpoints older than `sequence`. Returns how many went.
pub fn delete_checkpoints_before(data_dir: &Path, sequence: u64) -> StoreResult<usize> {
    let mut removed = 0;
    for (seq, path) in list_checkpoints(data_dir)? {
        if seq >= sequence {
            break;
        }
        fs::remove_file(&path)
            .map_err(|e| StoreError::io_at(&path, &e, "Failed to delete old checkpoint"))?;
        removed += 1;
    }
    if removed > 0 {
        sync_dir(data_dir)?;
    }
    Ok(removed)
}
