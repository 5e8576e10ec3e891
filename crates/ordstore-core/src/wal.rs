//! Write-ahead log for OrdStore
//!
//! Every committed batch is appended as one checksummed record before it is
//! applied to the in-memory index:
//! 1. Encode the batch (sequence + operations, CRC32C)
//! 2. Append the record to the current segment
//! 3. For `SyncMode::Sync`, durable_sync() the segment
//! 4. Only then does the engine insert into the index and publish
//!
//! A failed append truncates the segment back to its previous length, so a
//! rejected batch can never resurface on recovery. If that truncation also
//! fails the writer is poisoned and refuses further appends.
//!
//! Segments are named `wal-{number:016x}.log`. Each open starts a fresh
//! segment, so a torn tail left by a crash is never appended to.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::config::SyncMode;
use crate::error::{StoreError, StoreResult};
use crate::format::{decode_record, LogRecord, RecordHeader, HEADER_SIZE, MAGIC_ARRAY};
use crate::platform_durability::{durable_sync, sync_dir};

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".log";

/// Path of segment `number` inside `wal_dir`.
pub fn segment_path(wal_dir: &Path, number: u64) -> PathBuf {
    wal_dir.join(format!("{}{:016x}{}", SEGMENT_PREFIX, number, SEGMENT_SUFFIX))
}

/// All segments in `wal_dir`, sorted by number.
pub fn list_segments(wal_dir: &Path) -> StoreResult<Vec<(u64, PathBuf)>> {
    let entries = std::fs::read_dir(wal_dir)
        .map_err(|e| StoreError::io_at(wal_dir, &e, "Failed to read WAL directory"))?;

    let mut segments = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| StoreError::io_at(wal_dir, &e, "Failed to read directory entry"))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(hex) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
        else {
            continue;
        };
        if let Ok(number) = u64::from_str_radix(hex, 16) {
            segments.push((number, entry.path()));
        }
    }
    segments.sort_by_key(|(number, _)| *number);
    Ok(segments)
}

/// Appends batch records to the active segment.
///
/// Owned by the engine behind a mutex: one writer at a time.
pub struct WalWriter {
    /// Active segment handle
    file: File,
    /// Path to the active segment (for error context)
    path: PathBuf,
    /// Active segment size in bytes
    size: u64,
    /// Bytes across every segment still on disk
    retained_bytes: u64,
    /// WAL directory
    wal_dir: PathBuf,
    /// Active segment number
    number: u64,
    /// Rotation threshold
    rotation_size: u64,
    /// Set when a failed append could not be rolled back
    poisoned: Option<String>,
    #[cfg(test)]
    fault: Option<Fault>,
}

/// Failure injected into the next append.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Half the record reaches the file, then the write fails
    Write,
    /// As `Write`, and truncating the partial record fails too
    WriteAndRollback,
}

impl WalWriter {
    /// Start a new segment after the highest one already in `wal_dir`.
    pub fn open<P: AsRef<Path>>(wal_dir: P, rotation_size: u64) -> StoreResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&wal_dir)
            .map_err(|e| StoreError::io_at(&wal_dir, &e, "Failed to create WAL directory"))?;

        let existing = list_segments(&wal_dir)?;
        let mut retained_bytes = 0;
        for (_, path) in &existing {
            retained_bytes += std::fs::metadata(path)
                .map_err(|e| StoreError::io_at(path, &e, "Failed to stat WAL segment"))?
                .len();
        }
        let number = existing.last().map_or(1, |(n, _)| n + 1);
        let (file, path) = Self::create_segment(&wal_dir, number)?;

        Ok(Self {
            file,
            path,
            size: 0,
            retained_bytes,
            wal_dir,
            number,
            rotation_size,
            poisoned: None,
            #[cfg(test)]
            fault: None,
        })
    }

    fn create_segment(wal_dir: &Path, number: u64) -> StoreResult<(File, PathBuf)> {
        let path = segment_path(wal_dir, number);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io_at(&path, &e, "Failed to create WAL segment"))?;
        sync_dir(wal_dir)?;
        Ok((file, path))
    }

    /// Append one encoded record.
    ///
    /// With `SyncMode::Sync` the call returns only after the record is on
    /// persistent media. With `SyncMode::Buffered` it returns once the OS
    /// holds the bytes.
    pub fn append(&mut self, record: &[u8], mode: SyncMode) -> StoreResult<()> {
        if let Some(reason) = &self.poisoned {
            return Err(StoreError::LogPoisoned(reason.clone()));
        }

        if self.size > 0 && self.size + record.len() as u64 > self.rotation_size {
            self.rotate()?;
        }

        let before = self.size;
        if let Err(e) = self.write_record(record) {
            let err = StoreError::io_at(&self.path, &e, "WAL write failed");
            self.roll_back(before);
            return Err(err);
        }

        if mode == SyncMode::Sync {
            if let Err(e) = durable_sync(&self.file) {
                let err = StoreError::io_at(&self.path, &e, "WAL durable_sync failed");
                self.roll_back(before);
                return Err(err);
            }
        }

        self.size += record.len() as u64;
        self.retained_bytes += record.len() as u64;
        Ok(())
    }

    #[cfg(not(test))]
    fn write_record(&mut self, record: &[u8]) -> std::io::Result<()> {
        self.file.write_all(record)
    }

    #[cfg(test)]
    fn write_record(&mut self, record: &[u8]) -> std::io::Result<()> {
        if self.fault.is_some() {
            self.file.write_all(&record[..record.len() / 2])?;
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected write failure"));
        }
        self.file.write_all(record)
    }

    #[cfg(not(test))]
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.file.set_len(len)
    }

    #[cfg(test)]
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        if self.fault.take() == Some(Fault::WriteAndRollback) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected truncate failure"));
        }
        self.file.set_len(len)
    }

    /// Make the next append fail.
    #[cfg(test)]
    pub(crate) fn inject_fault(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    /// Cut the segment back to `len` after a failed append.
    fn roll_back(&mut self, len: u64) {
        if let Err(e) = self.truncate(len) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "WAL rollback failed, poisoning log"
            );
            self.poisoned = Some(format!(
                "rollback of {} to {} bytes failed: {}",
                self.path.display(),
                len,
                e
            ));
        }
    }

    /// Sync the active segment and continue in a new one.
    pub fn rotate(&mut self) -> StoreResult<()> {
        durable_sync(&self.file)
            .map_err(|e| StoreError::io_at(&self.path, &e, "WAL sync before rotation failed"))?;

        let (file, path) = Self::create_segment(&self.wal_dir, self.number + 1)?;
        tracing::debug!(from = %self.path.display(), to = %path.display(), "Rotated WAL segment");

        self.number += 1;
        self.file = file;
        self.path = path;
        self.size = 0;
        Ok(())
    }

    /// Make every earlier buffered append durable.
    pub fn sync(&self) -> StoreResult<()> {
        durable_sync(&self.file).map_err(|e| StoreError::io_at(&self.path, &e, "WAL sync failed"))
    }

    /// Delete every segment numbered below `number`. Returns how many went.
    pub fn delete_segments_before(&mut self, number: u64) -> StoreResult<usize> {
        let mut removed = 0;
        for (n, path) in list_segments(&self.wal_dir)? {
            if n >= number {
                break;
            }
            let len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            std::fs::remove_file(&path)
                .map_err(|e| StoreError::io_at(&path, &e, "Failed to delete WAL segment"))?;
            self.retained_bytes = self.retained_bytes.saturating_sub(len);
            removed += 1;
        }
        if removed > 0 {
            sync_dir(&self.wal_dir)?;
        }
        Ok(removed)
    }

    /// Active segment path (for diagnostics)
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Active segment size in bytes
    pub fn current_size(&self) -> u64 {
        self.size
    }

    /// Active segment number
    pub fn segment_number(&self) -> u64 {
        self.number
    }

    /// Bytes across all segments still on disk
    pub fn retained_bytes(&self) -> u64 {
        self.retained_bytes
    }

    /// Whether a failed rollback has disabled the writer.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }
}

/// Replays segments during open.
pub struct WalReader {
    wal_dir: PathBuf,
    paranoid: bool,
}

impl WalReader {
    /// Reader over `wal_dir`. With `paranoid`, mid-segment corruption fails
    /// recovery; otherwise the damaged record is skipped.
    pub fn new<P: AsRef<Path>>(wal_dir: P, paranoid: bool) -> Self {
        Self {
            wal_dir: wal_dir.as_ref().to_path_buf(),
            paranoid,
        }
    }

    /// Recover all intact batch records, in segment order.
    ///
    /// Per segment:
    /// 1. An all-zero remainder is an unwritten tail: stop
    /// 2. Check magic and the header checksum at the current offset
    /// 3. If an intact header's record extends past end of file, it is a
    ///    torn write: stop
    /// 4. Verify CRC32C and decode the batch
    /// 5. On damage before the end of the segment: error (paranoid) or
    ///    resync at the next magic
    pub fn recover(&self) -> StoreResult<Vec<LogRecord>> {
        if !self.wal_dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for (_, path) in list_segments(&self.wal_dir)? {
            records.extend(self.recover_segment(&path)?);
        }
        Ok(records)
    }

    fn recover_segment(&self, path: &Path) -> StoreResult<Vec<LogRecord>> {
        let mut buffer = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut buffer))
            .map_err(|e| StoreError::io_at(path, &e, "Failed to read WAL segment"))?;

        let mut records = Vec::new();
        let mut offset = 0;

        while offset < buffer.len() {
            if buffer[offset..].iter().all(|&b| b == 0) {
                tracing::warn!(
                    path = %path.display(),
                    offset,
                    len = buffer.len() - offset,
                    "Zeroed tail at end of WAL segment"
                );
                break;
            }
            if buffer.len() - offset < HEADER_SIZE {
                tracing::warn!(
                    path = %path.display(),
                    offset,
                    "Torn header at end of WAL segment"
                );
                break;
            }

            if buffer[offset..offset + 4] != MAGIC_ARRAY {
                self.damaged(path, offset, "bad magic".into())?;
                match find_next_magic(&buffer, offset + 1) {
                    Some(next) => offset = next,
                    None => break,
                }
                continue;
            }

            let mut header_bytes = [0u8; HEADER_SIZE];
            header_bytes.copy_from_slice(&buffer[offset..offset + HEADER_SIZE]);
            let header = RecordHeader::from_bytes(&header_bytes);

            if !header.is_intact() {
                let Some(next) = find_next_magic(&buffer, offset + 1) else {
                    tracing::warn!(
                        path = %path.display(),
                        offset,
                        "Torn header at end of WAL segment"
                    );
                    break;
                };
                // More records follow, so this is damage, not a crash point
                self.damaged(path, offset, "header checksum mismatch".into())?;
                offset = next;
                continue;
            }

            let record_size = header.record_size();
            if offset + record_size > buffer.len() {
                // The crash point: everything after is incomplete
                tracing::warn!(
                    path = %path.display(),
                    offset,
                    need = record_size,
                    have = buffer.len() - offset,
                    "Torn write at end of WAL segment"
                );
                break;
            }

            match decode_record(&buffer[offset..offset + record_size]) {
                Ok(record) => {
                    records.push(record);
                    offset += record_size;
                }
                Err(e) if offset + record_size == buffer.len() => {
                    // Last record in the segment: a partially persisted tail
                    tracing::warn!(
                        path = %path.display(),
                        offset,
                        error = %e,
                        "Dropping damaged tail record"
                    );
                    break;
                }
                Err(e) => {
                    self.damaged(path, offset, e.to_string())?;
                    match find_next_magic(&buffer, offset + 1) {
                        Some(next) => offset = next,
                        None => break,
                    }
                }
            }
        }

        Ok(records)
    }

    /// Fail (paranoid) or log and continue on a damaged record.
    fn damaged(&self, path: &Path, offset: usize, reason: String) -> StoreResult<()> {
        if self.paranoid {
            return Err(StoreError::Corruption {
                path: path.to_path_buf(),
                offset: offset as u64,
                reason,
            });
        }
        tracing::warn!(path = %path.display(), offset, %reason, "Skipping damaged WAL record");
        Ok(())
    }
}

/// Scan forward for the next record magic, to resync after damage.
fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    buffer
        .get(start..)?
        .windows(MAGIC_ARRAY.len())
        .position(|w| w == MAGIC_ARRAY)
        .map(|i| start + i)
}
