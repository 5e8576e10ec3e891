//! Store identity file (`META`).
//!
//! Records which comparator ordered the data so a later open with a
//! different one is refused before any log is replayed.
//!
//! Layout: magic "OSMT" (4) + version u32 + name_len u8 + name + CRC32C u32

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{StoreError, StoreResult};
use crate::platform_durability::{durable_sync, sync_dir};

const META_MAGIC: [u8; 4] = [0x4F, 0x53, 0x4D, 0x54];
const META_VERSION: u32 = 1;
const META_FILE: &str = "META";

/// Path of the identity file inside a store directory.
pub fn identity_path(dir: &Path) -> PathBuf {
    dir.join(META_FILE)
}

/// Whether `dir` holds a store.
pub fn exists(dir: &Path) -> bool {
    identity_path(dir).is_file()
}

/// Write the identity file atomically.
pub fn write_identity(dir: &Path, comparator_name: &str) -> StoreResult<()> {
    let name = comparator_name.as_bytes();
    if name.is_empty() || name.len() > u8::MAX as usize {
        return Err(StoreError::InvalidComparatorName(comparator_name.to_string()));
    }

    let mut buf = Vec::with_capacity(4 + 4 + 1 + name.len() + 4);
    buf.extend_from_slice(&META_MAGIC);
    buf.extend_from_slice(&META_VERSION.to_le_bytes());
    buf.push(name.len() as u8);
    buf.extend_from_slice(name);
    let checksum = crc32c::crc32c(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());

    let path = identity_path(dir);
    let temp = dir.join(format!("{}.tmp", META_FILE));
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp)
            .map_err(|e| StoreError::io_at(&temp, &e, "Failed to create identity file"))?;
        file.write_all(&buf)
            .map_err(|e| StoreError::io_at(&temp, &e, "Failed to write identity file"))?;
        durable_sync(&file)
            .map_err(|e| StoreError::io_at(&temp, &e, "Failed to sync identity file"))?;
    }
    fs::rename(&temp, &path)
        .map_err(|e| StoreError::io_at(&path, &e, "Failed to install identity file"))?;
    sync_dir(dir)
}

/// Read the comparator name recorded in `dir`.
pub fn read_identity(dir: &Path) -> StoreResult<String> {
    let path = identity_path(dir);
    let buf =
        fs::read(&path).map_err(|e| StoreError::io_at(&path, &e, "Failed to read identity file"))?;

    let corrupt = |offset: u64, reason: &str| StoreError::Corruption {
        path: path.clone(),
        offset,
        reason: reason.to_string(),
    };

    if buf.len() < 4 + 4 + 1 + 4 {
        return Err(corrupt(0, "identity file too short"));
    }
    let body_end = buf.len() - 4;
    let expected = u32::from_le_bytes([
        buf[body_end],
        buf[body_end + 1],
        buf[body_end + 2],
        buf[body_end + 3],
    ]);
    let actual = crc32c::crc32c(&buf[..body_end]);
    if expected != actual {
        return Err(StoreError::ChecksumMismatch {
            path: path.clone(),
            expected,
            actual,
            offset: 0,
        });
    }
    if buf[0..4] != META_MAGIC {
        return Err(corrupt(0, "bad identity magic"));
    }
    if u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) != META_VERSION {
        return Err(corrupt(4, "unsupported identity version"));
    }
    let name_len = buf[8] as usize;
    if 9 + name_len != body_end {
        return Err(corrupt(8, "name length disagrees with file size"));
    }
    String::from_utf8(buf[9..body_end].to_vec())
        .map_err(|_| corrupt(9, "comparator name is not UTF-8"))
}
