//! Binary format definitions for OrdStore log records
//!
//! Every log record carries one whole write batch:
//! RecordHeader (20 bytes) + payload
//!
//! Payload: sequence(u64) + count(u32)
//!          + count × [operation(u8) + key_len(u32) + value_len(u32) + key + value]
//!
//! All integers are little-endian. One CRC32C in the header covers the
//! entire payload, so a batch is either recovered whole or rejected whole.
//! A second CRC32C covers the header itself, so a damaged length field is
//! reported as damage rather than mistaken for a torn tail.

use std::path::PathBuf;

use crate::batch::{BatchOp, WriteBatch};
use crate::error::{StoreError, StoreResult};

/// Magic bytes identifying OrdStore log records: "OSWL"
pub const MAGIC_ARRAY: [u8; 4] = [0x4F, 0x53, 0x57, 0x4C];

/// Header size in bytes
pub const HEADER_SIZE: usize = 20;

/// Header bytes covered by the header checksum
const HEADER_BODY: usize = 16;

/// Fixed payload prefix: sequence + count
const PAYLOAD_PREFIX: usize = 8 + 4;

/// Per-operation prefix: operation + key_len + value_len
const OP_PREFIX: usize = 1 + 4 + 4;

/// Largest key, value or payload the u32 length fields can frame
pub const MAX_FIELD_SIZE: u64 = u32::MAX as u64;

/// Mutation kinds stored in a batch record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or update a key-value pair
    Put = 1,
    /// Delete a key
    Delete = 2,
}

/// Record kinds. Only whole batches are logged today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Batch = 1,
}

/// Fixed-size header in front of each record
///
/// Layout:
///   [0..4]   magic:       [u8;4] - "OSWL"
///   [4..8]   length:      u32    - payload length in bytes
///   [8..12]  checksum:    u32    - CRC32C of payload bytes
///   [12]     record_type: u8
///   [13..16] reserved:    [u8;3] - zero
///   [16..20] header_crc:  u32    - CRC32C of bytes [0..16]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub record_type: u8,
    pub header_checksum: u32,
}

impl RecordHeader {
    fn new(length: u32, checksum: u32, record_type: RecordType) -> Self {
        let mut header = Self {
            magic: MAGIC_ARRAY,
            length,
            checksum,
            record_type: record_type as u8,
            header_checksum: 0,
        };
        header.header_checksum = crc32c::crc32c(&header.body_bytes());
        header
    }

    fn body_bytes(&self) -> [u8; HEADER_BODY] {
        let mut buf = [0u8; HEADER_BODY];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.record_type;
        buf
    }

    /// Serialize header to bytes for writing
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..HEADER_BODY].copy_from_slice(&self.body_bytes());
        buf[16..20].copy_from_slice(&self.header_checksum.to_le_bytes());
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            length: read_u32(bytes, 4),
            checksum: read_u32(bytes, 8),
            record_type: bytes[12],
            header_checksum: read_u32(bytes, 16),
        }
    }

    /// Whether the header checksum matches the header fields.
    ///
    /// Only an intact header's `length` can be trusted.
    pub fn is_intact(&self) -> bool {
        crc32c::crc32c(&self.body_bytes()) == self.header_checksum
    }

    /// Full record size: header plus payload.
    pub fn record_size(&self) -> usize {
        HEADER_SIZE + self.length as usize
    }
}

/// A decoded log record: the batch and the sequence of its first operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub sequence: u64,
    pub batch: WriteBatch,
}

impl LogRecord {
    /// Sequence assigned to the batch's last operation.
    pub fn last_sequence(&self) -> u64 {
        self.sequence + self.batch.len().saturating_sub(1) as u64
    }
}

fn check_field(component: &'static str, size: usize) -> StoreResult<()> {
    if size as u64 > MAX_FIELD_SIZE {
        return Err(StoreError::EntryTooLarge {
            component,
            size: size as u64,
            max: MAX_FIELD_SIZE,
        });
    }
    Ok(())
}

/// Serialize a batch into one complete log record.
///
/// `sequence` is the number assigned to the batch's first operation.
pub fn encode_batch(sequence: u64, batch: &WriteBatch) -> StoreResult<Vec<u8>> {
    // Validate sizes before allocating anything
    let mut payload_size = PAYLOAD_PREFIX;
    for op in batch {
        check_field("key", op.key().len())?;
        let value_len = op.value().map_or(0, <[u8]>::len);
        check_field("value", value_len)?;
        payload_size += OP_PREFIX + op.key().len() + value_len;
    }
    check_field("batch", payload_size)?;

    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload_size);
    buffer.extend_from_slice(&[0u8; HEADER_SIZE]);
    buffer.extend_from_slice(&sequence.to_le_bytes());
    buffer.extend_from_slice(&(batch.len() as u32).to_le_bytes());
    for op in batch {
        let value = op.value().unwrap_or_default();
        buffer.push(op.operation() as u8);
        buffer.extend_from_slice(&(op.key().len() as u32).to_le_bytes());
        buffer.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buffer.extend_from_slice(op.key());
        buffer.extend_from_slice(value);
    }

    let checksum = crc32c::crc32c(&buffer[HEADER_SIZE..]);
    let header = RecordHeader::new(payload_size as u32, checksum, RecordType::Batch);
    buffer[..HEADER_SIZE].copy_from_slice(&header.to_bytes());

    Ok(buffer)
}

fn corrupt(offset: usize, reason: String) -> StoreError {
    StoreError::Corruption {
        path: PathBuf::from("<buffer>"),
        offset: offset as u64,
        reason,
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Deserialize one record from the start of `data`.
///
/// `data` must hold at least the full record. Offsets in returned errors are
/// relative to `data`; the log reader rewrites them with file context.
pub fn decode_record(data: &[u8]) -> StoreResult<LogRecord> {
    if data.len() < HEADER_SIZE {
        return Err(corrupt(0, format!("record too short: {} bytes", data.len())));
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..HEADER_SIZE]);
    let header = RecordHeader::from_bytes(&header_bytes);

    if header.magic != MAGIC_ARRAY {
        return Err(corrupt(0, format!("bad magic {:02x?}", header.magic)));
    }
    if !header.is_intact() {
        return Err(corrupt(0, "header checksum mismatch".into()));
    }
    if header.record_type != RecordType::Batch as u8 {
        return Err(corrupt(12, format!("unknown record type {}", header.record_type)));
    }
    if data.len() < header.record_size() {
        return Err(corrupt(
            HEADER_SIZE,
            format!("truncated payload: need {}, have {}", header.length, data.len() - HEADER_SIZE),
        ));
    }

    let payload = &data[HEADER_SIZE..header.record_size()];
    let actual = crc32c::crc32c(payload);
    if actual != header.checksum {
        return Err(StoreError::ChecksumMismatch {
            path: PathBuf::from("<buffer>"),
            expected: header.checksum,
            actual,
            offset: 0,
        });
    }

    if payload.len() < PAYLOAD_PREFIX {
        return Err(corrupt(HEADER_SIZE, "payload shorter than batch prefix".into()));
    }
    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&payload[0..8]);
    let sequence = u64::from_le_bytes(seq_bytes);
    let count = read_u32(payload, 8) as usize;

    let mut batch = WriteBatch::new();
    let mut at = PAYLOAD_PREFIX;
    for _ in 0..count {
        if payload.len() < at + OP_PREFIX {
            return Err(corrupt(HEADER_SIZE + at, "operation header past end of payload".into()));
        }
        let op = payload[at];
        let key_len = read_u32(payload, at + 1) as usize;
        let value_len = read_u32(payload, at + 5) as usize;
        let key_start = at + OP_PREFIX;
        let value_end = key_start + key_len + value_len;
        if payload.len() < value_end {
            return Err(corrupt(
                HEADER_SIZE + at,
                format!("operation needs {} bytes, payload has {}", value_end, payload.len()),
            ));
        }
        let key = payload[key_start..key_start + key_len].to_vec();
        match op {
            1 => batch.push(BatchOp::Put {
                key,
                value: payload[key_start + key_len..value_end].to_vec(),
            }),
            2 => batch.push(BatchOp::Delete { key }),
            other => {
                return Err(corrupt(HEADER_SIZE + at, format!("invalid operation type {}", other)))
            }
        }
        at = value_end;
    }

    if at != payload.len() {
        return Err(corrupt(HEADER_SIZE + at, "trailing bytes after last operation".into()));
    }

    Ok(LogRecord { sequence, batch })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.put(b"alpha", b"1").delete(b"beta").put(b"", b"");
        batch
    }

    #[test]
    fn test_header_layout() {
        let header = RecordHeader::new(42, 0xDEADBEEF, RecordType::Batch);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"OSWL");
        assert_eq!(RecordHeader::from_bytes(&bytes), header);
        assert_eq!(header.record_size(), HEADER_SIZE + 42);
        assert!(header.is_intact());
    }

    #[test]
    fn test_damaged_length_breaks_header_checksum() {
        let mut data = encode_batch(1, &sample_batch()).unwrap();
        data[6] ^= 0x01;

        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&data[..HEADER_SIZE]);
        assert!(!RecordHeader::from_bytes(&header_bytes).is_intact());

        let err = decode_record(&data).unwrap_err();
        assert!(matches!(err, StoreError::Corruption { .. }));
    }

    #[test]
    fn test_batch_record_decodes() {
        let batch = sample_batch();
        let encoded = encode_batch(7, &batch).unwrap();
        let record = decode_record(&encoded).unwrap();

        assert_eq!(record.sequence, 7);
        assert_eq!(record.last_sequence(), 9);
        assert_eq!(record.batch, batch);
    }

    #[test]
    fn test_binary_keys_with_nul_bytes() {
        let mut batch = WriteBatch::new();
        batch.put(&[0, 0, 1, 0], &[0xFF, 0, 0xFF]);
        let record = decode_record(&encode_batch(1, &batch).unwrap()).unwrap();
        assert_eq!(record.batch.iter().next().unwrap().key(), &[0, 0, 1, 0]);
    }

    #[test]
    fn test_corrupted_magic_detected() {
        let mut data = encode_batch(1, &sample_batch()).unwrap();
        data[0] = 0xFF;
        assert!(matches!(decode_record(&data), Err(StoreError::Corruption { .. })));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut data = encode_batch(1, &sample_batch()).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(matches!(decode_record(&data), Err(StoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let data = encode_batch(1, &sample_batch()).unwrap();
        let err = decode_record(&data[..data.len() - 3]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_empty_batch_record() {
        let record = decode_record(&encode_batch(5, &WriteBatch::new()).unwrap()).unwrap();
        assert!(record.batch.is_empty());
        assert_eq!(record.last_sequence(), 5);
    }
}
