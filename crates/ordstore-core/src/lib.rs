//! OrdStore Core: Embedded Ordered Key-Value Engine
//!
//! An in-process storage engine for opaque byte-string keys and values,
//! ordered by a caller-supplied comparator.
//!
//! # Architecture
//!
//! - **Index**: multi-version skip list ordered by the installed comparator
//! - **Write path**: whole batches are logged first, then applied and
//!   published under one sequence number range
//! - **Read views**: a snapshot is a pinned sequence; reads through it never
//!   change
//! - **Compaction**: checkpoints of the live state replace old log segments
//!
//! # Example
//!
//! ```no_run
//! use ordstore_core::{Engine, Options, SeekDirection, SyncMode};
//!
//! # fn main() -> ordstore_core::StoreResult<()> {
//! let engine = Engine::open("/tmp/ordstore-demo", Options::default())?;
//! engine.put(b"a", b"1", SyncMode::Buffered)?;
//! engine.put(b"ab", b"2", SyncMode::Sync)?;
//!
//! let snapshot = engine.snapshot()?;
//! engine.delete(b"a", SyncMode::Buffered)?;
//! assert_eq!(engine.get(b"a", Some(&snapshot))?, Some(b"1".to_vec()));
//!
//! for (key, value) in engine.seek(b"a", SeekDirection::Forward, None) {
//!     println!("{:?} = {:?}", key, value);
//! }
//! engine.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! # No Schema
//!
//! This crate assigns no meaning to keys or values. Table layouts, encodings
//! and typed access belong to adapter crates (e.g. ordstore-state).

pub mod batch;
pub mod compaction;
mod compactor;
pub mod comparator;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod iterator;
pub mod meta;
pub mod platform_durability;
pub mod skiplist;
pub mod snapshot;
pub mod wal;

// Re-export key types for convenience
pub use batch::{BatchOp, WriteBatch};
pub use compaction::CompactionResult;
pub use comparator::{
    installed_count, is_installed, BytewiseComparator, ComparatorToken, FnComparator,
    KeyComparator,
};
pub use config::{Options, SyncMode};
pub use engine::{Engine, EngineStats};
pub use error::{StoreError, StoreResult};
pub use iterator::{DbIterator, Range, Seek, SeekDirection};
pub use snapshot::Snapshot;
