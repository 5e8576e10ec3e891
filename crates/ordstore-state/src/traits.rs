//! Read and write surfaces shared by `Store` and `StoreSnapshot`.
//!
//! Higher-level state code takes `&impl ReadOnlyStore` or `&mut impl
//! WriteStore` and works the same against the live store or a session.

use ordstore_core::{Range, Seek, SeekDirection, StoreResult};

/// Point reads and ordered scans.
pub trait ReadOnlyStore {
    /// Value of `key`, `None` if absent.
    fn try_get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Whether `key` holds a value.
    fn contains(&self, key: &[u8]) -> StoreResult<bool>;

    /// Lazy sequence from `prefix` in `direction`.
    fn seek(&self, prefix: &[u8], direction: SeekDirection) -> Seek;

    /// Lazy ascending sequence over keys in `[start, end]`.
    fn find_range(&self, start: &[u8], end: &[u8]) -> Range;
}

/// Mutations.
pub trait WriteStore {
    /// Insert or overwrite `key`.
    fn put(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Remove `key`. Removing an absent key succeeds.
    fn delete(&mut self, key: &[u8]) -> StoreResult<()>;
}
