//! Snapshot sessions.
//!
//! A session reads from the view pinned when it was created and buffers its
//! own writes in a private batch. Reads never see the buffered writes, and
//! nothing reaches the engine until [`StoreSnapshot::commit`].

use std::sync::Arc;

use ordstore_core::{
    Engine, Range, Seek, SeekDirection, Snapshot, StoreResult, SyncMode, WriteBatch,
};

use crate::traits::{ReadOnlyStore, WriteStore};

/// Pinned read view plus a private write batch.
///
/// Dropping the session (or calling [`dispose`](Self::dispose)) discards
/// uncommitted writes and releases the view.
pub struct StoreSnapshot {
    // Declared before `engine`; the view is released first.
    snapshot: Snapshot,
    batch: WriteBatch,
    engine: Arc<Engine>,
}

impl StoreSnapshot {
    pub(crate) fn new(engine: Arc<Engine>) -> StoreResult<Self> {
        let snapshot = engine.snapshot()?;
        Ok(Self {
            snapshot,
            batch: WriteBatch::new(),
            engine,
        })
    }

    /// Sequence of the pinned view.
    pub fn sequence(&self) -> u64 {
        self.snapshot.sequence()
    }

    /// Value of `key` in the pinned view.
    pub fn try_get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.engine.get(key, Some(&self.snapshot))
    }

    /// Whether `key` holds a value in the pinned view.
    pub fn contains(&self, key: &[u8]) -> StoreResult<bool> {
        self.engine.contains(key, Some(&self.snapshot))
    }

    /// Lazy sequence from `prefix` over the pinned view.
    pub fn seek(&self, prefix: &[u8], direction: SeekDirection) -> Seek {
        self.engine.seek(prefix, direction, Some(&self.snapshot))
    }

    /// Lazy ascending sequence over `[start, end]` in the pinned view.
    pub fn find_range(&self, start: &[u8], end: &[u8]) -> Range {
        self.engine.find_range(start, end, Some(&self.snapshot))
    }

    /// Buffer a put.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.batch.put(key, value);
    }

    /// Buffer a delete.
    pub fn delete(&mut self, key: &[u8]) {
        self.batch.delete(key);
    }

    /// Operations buffered since the last commit.
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Apply the buffered writes atomically, then clear the buffer.
    ///
    /// The session keeps reading its original view; committed writes are
    /// visible to views taken afterwards. On error the buffer is kept.
    pub fn commit(&mut self) -> StoreResult<()> {
        self.commit_with(SyncMode::Buffered)
    }

    /// [`commit`](Self::commit) with a durable log flush.
    pub fn commit_sync(&mut self) -> StoreResult<()> {
        self.commit_with(SyncMode::Sync)
    }

    fn commit_with(&mut self, mode: SyncMode) -> StoreResult<()> {
        self.engine.write(&self.batch, mode)?;
        tracing::debug!(
            operations = self.batch.len(),
            bytes = self.batch.approximate_size(),
            sequence = self.snapshot.sequence(),
            "Committed snapshot session"
        );
        self.batch.clear();
        Ok(())
    }

    /// End the session, discarding uncommitted writes.
    pub fn dispose(self) {}
}

impl Drop for StoreSnapshot {
    fn drop(&mut self) {
        if !self.batch.is_empty() {
            tracing::debug!(
                discarded = self.batch.len(),
                "Snapshot session dropped with uncommitted writes"
            );
        }
    }
}

impl std::fmt::Debug for StoreSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSnapshot")
            .field("sequence", &self.snapshot.sequence())
            .field("pending", &self.batch.len())
            .finish()
    }
}

impl ReadOnlyStore for StoreSnapshot {
    fn try_get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        StoreSnapshot::try_get(self, key)
    }

    fn contains(&self, key: &[u8]) -> StoreResult<bool> {
        StoreSnapshot::contains(self, key)
    }

    fn seek(&self, prefix: &[u8], direction: SeekDirection) -> Seek {
        StoreSnapshot::seek(self, prefix, direction)
    }

    fn find_range(&self, start: &[u8], end: &[u8]) -> Range {
        StoreSnapshot::find_range(self, start, end)
    }
}

impl WriteStore for StoreSnapshot {
    fn put(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        StoreSnapshot::put(self, key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> StoreResult<()> {
        StoreSnapshot::delete(self, key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::Store;
    use tempfile::TempDir;

    #[test]
    fn test_reads_ignore_own_writes() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.put(b"k", b"old").unwrap();

        let mut session = store.get_snapshot().unwrap();
        session.put(b"k", b"new");
        session.put(b"k2", b"v");
        assert_eq!(session.try_get(b"k").unwrap(), Some(b"old".to_vec()));
        assert!(!session.contains(b"k2").unwrap());
        assert_eq!(session.pending(), 2);
    }

    #[test]
    fn test_commit_applies_and_clears() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut session = store.get_snapshot().unwrap();
        session.put(b"a", b"1");
        session.commit().unwrap();
        assert_eq!(session.pending(), 0);
        assert_eq!(store.try_get(b"a").unwrap(), Some(b"1".to_vec()));

        // A second commit of the cleared buffer writes nothing
        let before = store.engine().stats().last_sequence;
        session.commit().unwrap();
        assert_eq!(store.engine().stats().last_sequence, before);
    }

    #[test]
    fn test_dispose_discards() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut session = store.get_snapshot().unwrap();
        session.delete(b"a");
        session.put(b"b", b"2");
        session.dispose();

        assert_eq!(store.try_get(b"b").unwrap(), None);
        assert_eq!(store.engine().stats().open_snapshots, 0);
    }
}
