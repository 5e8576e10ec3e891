//! `Store`: the live, directly-written view of an OrdStore engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ordstore_core::{Engine, Options, Range, Seek, SeekDirection, StoreResult, SyncMode};

use crate::session::StoreSnapshot;
use crate::traits::{ReadOnlyStore, WriteStore};

/// Store facade over one engine.
///
/// Writes go straight to the engine, one atomic batch per call. Snapshot
/// sessions from [`get_snapshot`](Self::get_snapshot) share the engine and
/// keep it alive, but fail loudly if used after [`close`](Self::close).
pub struct Store {
    engine: Arc<Engine>,
    path: PathBuf,
}

impl Store {
    /// Open or create a store at `path` with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::open_with(path, Options::default().create_if_missing(true))
    }

    /// Open a store with explicit options.
    pub fn open_with<P: AsRef<Path>>(path: P, options: Options) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let engine = Engine::open(&path, options)?;
        Ok(Self {
            engine: Arc::new(engine),
            path,
        })
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffered put: acknowledged once the OS holds the log record.
    pub fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.engine.put(key, value, SyncMode::Buffered)
    }

    /// Put acknowledged only after the log reaches persistent storage.
    pub fn put_sync(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.engine.put(key, value, SyncMode::Sync)
    }

    /// Buffered delete.
    pub fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.engine.delete(key, SyncMode::Buffered)
    }

    /// Whether `key` holds a value.
    pub fn contains(&self, key: &[u8]) -> StoreResult<bool> {
        self.engine.contains(key, None)
    }

    /// Value of `key`, `None` if absent.
    pub fn try_get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.engine.get(key, None)
    }

    /// Lazy sequence from `prefix` in `direction`, over the state at the call.
    pub fn seek(&self, prefix: &[u8], direction: SeekDirection) -> Seek {
        self.engine.seek(prefix, direction, None)
    }

    /// Lazy ascending sequence over `[start, end]`, over the state at the call.
    pub fn find_range(&self, start: &[u8], end: &[u8]) -> Range {
        self.engine.find_range(start, end, None)
    }

    /// Start a snapshot session: pinned reads plus a private write batch.
    pub fn get_snapshot(&self) -> StoreResult<StoreSnapshot> {
        StoreSnapshot::new(Arc::clone(&self.engine))
    }

    /// Close the engine. Idempotent; dropping the store also closes it.
    pub fn close(&self) -> StoreResult<()> {
        self.engine.close()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Sessions may still hold the engine; close it now regardless.
        if let Err(e) = self.engine.close() {
            tracing::warn!(path = %self.path.display(), error = %e, "Close on drop failed");
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("closed", &self.engine.is_closed())
            .finish()
    }
}

impl ReadOnlyStore for Store {
    fn try_get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Store::try_get(self, key)
    }

    fn contains(&self, key: &[u8]) -> StoreResult<bool> {
        Store::contains(self, key)
    }

    fn seek(&self, prefix: &[u8], direction: SeekDirection) -> Seek {
        Store::seek(self, prefix, direction)
    }

    fn find_range(&self, start: &[u8], end: &[u8]) -> Range {
        Store::find_range(self, start, end)
    }
}

impl WriteStore for Store {
    fn put(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        Store::put(self, key, value)
    }

    fn delete(&mut self, key: &[u8]) -> StoreResult<()> {
        Store::delete(self, key)
    }
}
