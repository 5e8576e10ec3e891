//! Core storage engine: the heart of OrdStore.
//!
//! `Engine` combines a comparator-ordered multi-version skip list with a
//! crash-safe write-ahead log and periodic checkpoints.
//!
//! **Read path**: index read lock, value visible at the view's sequence
//! **Write path**: log append first, then index, then publish the sequence
//! **Background**: optional compactor writes checkpoints and drops old log
//!
//! On-disk layout under the store directory:
//!
//! ```text
//! LOCK                               exclusive process lock
//! META                               identity file (comparator name)
//! wal/wal-{number:016x}.log          log segments
//! data/checkpoint-{seq:016x}.ckpt    checkpoints
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::batch::WriteBatch;
use crate::compaction::{self, CompactionResult};
use crate::compactor::{start_compactor, CompactionTarget, CompactorHandle};
use crate::comparator::{ComparatorBridge, ComparatorToken};
use crate::config::{Options, SyncMode};
use crate::error::{StoreError, StoreResult};
use crate::format::encode_batch;
use crate::iterator::{DbIterator, Range, Seek, SeekDirection};
use crate::meta;
use crate::platform_durability::FileLock;
use crate::skiplist::SkipList;
use crate::snapshot::{Snapshot, SnapshotRegistry};
use crate::wal::{WalReader, WalWriter};

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Sequence of the last applied mutation
    pub last_sequence: u64,
    /// Keys with a value in the latest state
    pub live_keys: usize,
    /// Versions retained for open views, across all keys
    pub retained_versions: usize,
    /// Index nodes, including keys with nothing left to read until a purge
    pub index_nodes: usize,
    /// Caller snapshots currently open
    pub open_snapshots: usize,
    /// Log bytes on disk
    pub log_bytes: u64,
    /// Checkpoints written since open
    pub checkpoints_written: u64,
}

/// The log writer and the lock file live and die together.
struct Writer {
    wal: WalWriter,
    _lock: FileLock,
}

/// State shared by the engine, its snapshots and iterators, and the compactor.
pub(crate) struct Shared {
    pub(crate) index: RwLock<SkipList>,
    pub(crate) snapshots: SnapshotRegistry,
    pub(crate) comparator: ComparatorBridge,
    /// `None` once closed
    writer: Mutex<Option<Writer>>,
    /// Serializes compactions
    compaction: Mutex<()>,
    closed: AtomicBool,
    checkpoints_written: AtomicU64,
    data_dir: PathBuf,
}

impl Shared {
    /// # Panics
    /// If the engine has been closed.
    pub(crate) fn assert_open(&self) {
        assert!(!self.closed.load(Ordering::Acquire), "OrdStore engine used after close");
    }

    fn active(writer: &mut Option<Writer>) -> &mut Writer {
        match writer {
            Some(writer) => writer,
            None => panic!("OrdStore engine used after close"),
        }
    }

    /// WRITE ORDERING:
    /// 1. Encode the whole batch as one record at the next free sequence
    /// 2. Append it to the log (synced if requested)
    /// 3. Insert every operation into the index
    /// 4. Publish the batch's last sequence
    ///
    /// If the log append fails the index is never touched.
    fn write(&self, batch: &WriteBatch, mode: SyncMode) -> StoreResult<()> {
        let mut guard = self.writer.lock();
        let writer = Self::active(&mut guard);
        if batch.is_empty() {
            return Ok(());
        }

        // Only writers advance the sequence, and they hold this mutex.
        let first = self.snapshots.published() + 1;
        let record = encode_batch(first, batch)?;
        writer.wal.append(&record, mode)?;

        let mut index = self.index.write();
        let oldest_pinned = self.snapshots.oldest_pinned();
        let mut sequence = first;
        for op in batch {
            index.insert(op.key(), sequence, op.value(), oldest_pinned);
            sequence += 1;
        }
        self.snapshots.publish(sequence - 1);
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        let mut guard = self.writer.lock();
        Self::active(&mut guard).wal.sync()
    }

    fn log_bytes_held(&self) -> u64 {
        self.writer.lock().as_ref().map_or(0, |w| w.wal.retained_bytes())
    }

    fn run_compaction(&self) -> StoreResult<CompactionResult> {
        let _running = self.compaction.lock();
        let started = Instant::now();

        // Reclaim what released views held, copy the state and cut the log
        // at the same sequence. Writers wait only for this block.
        let (sequence, entries, boundary, log_bytes_before, purged) = {
            let mut guard = self.writer.lock();
            let writer = Self::active(&mut guard);
            let sequence = self.snapshots.published();
            let (entries, purged) = {
                let mut index = self.index.write();
                let purged = index.purge(self.snapshots.oldest_pinned());
                (index.live_entries(sequence), purged)
            };
            let log_bytes_before = writer.wal.retained_bytes();
            writer.wal.rotate()?;
            (sequence, entries, writer.wal.segment_number(), log_bytes_before, purged)
        };

        let (checkpoint_path, checkpoint_bytes) =
            compaction::write_checkpoint(&self.data_dir, sequence, &entries)?;
        self.checkpoints_written.fetch_add(1, Ordering::Relaxed);

        // Only now is the older log redundant
        let segments_removed = {
            let mut guard = self.writer.lock();
            Self::active(&mut guard).wal.delete_segments_before(boundary)?
        };
        let checkpoints_removed = compaction::delete_checkpoints_before(&self.data_dir, sequence)?;

        let result = CompactionResult {
            checkpoint_path,
            sequence,
            live_entries: entries.len(),
            checkpoint_bytes,
            log_bytes_before,
            segments_removed,
            checkpoints_removed,
            versions_purged: purged.versions_removed,
            nodes_purged: purged.nodes_removed,
        };
        tracing::info!(
            sequence,
            live_entries = result.live_entries,
            checkpoint_bytes,
            segments_removed,
            checkpoints_removed,
            versions_purged = result.versions_purged,
            nodes_purged = result.nodes_purged,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Compaction complete"
        );
        Ok(result)
    }
}

impl CompactionTarget for Shared {
    fn log_bytes(&self) -> u64 {
        self.log_bytes_held()
    }

    fn compact(&self) -> StoreResult<CompactionResult> {
        self.run_compaction()
    }
}

/// State rebuilt from disk during open.
struct Recovered {
    index: SkipList,
    last_sequence: u64,
    checkpoint_sequence: Option<u64>,
    replayed_batches: usize,
}

/// Load the newest checkpoint, then replay every log batch past it.
fn recover(
    comparator: &ComparatorBridge,
    wal_dir: &Path,
    data_dir: &Path,
    paranoid: bool,
) -> StoreResult<Recovered> {
    compaction::remove_orphans(data_dir)?;

    let mut index = SkipList::new(comparator.clone());
    let mut last_sequence = 0;
    let checkpoint = compaction::load_latest(data_dir)?;
    let checkpoint_sequence = checkpoint.as_ref().map(|c| c.sequence);
    if let Some(checkpoint) = checkpoint {
        for (key, value) in &checkpoint.entries {
            index.insert(key, checkpoint.sequence, Some(value.as_slice()), checkpoint.sequence);
        }
        last_sequence = checkpoint.sequence;
    }
    let floor = last_sequence;

    let mut replayed_batches = 0;
    for record in WalReader::new(wal_dir, paranoid).recover()? {
        if record.sequence <= floor {
            continue;
        }
        // Nothing is pinned yet, so every older version can go
        for (i, op) in record.batch.iter().enumerate() {
            let sequence = record.sequence + i as u64;
            index.insert(op.key(), sequence, op.value(), sequence);
        }
        last_sequence = last_sequence.max(record.last_sequence());
        replayed_batches += 1;
    }

    Ok(Recovered {
        index,
        last_sequence,
        checkpoint_sequence,
        replayed_batches,
    })
}

/// An open ordered key-value store.
///
/// All methods take `&self`; the engine is `Send + Sync` and is usually
/// shared behind an `Arc`. Writers serialize on the log mutex, readers take
/// a short shared lock on the index.
///
/// [`close`](Self::close) (or drop) ends the engine's life. Any later call,
/// including one through a snapshot or iterator taken earlier, panics.
pub struct Engine {
    shared: Arc<Shared>,
    compactor: Mutex<Option<CompactorHandle>>,
    path: PathBuf,
}

impl Engine {
    /// Open or create a store at `path`.
    ///
    /// Takes the process lock, checks the comparator against the identity
    /// file, rebuilds the index from the newest checkpoint plus the log, and
    /// starts the compactor if enabled. On error nothing stays open.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> StoreResult<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let exists = meta::exists(&path);

        if exists && options.error_if_exists {
            return Err(StoreError::AlreadyExists(path));
        }
        if !exists && !options.create_if_missing {
            return Err(StoreError::Io {
                path: Some(path),
                kind: std::io::ErrorKind::NotFound,
                message: "No store found and create_if_missing is false".into(),
            });
        }

        let wal_dir = path.join("wal");
        let data_dir = path.join("data");
        for dir in [&wal_dir, &data_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::io_at(dir, &e, "Failed to create directory"))?;
        }

        let lock = FileLock::acquire(&path.join("LOCK"))?;

        if exists {
            let stored = meta::read_identity(&path)?;
            if stored != options.comparator.name() {
                return Err(StoreError::ComparatorMismatch {
                    stored,
                    supplied: options.comparator.name().to_string(),
                });
            }
        }

        let comparator = ComparatorBridge::install(Arc::clone(&options.comparator))?;
        let opened = Self::initialize(&path, &wal_dir, &data_dir, &options, &comparator, exists);
        let (recovered, wal) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                comparator.release();
                return Err(e);
            }
        };

        tracing::info!(
            path = %path.display(),
            comparator = comparator.name(),
            last_sequence = recovered.last_sequence,
            checkpoint_sequence = ?recovered.checkpoint_sequence,
            replayed_batches = recovered.replayed_batches,
            live_keys = recovered.index.live_len(),
            "Opened OrdStore"
        );

        let shared = Arc::new(Shared {
            index: RwLock::new(recovered.index),
            snapshots: SnapshotRegistry::new(recovered.last_sequence, options.max_open_snapshots),
            comparator,
            writer: Mutex::new(Some(Writer { wal, _lock: lock })),
            compaction: Mutex::new(()),
            closed: AtomicBool::new(false),
            checkpoints_written: AtomicU64::new(0),
            data_dir,
        });
        let engine = Self {
            shared,
            compactor: Mutex::new(None),
            path,
        };

        if options.background_compaction {
            // On failure the engine is dropped here, which closes it
            let handle = start_compactor(
                Arc::clone(&engine.shared),
                options.checkpoint_trigger_bytes,
                options.compaction_cadence,
            )?;
            *engine.compactor.lock() = Some(handle);
        }

        Ok(engine)
    }

    /// Steps of open that run with the comparator installed.
    fn initialize(
        path: &Path,
        wal_dir: &Path,
        data_dir: &Path,
        options: &Options,
        comparator: &ComparatorBridge,
        exists: bool,
    ) -> StoreResult<(Recovered, WalWriter)> {
        if !exists {
            meta::write_identity(path, comparator.name())?;
        }
        let recovered = recover(comparator, wal_dir, data_dir, options.paranoid_checks)?;
        let wal = WalWriter::open(wal_dir, options.wal_rotation_size_bytes)?;
        Ok((recovered, wal))
    }

    /// Close the engine. Idempotent.
    ///
    /// Stops the compactor, makes buffered writes durable, releases the lock
    /// file and finally the comparator. Snapshots and iterators still alive
    /// may be dropped afterwards but not used.
    pub fn close(&self) -> StoreResult<()> {
        if let Some(handle) = self.compactor.lock().take() {
            handle.shutdown();
        }
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let writer = self.shared.writer.lock().take();
        let synced = match writer {
            Some(writer) => writer.wal.sync(),
            None => Ok(()),
        };
        self.shared.comparator.release();

        tracing::debug!(path = %self.path.display(), "Closed OrdStore");
        synced
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Sequence a read observes: the snapshot's, or the latest.
    fn read_sequence(&self, snapshot: Option<&Snapshot>) -> Option<u64> {
        self.shared.assert_open();
        snapshot.map(|s| {
            assert!(
                Arc::ptr_eq(s.shared(), &self.shared),
                "snapshot belongs to a different engine"
            );
            s.sequence()
        })
    }

    /// Value of `key`, read at `snapshot` or the latest state.
    pub fn get(&self, key: &[u8], snapshot: Option<&Snapshot>) -> StoreResult<Option<Vec<u8>>> {
        let at = self.read_sequence(snapshot);
        let index = self.shared.index.read();
        let sequence = at.unwrap_or_else(|| self.shared.snapshots.published());
        Ok(index.get(key, sequence).map(<[u8]>::to_vec))
    }

    /// Whether `key` holds a value at `snapshot` or the latest state.
    pub fn contains(&self, key: &[u8], snapshot: Option<&Snapshot>) -> StoreResult<bool> {
        let at = self.read_sequence(snapshot);
        let index = self.shared.index.read();
        let sequence = at.unwrap_or_else(|| self.shared.snapshots.published());
        Ok(index.get(key, sequence).is_some())
    }

    /// Insert or overwrite one key.
    pub fn put(&self, key: &[u8], value: &[u8], mode: SyncMode) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(&batch, mode)
    }

    /// Delete one key. Deleting an absent key succeeds.
    pub fn delete(&self, key: &[u8], mode: SyncMode) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(&batch, mode)
    }

    /// Apply every operation of `batch` atomically.
    ///
    /// Views taken before the call never observe it; views taken after
    /// observe all of it. An empty batch is a no-op.
    pub fn write(&self, batch: &WriteBatch, mode: SyncMode) -> StoreResult<()> {
        self.shared.assert_open();
        self.shared.write(batch, mode)
    }

    /// Make every earlier buffered write durable.
    pub fn flush(&self) -> StoreResult<()> {
        self.shared.assert_open();
        self.shared.flush()
    }

    /// Take a read view of the latest state.
    pub fn snapshot(&self) -> StoreResult<Snapshot> {
        self.shared.assert_open();
        Snapshot::new(&self.shared)
    }

    /// Unpositioned cursor over `snapshot` or the latest state.
    pub fn iter(&self, snapshot: Option<&Snapshot>) -> DbIterator {
        let at = self.read_sequence(snapshot);
        DbIterator::new(&self.shared, at)
    }

    /// Lazy directional sequence starting at `prefix`.
    pub fn seek(
        &self,
        prefix: &[u8],
        direction: SeekDirection,
        snapshot: Option<&Snapshot>,
    ) -> Seek {
        Seek::new(self.iter(snapshot), prefix, direction)
    }

    /// Lazy ascending sequence over keys in `[start, end]`.
    pub fn find_range(&self, start: &[u8], end: &[u8], snapshot: Option<&Snapshot>) -> Range {
        Range::new(self.iter(snapshot), start, end)
    }

    /// Checkpoint the latest state and delete the log it supersedes.
    pub fn compact(&self) -> StoreResult<CompactionResult> {
        self.shared.assert_open();
        self.shared.run_compaction()
    }

    /// Current counters.
    pub fn stats(&self) -> EngineStats {
        self.shared.assert_open();
        let (live_keys, retained_versions, index_nodes) = {
            let index = self.shared.index.read();
            (index.live_len(), index.version_count(), index.node_count())
        };
        EngineStats {
            last_sequence: self.shared.snapshots.published(),
            live_keys,
            retained_versions,
            index_nodes,
            open_snapshots: self.shared.snapshots.open_snapshots(),
            log_bytes: self.shared.log_bytes_held(),
            checkpoints_written: self.shared.checkpoints_written.load(Ordering::Relaxed),
        }
    }

    /// Store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name of the installed comparator.
    pub fn comparator_name(&self) -> &str {
        self.shared.comparator.name()
    }

    /// Registry token of the installed comparator.
    pub fn comparator_token(&self) -> ComparatorToken {
        self.shared.comparator.token()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(path = %self.path.display(), error = %e, "Close on drop failed");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("path", &self.path)
            .field("comparator", &self.comparator_name())
            .field("closed", &self.is_closed())
            .finish()
    }
}
