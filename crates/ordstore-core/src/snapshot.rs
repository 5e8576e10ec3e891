//! Read views: pinned sequence numbers.
//!
//! A view is the last published sequence at the moment it was taken. While
//! it is registered here, the index keeps every version that view can see.
//! Taking a view reads and pins the sequence under one short mutex, so it
//! never waits on a writer applying a batch.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::Shared;
use crate::error::{StoreError, StoreResult};

struct Pins {
    /// sequence -> number of views pinned at it
    by_sequence: BTreeMap<u64, usize>,
    /// Views handed out to callers (iterator-internal pins excluded)
    open_snapshots: usize,
    published: u64,
}

/// Tracks pinned sequences and the last published one.
pub(crate) struct SnapshotRegistry {
    pins: Mutex<Pins>,
    /// Mirror of `Pins::published` for readers that pin nothing
    published: AtomicU64,
    limit: usize,
}

impl SnapshotRegistry {
    pub(crate) fn new(published: u64, limit: usize) -> Self {
        Self {
            pins: Mutex::new(Pins {
                by_sequence: BTreeMap::new(),
                open_snapshots: 0,
                published,
            }),
            published: AtomicU64::new(published),
            limit,
        }
    }

    /// Last sequence applied to the index.
    pub(crate) fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Make `sequence` visible to new reads. Called with the index write lock held.
    pub(crate) fn publish(&self, sequence: u64) {
        let mut pins = self.pins.lock();
        debug_assert!(sequence >= pins.published);
        pins.published = sequence;
        self.published.store(sequence, Ordering::Release);
    }

    /// Oldest sequence any current or future view can be pinned at.
    pub(crate) fn oldest_pinned(&self) -> u64 {
        let pins = self.pins.lock();
        pins.by_sequence
            .keys()
            .next()
            .map_or(pins.published, |&oldest| oldest.min(pins.published))
    }

    /// Pin the published sequence for a caller snapshot, subject to the limit.
    fn pin_snapshot(&self) -> StoreResult<u64> {
        let mut pins = self.pins.lock();
        if pins.open_snapshots >= self.limit {
            tracing::debug!(
                open = pins.open_snapshots,
                limit = self.limit,
                "Snapshot request rejected"
            );
            return Err(StoreError::SnapshotLimitExceeded {
                open: pins.open_snapshots,
                limit: self.limit,
            });
        }
        pins.open_snapshots += 1;
        let sequence = pins.published;
        *pins.by_sequence.entry(sequence).or_insert(0) += 1;
        Ok(sequence)
    }

    /// Pin `at`, or the published sequence when `None`. Not limited.
    ///
    /// `at` must already be pinned by a live view.
    fn pin_internal(&self, at: Option<u64>) -> u64 {
        let mut pins = self.pins.lock();
        let sequence = at.unwrap_or(pins.published);
        *pins.by_sequence.entry(sequence).or_insert(0) += 1;
        sequence
    }

    fn unpin(&self, sequence: u64, counted: bool) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.by_sequence.get_mut(&sequence) {
            *count -= 1;
            if *count == 0 {
                pins.by_sequence.remove(&sequence);
            }
        }
        if counted {
            pins.open_snapshots -= 1;
        }
    }

    /// Caller snapshots currently open.
    pub(crate) fn open_snapshots(&self) -> usize {
        self.pins.lock().open_snapshots
    }
}

/// One registered pin, removed on drop.
pub(crate) struct Pin {
    sequence: u64,
    counted: bool,
    shared: Arc<Shared>,
}

impl Pin {
    /// Pin for a caller snapshot.
    pub(crate) fn snapshot(shared: &Arc<Shared>) -> StoreResult<Self> {
        let sequence = shared.snapshots.pin_snapshot()?;
        Ok(Self {
            sequence,
            counted: true,
            shared: Arc::clone(shared),
        })
    }

    /// Pin owned by an iterator: at `at` if it reads through a snapshot,
    /// otherwise at the latest state.
    pub(crate) fn internal(shared: &Arc<Shared>, at: Option<u64>) -> Self {
        let sequence = shared.snapshots.pin_internal(at);
        Self {
            sequence,
            counted: false,
            shared: Arc::clone(shared),
        }
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.shared.snapshots.unpin(self.sequence, self.counted);
    }
}

/// An immutable point-in-time view of an engine.
///
/// Reads through a snapshot return the same answers for its whole life,
/// whatever is written afterwards. Dropping it releases the view. A snapshot
/// may outlive its engine's `close`, but every read through it afterwards
/// panics.
pub struct Snapshot {
    pin: Pin,
}

impl Snapshot {
    pub(crate) fn new(shared: &Arc<Shared>) -> StoreResult<Self> {
        Ok(Self {
            pin: Pin::snapshot(shared)?,
        })
    }

    /// Sequence number this view observes.
    pub fn sequence(&self) -> u64 {
        self.pin.sequence()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        self.pin.shared()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("sequence", &self.sequence()).finish()
    }
}
