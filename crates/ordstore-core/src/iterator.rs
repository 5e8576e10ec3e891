//! Cursors and lazy sequences over a fixed read view.
//!
//! [`DbIterator`] is the positioning primitive. [`Seek`] and [`Range`] wrap
//! one and expose it as a standard `Iterator` of owned `(key, value)` pairs.
//!
//! Every iterator pins its own view when created, so later writes are never
//! observed, and takes the index read lock only for the duration of a single
//! positioning step. A step follows the stored node link unless a purge has
//! rebuilt the index since, in which case it re-seeks from the current key.

use std::cmp::Ordering;
use std::fmt;
use std::iter::FusedIterator;
use std::sync::Arc;

use crate::engine::Shared;
use crate::skiplist::SkipList;
use crate::snapshot::Pin;

/// Direction of a prefix seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekDirection {
    /// From the smallest key ≥ prefix, ascending
    #[default]
    Forward,
    /// From the largest key ≤ prefix, descending
    Backward,
}

struct Entry {
    node: usize,
    generation: u64,
    key: Vec<u8>,
    value: Vec<u8>,
}

fn entry_at(index: &SkipList, node: usize, value: &[u8]) -> Entry {
    Entry {
        node,
        generation: index.generation(),
        key: index.key(node).to_vec(),
        value: value.to_vec(),
    }
}

/// Node after `entry`, by link while the index is unchanged, else by key.
fn following(index: &SkipList, entry: &Entry) -> Option<usize> {
    if entry.generation == index.generation() {
        index.next(entry.node)
    } else {
        index.seek_after(&entry.key)
    }
}

/// First entry visible at `sequence` starting from `cursor`, walking forward.
fn settle_forward(index: &SkipList, mut cursor: Option<usize>, sequence: u64) -> Option<Entry> {
    while let Some(node) = cursor {
        if let Some(value) = index.value_at(node, sequence) {
            return Some(entry_at(index, node, value));
        }
        cursor = index.next(node);
    }
    None
}

/// Same, walking backward.
fn settle_backward(index: &SkipList, mut cursor: Option<usize>, sequence: u64) -> Option<Entry> {
    while let Some(node) = cursor {
        if let Some(value) = index.value_at(node, sequence) {
            return Some(entry_at(index, node, value));
        }
        cursor = index.seek_before(index.key(node));
    }
    None
}

/// Bidirectional cursor over one read view.
///
/// Starts unpositioned. Deleted keys and keys written after the view was
/// taken are skipped.
pub struct DbIterator {
    pin: Pin,
    current: Option<Entry>,
}

impl DbIterator {
    pub(crate) fn new(shared: &Arc<Shared>, at: Option<u64>) -> Self {
        shared.assert_open();
        Self {
            pin: Pin::internal(shared, at),
            current: None,
        }
    }

    /// Whether the cursor sits on an entry.
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Position at the first key.
    pub fn seek_to_first(&mut self) {
        let shared = self.pin.shared();
        shared.assert_open();
        let index = shared.index.read();
        self.current = settle_forward(&index, index.first(), self.pin.sequence());
    }

    /// Position at the last key.
    pub fn seek_to_last(&mut self) {
        let shared = self.pin.shared();
        shared.assert_open();
        let index = shared.index.read();
        self.current = settle_backward(&index, index.last(), self.pin.sequence());
    }

    /// Position at the smallest key ≥ `target`.
    pub fn seek(&mut self, target: &[u8]) {
        let shared = self.pin.shared();
        shared.assert_open();
        let index = shared.index.read();
        self.current = settle_forward(&index, index.seek(target), self.pin.sequence());
    }

    /// Advance to the following key.
    ///
    /// # Panics
    /// If the cursor is not valid.
    pub fn next(&mut self) {
        let entry = self.position();
        let shared = self.pin.shared();
        let index = shared.index.read();
        self.current = settle_forward(&index, following(&index, entry), self.pin.sequence());
    }

    /// Step back to the preceding key.
    ///
    /// # Panics
    /// If the cursor is not valid.
    pub fn prev(&mut self) {
        let entry = self.position();
        let shared = self.pin.shared();
        let index = shared.index.read();
        self.current = settle_backward(&index, index.seek_before(&entry.key), self.pin.sequence());
    }

    /// Key at the cursor.
    ///
    /// # Panics
    /// If the cursor is not valid.
    pub fn key(&self) -> &[u8] {
        &self.entry().key
    }

    /// Value at the cursor.
    ///
    /// # Panics
    /// If the cursor is not valid.
    pub fn value(&self) -> &[u8] {
        &self.entry().value
    }

    /// Sequence of the view this cursor reads.
    pub fn sequence(&self) -> u64 {
        self.pin.sequence()
    }

    fn entry(&self) -> &Entry {
        match &self.current {
            Some(entry) => entry,
            None => panic!("iterator is not positioned on an entry"),
        }
    }

    fn position(&self) -> &Entry {
        self.pin.shared().assert_open();
        self.entry()
    }

    /// Move the current pair out, leaving the cursor's node in place.
    fn take_pair(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.current
            .as_mut()
            .map(|entry| (entry.key.clone(), std::mem::take(&mut entry.value)))
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.pin.shared().comparator.compare(a, b)
    }
}

impl fmt::Debug for DbIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbIterator")
            .field("sequence", &self.pin.sequence())
            .field("valid", &self.valid())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Active,
    Done,
}

/// Lazy directional sequence returned by `Engine::seek`.
///
/// Forward yields every key ≥ the prefix in ascending order. Backward yields
/// every key ≤ the prefix in descending order. Nothing is positioned until
/// the first call to `next`.
#[derive(Debug)]
pub struct Seek {
    cursor: DbIterator,
    prefix: Vec<u8>,
    direction: SeekDirection,
    state: State,
}

impl Seek {
    pub(crate) fn new(cursor: DbIterator, prefix: &[u8], direction: SeekDirection) -> Self {
        Self {
            cursor,
            prefix: prefix.to_vec(),
            direction,
            state: State::Pending,
        }
    }

    fn position(&mut self) {
        self.cursor.seek(&self.prefix);
        if self.direction == SeekDirection::Backward {
            if !self.cursor.valid() {
                self.cursor.seek_to_last();
            } else if self.cursor.compare(self.cursor.key(), &self.prefix) == Ordering::Greater {
                self.cursor.prev();
            }
        }
    }
}

impl Iterator for Seek {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            State::Done => return None,
            State::Pending => {
                self.position();
                self.state = State::Active;
            }
            State::Active => match self.direction {
                SeekDirection::Forward => self.cursor.next(),
                SeekDirection::Backward => self.cursor.prev(),
            },
        }

        if !self.cursor.valid() {
            self.state = State::Done;
            return None;
        }
        self.cursor.take_pair()
    }
}

impl FusedIterator for Seek {}

/// Lazy ascending sequence over `[start, end]` returned by `Engine::find_range`.
#[derive(Debug)]
pub struct Range {
    cursor: DbIterator,
    start: Vec<u8>,
    end: Vec<u8>,
    state: State,
}

impl Range {
    pub(crate) fn new(cursor: DbIterator, start: &[u8], end: &[u8]) -> Self {
        Self {
            cursor,
            start: start.to_vec(),
            end: end.to_vec(),
            state: State::Pending,
        }
    }
}

impl Iterator for Range {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            State::Done => return None,
            State::Pending => {
                self.cursor.seek(&self.start);
                self.state = State::Active;
            }
            State::Active => self.cursor.next(),
        }

        if !self.cursor.valid()
            || self.cursor.compare(self.cursor.key(), &self.end) == Ordering::Greater
        {
            self.state = State::Done;
            return None;
        }
        self.cursor.take_pair()
    }
}

impl FusedIterator for Range {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{FnComparator, KeyComparator};
    use crate::config::{Options, SyncMode};
    use crate::engine::Engine;
    use tempfile::TempDir;

    fn engine_with(keys: &[&[u8]], options: Options) -> (Engine, TempDir) {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), options).unwrap();
        for key in keys {
            engine.put(key, &[key.len() as u8], SyncMode::Buffered).unwrap();
        }
        (engine, dir)
    }

    fn sample() -> (Engine, TempDir) {
        engine_with(&[b"a", b"aa", b"ab", b"b"], Options::default())
    }

    fn keys<I: Iterator<Item = (Vec<u8>, Vec<u8>)>>(iter: I) -> Vec<Vec<u8>> {
        iter.map(|(k, _)| k).collect()
    }

    fn v(keys: &[&[u8]]) -> Vec<Vec<u8>> {
        keys.iter().map(|k| k.to_vec()).collect()
    }

    #[test]
    fn test_cursor_walks_both_ways() {
        let (engine, _dir) = sample();
        let mut it = engine.iter(None);
        assert!(!it.valid());

        it.seek_to_first();
        assert_eq!(it.key(), b"a");
        it.next();
        assert_eq!(it.key(), b"aa");
        it.prev();
        assert_eq!(it.key(), b"a");
        it.prev();
        assert!(!it.valid());

        it.seek_to_last();
        assert_eq!(it.key(), b"b");
        assert_eq!(it.value(), &[1u8][..]);
        it.next();
        assert!(!it.valid());
    }

    #[test]
    fn test_cursor_skips_deleted_keys() {
        let (engine, _dir) = sample();
        engine.delete(b"aa", SyncMode::Buffered).unwrap();
        engine.delete(b"b", SyncMode::Buffered).unwrap();

        let mut it = engine.iter(None);
        it.seek(b"aa");
        assert_eq!(it.key(), b"ab");
        it.prev();
        assert_eq!(it.key(), b"a");

        it.seek_to_last();
        assert_eq!(it.key(), b"ab");
    }

    #[test]
    fn test_forward_seek() {
        let (engine, _dir) = sample();
        assert_eq!(
            keys(engine.seek(b"aa", SeekDirection::Forward, None)),
            v(&[b"aa", b"ab", b"b"])
        );
        assert_eq!(keys(engine.seek(b"aab", SeekDirection::Forward, None)), v(&[b"ab", b"b"]));
        assert!(engine.seek(b"c", SeekDirection::Forward, None).next().is_none());
    }

    #[test]
    fn test_backward_seek() {
        let (engine, _dir) = sample();
        // Exact hit starts at the prefix itself
        assert_eq!(
            keys(engine.seek(b"ab", SeekDirection::Backward, None)),
            v(&[b"ab", b"aa", b"a"])
        );
        // Between keys: the overshoot is stepped back
        assert_eq!(keys(engine.seek(b"aab", SeekDirection::Backward, None)), v(&[b"aa", b"a"]));
        // Past the end: starts from the last key
        assert_eq!(
            keys(engine.seek(b"z", SeekDirection::Backward, None)),
            v(&[b"b", b"ab", b"aa", b"a"])
        );
        // Before the first key: nothing
        assert!(engine.seek(b"", SeekDirection::Backward, None).next().is_none());
    }

    #[test]
    fn test_find_range_inclusive() {
        let (engine, _dir) = sample();
        assert_eq!(keys(engine.find_range(b"a", b"ab", None)), v(&[b"a", b"aa", b"ab"]));
        assert_eq!(keys(engine.find_range(b"aa", b"aa", None)), v(&[b"aa"]));
        assert!(engine.find_range(b"b", b"a", None).next().is_none());
    }

    #[test]
    fn test_sequences_are_lazy_and_fused() {
        let (engine, _dir) = sample();
        let mut seek = engine.seek(b"b", SeekDirection::Forward, None);

        // The view was pinned when the sequence was created
        engine.put(b"c", b"late", SyncMode::Buffered).unwrap();

        assert_eq!(seek.next().map(|(k, _)| k), Some(b"b".to_vec()));
        assert!(seek.next().is_none());
        assert!(seek.next().is_none());
    }

    #[test]
    fn test_iteration_reads_snapshot() {
        let (engine, _dir) = sample();
        let snap = engine.snapshot().unwrap();
        engine.delete(b"a", SyncMode::Buffered).unwrap();
        engine.put(b"ac", b"new", SyncMode::Buffered).unwrap();

        assert_eq!(
            keys(engine.find_range(b"a", b"b", Some(&snap))),
            v(&[b"a", b"aa", b"ab", b"b"])
        );
        assert_eq!(keys(engine.find_range(b"a", b"b", None)), v(&[b"aa", b"ab", b"ac", b"b"]));
    }

    #[test]
    fn test_iteration_continues_across_purge() {
        let (engine, _dir) = engine_with(&[b"a", b"b", b"c", b"d", b"e"], Options::default());
        let mut seek = engine.seek(b"", SeekDirection::Forward, None);
        assert_eq!(seek.next().map(|(k, _)| k), Some(b"a".to_vec()));
        assert_eq!(seek.next().map(|(k, _)| k), Some(b"b".to_vec()));

        // Rebuild the index under the open sequence
        engine.delete(b"c", SyncMode::Buffered).unwrap();
        engine.put(b"bb", b"late", SyncMode::Buffered).unwrap();
        engine.compact().unwrap();

        assert_eq!(keys(seek), v(&[b"c", b"d", b"e"]));

        let mut it = engine.iter(None);
        it.seek(b"d");
        engine.compact().unwrap();
        it.prev();
        assert_eq!(it.key(), b"bb");
        it.next();
        assert_eq!(it.key(), b"d");
    }

    #[test]
    fn test_reverse_comparator_inverts_order() {
        let reverse: Arc<dyn KeyComparator> =
            Arc::new(FnComparator::new("test.Reverse", |a: &[u8], b: &[u8]| b.cmp(a)));
        let (engine, _dir) =
            engine_with(&[b"a", b"aa", b"ab", b"b"], Options::default().with_comparator(reverse));

        // "z" sorts first under the reversed order
        assert_eq!(
            keys(engine.seek(b"z", SeekDirection::Forward, None)),
            v(&[b"b", b"ab", b"aa", b"a"])
        );
        // "Forward" from ab under the reversed order runs toward a
        assert_eq!(
            keys(engine.seek(b"ab", SeekDirection::Forward, None)),
            v(&[b"ab", b"aa", b"a"])
        );
        assert_eq!(
            keys(engine.seek(b"aa", SeekDirection::Backward, None)),
            v(&[b"aa", b"ab", b"b"])
        );
        assert_eq!(keys(engine.find_range(b"ab", b"a", None)), v(&[b"ab", b"aa", b"a"]));
    }
}
