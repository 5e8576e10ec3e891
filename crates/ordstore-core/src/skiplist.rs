//! Multi-version skip list: the engine's ordered index.
//!
//! One node per user key, ordered by the installed comparator. Each node
//! keeps the versions of its key that some read view may still need, oldest
//! first. A version with no value is a tombstone.
//!
//! ```text
//! Level 2:  HEAD ──────────► "b" ──────────────────► NIL
//! Level 1:  HEAD ──► "a" ──► "b" ──────────► "d" ──► NIL
//! Level 0:  HEAD ──► "a" ──► "b" ──► "c" ──► "d" ──► NIL
//!                    [3]     [1,4]   [2,x5]  [6]      versions (seq, x = tombstone)
//! ```
//!
//! Nodes live in an arena and link to each other by index. Writes never
//! unlink a node; a key whose last version was pruned simply has no
//! versions. [`SkipList::purge`] prunes every key at once and rebuilds the
//! arena without the empty nodes, bumping the generation so holders of old
//! indices know to re-seek by key.

use std::cmp::Ordering;

use rand::Rng;

use crate::comparator::ComparatorBridge;

/// Maximum height of the skip list. LevelDB uses 12.
pub const MAX_HEIGHT: usize = 12;

/// Arena index of the head sentinel.
const HEAD: usize = 0;

#[derive(Debug, Clone)]
struct Version {
    sequence: u64,
    value: Option<Vec<u8>>,
}

struct Node {
    key: Vec<u8>,
    /// Ascending by sequence
    versions: Vec<Version>,
    next: Vec<Option<usize>>,
}

impl Node {
    fn is_live(&self) -> bool {
        matches!(self.versions.last(), Some(Version { value: Some(_), .. }))
    }

    fn visible_at(&self, sequence: u64) -> Option<&[u8]> {
        self.versions
            .iter()
            .rev()
            .find(|v| v.sequence <= sequence)
            .and_then(|v| v.value.as_deref())
    }
}

/// Drop versions no view at or above `oldest_pinned` can observe.
///
/// Keeps every version newer than `oldest_pinned` plus the newest one at or
/// below it, unless that one is a tombstone (absence needs no record).
fn prune(versions: &mut Vec<Version>, oldest_pinned: u64) -> usize {
    let Some(boundary) = versions.iter().rposition(|v| v.sequence <= oldest_pinned) else {
        return 0;
    };
    let cut = if versions[boundary].value.is_none() { boundary + 1 } else { boundary };
    versions.drain(..cut);
    cut
}

/// Comparator-ordered multi-version index.
///
/// Not synchronized; the engine wraps it in a `RwLock`.
pub struct SkipList {
    nodes: Vec<Node>,
    height: usize,
    cmp: ComparatorBridge,
    live: usize,
    versions: usize,
    /// Bumped by every purge; node indices from an older generation are stale
    generation: u64,
}

/// What a purge reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub versions_removed: usize,
    pub nodes_removed: usize,
}

impl SkipList {
    /// Create an empty list ordered by `cmp`.
    pub fn new(cmp: ComparatorBridge) -> Self {
        let head = Node {
            key: Vec::new(),
            versions: Vec::new(),
            next: vec![None; MAX_HEIGHT],
        };
        Self {
            nodes: vec![head],
            height: 1,
            cmp,
            live: 0,
            versions: 0,
            generation: 0,
        }
    }

    /// Record `value` (or a tombstone for `None`) for `key` at `sequence`.
    ///
    /// `sequence` must exceed every sequence inserted before. Versions older
    /// than what `oldest_pinned` can see are pruned from the key.
    pub fn insert(&mut self, key: &[u8], sequence: u64, value: Option<&[u8]>, oldest_pinned: u64) {
        let mut prev = [HEAD; MAX_HEIGHT];
        let found = self.find_greater_or_equal(key, Some(&mut prev));

        let existing =
            found.filter(|&i| self.cmp.compare(&self.nodes[i].key, key) == Ordering::Equal);
        if let Some(idx) = existing {
            let node = &mut self.nodes[idx];
            debug_assert!(node.versions.last().map_or(true, |v| v.sequence < sequence));
            let was_live = node.is_live();
            node.versions.push(Version {
                sequence,
                value: value.map(<[u8]>::to_vec),
            });
            let removed = prune(&mut node.versions, oldest_pinned);
            let is_live = node.is_live();

            self.versions = self.versions + 1 - removed;
            match (was_live, is_live) {
                (false, true) => self.live += 1,
                (true, false) => self.live -= 1,
                _ => {}
            }
            return;
        }

        // Deleting a key that was never present leaves nothing to record.
        let Some(value) = value else { return };

        let height = random_height();
        if height > self.height {
            // prev[] for the new levels is already HEAD
            self.height = height;
        }

        let idx = self.nodes.len();
        let next = (0..height).map(|level| self.nodes[prev[level]].next[level]).collect();
        self.nodes.push(Node {
            key: key.to_vec(),
            versions: vec![Version {
                sequence,
                value: Some(value.to_vec()),
            }],
            next,
        });
        for (level, &p) in prev.iter().enumerate().take(height) {
            self.nodes[p].next[level] = Some(idx);
        }
        self.live += 1;
        self.versions += 1;
    }

    /// Prune every key against `oldest_pinned` and drop nodes left empty.
    ///
    /// No view at or above `oldest_pinned` sees a difference. Node indices
    /// taken before the call are invalid afterwards; see [`generation`].
    ///
    /// [`generation`]: Self::generation
    pub fn purge(&mut self, oldest_pinned: u64) -> PurgeStats {
        let mut stats = PurgeStats::default();
        let mut kept = Vec::with_capacity(self.live);
        let mut cursor = self.first();
        while let Some(idx) = cursor {
            cursor = self.nodes[idx].next[0];
            let node = &mut self.nodes[idx];
            stats.versions_removed += prune(&mut node.versions, oldest_pinned);
            if node.versions.is_empty() {
                stats.nodes_removed += 1;
            } else {
                kept.push((std::mem::take(&mut node.key), std::mem::take(&mut node.versions)));
            }
        }

        // Rebuild in order: each node links behind the last one at its levels
        let mut nodes = Vec::with_capacity(kept.len() + 1);
        nodes.push(Node {
            key: Vec::new(),
            versions: Vec::new(),
            next: vec![None; MAX_HEIGHT],
        });
        let mut tails = [HEAD; MAX_HEIGHT];
        let mut top = 1;
        for (key, versions) in kept {
            let idx = nodes.len();
            let height = random_height();
            top = top.max(height);
            for (level, tail) in tails.iter_mut().enumerate().take(height) {
                nodes[*tail].next[level] = Some(idx);
                *tail = idx;
            }
            nodes.push(Node {
                key,
                versions,
                next: vec![None; height],
            });
        }
        self.nodes = nodes;
        self.height = top;
        self.live = self.nodes.iter().filter(|n| n.is_live()).count();
        self.versions = self.nodes.iter().map(|n| n.versions.len()).sum();
        self.generation += 1;
        stats
    }

    /// Arena generation; changes whenever node indices are invalidated.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// First node whose key is > `key`.
    pub fn seek_after(&self, key: &[u8]) -> Option<usize> {
        let idx = self.find_greater_or_equal(key, None)?;
        if self.cmp.compare(&self.nodes[idx].key, key) == Ordering::Equal {
            self.next(idx)
        } else {
            Some(idx)
        }
    }

    /// Value of `key` visible at `sequence`, `None` if absent or deleted.
    pub fn get(&self, key: &[u8], sequence: u64) -> Option<&[u8]> {
        let idx = self.find_greater_or_equal(key, None)?;
        if self.cmp.compare(&self.nodes[idx].key, key) != Ordering::Equal {
            return None;
        }
        self.nodes[idx].visible_at(sequence)
    }

    /// First node whose key is ≥ `key`.
    pub fn seek(&self, key: &[u8]) -> Option<usize> {
        self.find_greater_or_equal(key, None)
    }

    /// Last node whose key is < `key`.
    pub fn seek_before(&self, key: &[u8]) -> Option<usize> {
        let mut x = HEAD;
        let mut level = self.height - 1;
        loop {
            match self.nodes[x].next[level] {
                Some(n) if self.cmp.compare(&self.nodes[n].key, key) == Ordering::Less => x = n,
                _ if level == 0 => return (x != HEAD).then_some(x),
                _ => level -= 1,
            }
        }
    }

    /// First node in order.
    pub fn first(&self) -> Option<usize> {
        self.nodes[HEAD].next[0]
    }

    /// Last node in order.
    pub fn last(&self) -> Option<usize> {
        let mut x = HEAD;
        let mut level = self.height - 1;
        loop {
            match self.nodes[x].next[level] {
                Some(n) => x = n,
                None if level == 0 => return (x != HEAD).then_some(x),
                None => level -= 1,
            }
        }
    }

    /// Successor of node `idx`.
    pub fn next(&self, idx: usize) -> Option<usize> {
        self.nodes[idx].next[0]
    }

    /// Key of node `idx`.
    pub fn key(&self, idx: usize) -> &[u8] {
        &self.nodes[idx].key
    }

    /// Value of node `idx` visible at `sequence`.
    pub fn value_at(&self, idx: usize, sequence: u64) -> Option<&[u8]> {
        self.nodes[idx].visible_at(sequence)
    }

    /// Every key with a value at `sequence`, in order.
    pub fn live_entries(&self, sequence: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::with_capacity(self.live);
        let mut cursor = self.first();
        while let Some(idx) = cursor {
            if let Some(value) = self.value_at(idx, sequence) {
                out.push((self.nodes[idx].key.clone(), value.to_vec()));
            }
            cursor = self.next(idx);
        }
        out
    }

    /// Keys whose newest version holds a value.
    pub fn live_len(&self) -> usize {
        self.live
    }

    /// Versions retained across all keys.
    pub fn version_count(&self) -> usize {
        self.versions
    }

    /// Nodes linked into the list, including keys with no versions left.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - 1
    }

    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [usize; MAX_HEIGHT]>,
    ) -> Option<usize> {
        let mut x = HEAD;
        let mut level = self.height - 1;
        loop {
            let next = self.nodes[x].next[level];
            match next {
                Some(n) if self.cmp.compare(&self.nodes[n].key, key) == Ordering::Less => x = n,
                _ => {
                    if let Some(p) = prev.as_deref_mut() {
                        p[level] = x;
                    }
                    if level == 0 {
                        return next;
                    }
                    level -= 1;
                }
            }
        }
    }
}

/// Each extra level has a 1/4 chance.
fn random_height() -> usize {
    let mut rng = rand::thread_rng();
    let mut height = 1;
    while height < MAX_HEIGHT && rng.gen_range(0..4) == 0 {
        height += 1;
    }
    height
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::FnComparator;
    use std::sync::Arc;

    fn keys(list: &SkipList, sequence: u64) -> Vec<Vec<u8>> {
        list.live_entries(sequence).into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn test_insert_and_get() {
        let mut list = SkipList::new(ComparatorBridge::bytewise());
        list.insert(b"b", 1, Some(b"2"), 0);
        list.insert(b"a", 2, Some(b"1"), 1);
        list.insert(b"c", 3, Some(b"3"), 2);

        assert_eq!(list.get(b"a", 3), Some(&b"1"[..]));
        assert_eq!(list.get(b"zz", 3), None);
        assert_eq!(keys(&list, 3), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(list.live_len(), 3);
    }

    #[test]
    fn test_versions_visible_by_sequence() {
        let mut list = SkipList::new(ComparatorBridge::bytewise());
        list.insert(b"k", 1, Some(b"v1"), 0);
        // A view pinned at 1 keeps v1 alive
        list.insert(b"k", 2, Some(b"v2"), 1);
        list.insert(b"k", 3, None, 1);

        assert_eq!(list.get(b"k", 1), Some(&b"v1"[..]));
        assert_eq!(list.get(b"k", 2), Some(&b"v2"[..]));
        assert_eq!(list.get(b"k", 3), None);
        assert_eq!(list.live_len(), 0);
    }

    #[test]
    fn test_prune_drops_unreachable_versions() {
        let mut list = SkipList::new(ComparatorBridge::bytewise());
        for seq in 1..=10 {
            list.insert(b"k", seq, Some(b"v"), seq - 1);
        }
        // Only the version at 9 (seen by 9) and the new one at 10 remain
        assert_eq!(list.version_count(), 2);

        list.insert(b"k", 11, None, 11);
        assert_eq!(list.version_count(), 0);
        assert_eq!(list.get(b"k", 11), None);
    }

    #[test]
    fn test_delete_of_missing_key_adds_nothing() {
        let mut list = SkipList::new(ComparatorBridge::bytewise());
        list.insert(b"ghost", 1, None, 0);
        assert_eq!(list.node_count(), 0);
        assert_eq!(list.first(), None);
    }

    #[test]
    fn test_purge_drops_dead_nodes() {
        let mut list = SkipList::new(ComparatorBridge::bytewise());
        for i in 0..100u64 {
            list.insert(&i.to_be_bytes(), i + 1, Some(b"v"), i);
        }
        // A view pinned at 100 keeps every value while the keys are deleted
        for i in 0..100u64 {
            list.insert(&i.to_be_bytes(), 101 + i, None, 100);
        }
        list.insert(b"survivor", 201, Some(b"s"), 100);
        assert_eq!(list.version_count(), 201);
        assert_eq!(list.node_count(), 101);

        let generation = list.generation();
        let stats = list.purge(201);
        assert_eq!(stats, PurgeStats {
            versions_removed: 200,
            nodes_removed: 100,
        });
        assert_eq!(list.node_count(), 1);
        assert_eq!(list.version_count(), 1);
        assert_eq!(list.live_len(), 1);
        assert_ne!(list.generation(), generation);
        assert_eq!(list.key(list.first().unwrap()), b"survivor");
    }

    #[test]
    fn test_purge_keeps_pinned_versions_and_order() {
        let mut list = SkipList::new(ComparatorBridge::bytewise());
        let mut rng = rand::thread_rng();
        let mut expected = std::collections::BTreeSet::new();
        let doomed: &[u8] = b"";
        list.insert(doomed, 1, Some(b"v"), 0);
        for seq in 2..=500u64 {
            let key: Vec<u8> = (0..rng.gen_range(1..6)).map(|_| rng.gen()).collect();
            list.insert(&key, seq, Some(b"v"), 0);
            expected.insert(key);
        }
        list.insert(doomed, 501, None, 0);

        // A view at 250 still needs the old value of the deleted key
        list.purge(250);
        assert_eq!(list.get(doomed, 250), Some(&b"v"[..]));
        assert_eq!(list.get(doomed, 501), None);
        assert_eq!(keys(&list, 501), expected.iter().cloned().collect::<Vec<_>>());
        // Navigation still works at every level after the rebuild
        for key in &expected {
            assert_eq!(list.get(key, 501), Some(&b"v"[..]));
        }
    }

    #[test]
    fn test_seek_after() {
        let mut list = SkipList::new(ComparatorBridge::bytewise());
        list.insert(b"a", 1, Some(b""), 0);
        list.insert(b"c", 2, Some(b""), 1);
        assert_eq!(list.key(list.seek_after(b"a").unwrap()), b"c");
        assert_eq!(list.key(list.seek_after(b"b").unwrap()), b"c");
        assert_eq!(list.seek_after(b"c"), None);
    }

    #[test]
    fn test_seek_and_neighbours() {
        let mut list = SkipList::new(ComparatorBridge::bytewise());
        let sorted: [&[u8]; 4] = [b"a", b"aa", b"ab", b"b"];
        for (seq, key) in sorted.iter().enumerate() {
            list.insert(key, seq as u64 + 1, Some(b""), seq as u64);
        }

        let at = list.seek(b"aa").unwrap();
        assert_eq!(list.key(at), b"aa");
        assert_eq!(list.key(list.seek(b"aab").unwrap()), b"ab");
        assert_eq!(list.seek(b"c"), None);

        assert_eq!(list.key(list.seek_before(b"ab").unwrap()), b"aa");
        assert_eq!(list.seek_before(b"a"), None);
        assert_eq!(list.key(list.last().unwrap()), b"b");
        assert_eq!(list.key(list.first().unwrap()), b"a");
    }

    #[test]
    fn test_custom_comparator_orders_nodes() {
        let reverse = ComparatorBridge::install(Arc::new(FnComparator::new(
            "test.Reverse",
            |a: &[u8], b: &[u8]| b.cmp(a),
        )))
        .unwrap();
        let mut list = SkipList::new(reverse.clone());
        for (seq, key) in [b"a", b"c", b"b"].iter().enumerate() {
            list.insert(*key, seq as u64 + 1, Some(b"x"), seq as u64);
        }
        assert_eq!(keys(&list, 3), vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
        reverse.release();
    }

    #[test]
    fn test_many_random_keys_stay_sorted() {
        let mut rng = rand::thread_rng();
        let mut list = SkipList::new(ComparatorBridge::bytewise());
        let mut expected = std::collections::BTreeSet::new();
        for seq in 1..=2000u64 {
            let key: Vec<u8> = (0..rng.gen_range(1..8)).map(|_| rng.gen()).collect();
            list.insert(&key, seq, Some(b"v"), seq - 1);
            expected.insert(key);
        }
        assert_eq!(keys(&list, u64::MAX), expected.into_iter().collect::<Vec<_>>());
    }
}
