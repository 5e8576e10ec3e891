//! Write batches: ordered mutations committed as one unit.
//!
//! Operations are kept in call order. When a batch touches the same key more
//! than once the later operation wins, because each operation is given the
//! next sequence number at commit time.

use crate::format::Operation;

/// A single buffered mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite `key`
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Remove `key`
    Delete { key: Vec<u8> },
}

impl BatchOp {
    /// The key this operation targets.
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }

    /// The value written, `None` for deletes.
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            BatchOp::Put { value, .. } => Some(value),
            BatchOp::Delete { .. } => None,
        }
    }

    /// Log operation tag.
    pub fn operation(&self) -> Operation {
        match self {
            BatchOp::Put { .. } => Operation::Put,
            BatchOp::Delete { .. } => Operation::Delete,
        }
    }
}

/// Ordered set of puts and deletes applied atomically by `Engine::write`.
///
/// Not synchronized: a batch has one owner. The engine only borrows it on
/// commit, so it can be cleared and reused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    approximate_size: usize,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a put.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.approximate_size += key.len() + value.len();
        self.ops.push(BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        self
    }

    /// Append a delete.
    pub fn delete(&mut self, key: &[u8]) -> &mut Self {
        self.approximate_size += key.len();
        self.ops.push(BatchOp::Delete { key: key.to_vec() });
        self
    }

    /// Append every operation of `other`, after this batch's own.
    pub fn append(&mut self, other: WriteBatch) -> &mut Self {
        self.approximate_size += other.approximate_size;
        self.ops.extend(other.ops);
        self
    }

    /// Drop all buffered operations.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.approximate_size = 0;
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when no operation is buffered.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Sum of key and value bytes buffered.
    pub fn approximate_size(&self) -> usize {
        self.approximate_size
    }

    /// Operations in call order.
    pub fn iter(&self) -> std::slice::Iter<'_, BatchOp> {
        self.ops.iter()
    }

    pub(crate) fn push(&mut self, op: BatchOp) {
        self.approximate_size += op.key().len() + op.value().map_or(0, <[u8]>::len);
        self.ops.push(op);
    }
}

impl<'a> IntoIterator for &'a WriteBatch {
    type Item = &'a BatchOp;
    type IntoIter = std::slice::Iter<'a, BatchOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ops_kept_in_call_order() {
        let mut batch = WriteBatch::new();
        batch.put(b"A", b"1").delete(b"B").put(b"A", b"2");

        let ops: Vec<_> = batch.iter().cloned().collect();
        assert_eq!(
            ops,
            vec![
                BatchOp::Put {
                    key: b"A".to_vec(),
                    value: b"1".to_vec(),
                },
                BatchOp::Delete { key: b"B".to_vec() },
                BatchOp::Put {
                    key: b"A".to_vec(),
                    value: b"2".to_vec(),
                },
            ]
        );
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.approximate_size(), 5);
    }

    #[test]
    fn test_append_and_clear() {
        let mut a = WriteBatch::new();
        a.put(b"k1", b"v1");
        let mut b = WriteBatch::new();
        b.delete(b"k2");

        a.append(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.iter().nth(1).unwrap().operation(), Operation::Delete);

        a.clear();
        assert!(a.is_empty());
        assert_eq!(a.approximate_size(), 0);
    }

    #[test]
    fn test_op_accessors() {
        let put = BatchOp::Put {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        };
        assert_eq!(put.key(), b"k");
        assert_eq!(put.value(), Some(&b"v"[..]));

        let del = BatchOp::Delete { key: b"k".to_vec() };
        assert_eq!(del.value(), None);
        assert_eq!(del.operation(), Operation::Delete);
    }
}
