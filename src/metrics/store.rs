//! Bounded store of length-prefixed snapshot records.
//!
//! Each record is an opaque blob (the collector hands it pre-serialized
//! bytes); the store only tracks count/byte caps and framing, deliberately
//! hand-rolled rather than reaching for a serialization crate since the
//! framing itself is a single length-prefix, not a format worth a
//! dependency.

use std::collections::VecDeque;

pub struct SnapshotStore {
    records: VecDeque<Vec<u8>>,
    total_bytes: usize,
    max_snapshots: usize,
    max_bytes: usize,
}

impl SnapshotStore {
    pub fn new(max_snapshots: usize, max_bytes: usize) -> Self {
        Self {
            records: VecDeque::new(),
            total_bytes: 0,
            max_snapshots: max_snapshots.max(1),
            max_bytes: max_bytes.max(1),
        }
    }

    /// Appends a record, evicting the oldest records first to stay under
    /// both caps. Rejects (returns `false`) a record that alone exceeds
    /// the byte cap rather than evicting everything else to make room.
    pub fn append(&mut self, record: &[u8]) -> bool {
        if record.len() > self.max_bytes {
            return false;
        }
        while self.records.len() >= self.max_snapshots
            || self.total_bytes + record.len() > self.max_bytes
        {
            let Some(evicted) = self.records.pop_front() else {
                break;
            };
            self.total_bytes = self.total_bytes.saturating_sub(evicted.len());
        }
        self.total_bytes += record.len();
        self.records.push_back(record.to_vec());
        true
    }

    /// Drains all records into a single length-prefixed (`u32` big-endian)
    /// buffer, oldest first.
    pub fn drain_framed(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes + self.records.len() * 4);
        for record in self.records.drain(..) {
            out.extend_from_slice(&(record.len() as u32).to_be_bytes());
            out.extend_from_slice(&record);
        }
        self.total_bytes = 0;
        out
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_record_larger_than_byte_cap() {
        let mut store = SnapshotStore::new(10, 4);
        assert!(!store.append(&[0u8; 5]));
        assert!(store.is_empty());
    }

    #[test]
    fn evicts_oldest_once_snapshot_count_cap_hit() {
        let mut store = SnapshotStore::new(2, 1024);
        assert!(store.append(b"a"));
        assert!(store.append(b"b"));
        assert!(store.append(b"c"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn drain_framed_round_trips_lengths() {
        let mut store = SnapshotStore::new(10, 1024);
        store.append(b"hi");
        store.append(b"there");
        let framed = store.drain_framed();
        assert_eq!(&framed[0..4], &2u32.to_be_bytes());
        assert_eq!(&framed[4..6], b"hi");
        assert_eq!(&framed[6..10], &5u32.to_be_bytes());
        assert_eq!(&framed[10..15], b"there");
        assert!(store.is_empty());
    }
}
