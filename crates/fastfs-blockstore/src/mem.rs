//! In-memory LRU tier.
//!
//! Sits in front of the disk tier and evicts when full. Capacity is a
//! number of entries, not a byte budget — the combined store is sized by
//! block count (mirroring the disk arena's fixed slot count), so the two
//! tiers agree on what "full" means. Rust has no built-in intrusive list,
//! so recency is tracked with a monotonic sequence counter plus a
//! `BTreeMap` ordering index rather than a literal linked-list LRU.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use crate::BlockKey;

struct Entry {
    data: Bytes,
    seq: u64,
}

/// Bounded-capacity (by entry count) LRU cache of blocks.
pub struct MemTier {
    capacity_entries: usize,
    entries: HashMap<BlockKey, Entry>,
    order: BTreeMap<u64, BlockKey>,
    next_seq: u64,
}

impl MemTier {
    pub fn new(capacity_entries: usize) -> Self {
        Self {
            capacity_entries: capacity_entries.max(1),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn touch(&mut self, key: &BlockKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.seq);
            let seq = self.next_seq;
            self.next_seq += 1;
            entry.seq = seq;
            self.order.insert(seq, key.clone());
        }
    }

    /// Look up `key`, marking it most-recently-used on a hit.
    pub fn get(&mut self, key: &BlockKey) -> Option<Bytes> {
        let found = self.entries.get(key).map(|e| e.data.clone());
        if found.is_some() {
            self.touch(key);
        }
        found
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert `key`, evicting least-recently-used entries until the entry
    /// count is back within `capacity_entries`. Returns the evicted
    /// entries so the caller (the combined [`crate::BlockStore`]) can
    /// migrate them to the disk tier.
    pub fn put(&mut self, key: BlockKey, data: Bytes) -> Vec<(BlockKey, Bytes)> {
        let mut evicted = Vec::new();

        let is_new = if let Some(old) = self.entries.remove(&key) {
            self.order.remove(&old.seq);
            false
        } else {
            true
        };

        while is_new && self.entries.len() >= self.capacity_entries {
            let Some((&seq, _)) = self.order.iter().next() else {
                break;
            };
            let lru_key = self.order.remove(&seq).unwrap();
            if let Some(entry) = self.entries.remove(&lru_key) {
                evicted.push((lru_key, entry.data));
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key.clone(), Entry { data, seq });
        self.order.insert(seq, key);
        evicted
    }

    pub fn remove(&mut self, key: &BlockKey) -> Option<Bytes> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry.data)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every cached entry. Used by [`crate::BlockStore::clear`].
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> BlockKey {
        BlockKey::new(s.to_string(), 0)
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut tier = MemTier::new(2);
        assert!(tier.put(key("a"), Bytes::from_static(b"01234")).is_empty());
        assert!(tier.put(key("b"), Bytes::from_static(b"56789")).is_empty());
        // touch "a" so "b" becomes LRU
        assert!(tier.get(&key("a")).is_some());
        let evicted = tier.put(key("c"), Bytes::from_static(b"abcde"));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, key("b"));
        assert!(tier.contains(&key("a")));
        assert!(tier.contains(&key("c")));
        assert!(!tier.contains(&key("b")));
    }

    #[test]
    fn capacity_is_entry_count_not_byte_size() {
        let mut tier = MemTier::new(2);
        // Each value is a different size; capacity must still cap at 2
        // entries, not some byte budget.
        assert!(tier.put(key("a"), Bytes::from_static(b"x")).is_empty());
        assert!(tier
            .put(key("b"), Bytes::from_static(b"a much longer value than x"))
            .is_empty());
        let evicted = tier.put(key("c"), Bytes::from_static(b"z"));
        assert_eq!(evicted.len(), 1);
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn reinserting_same_key_does_not_evict() {
        let mut tier = MemTier::new(1);
        assert!(tier.put(key("a"), Bytes::from_static(b"hello")).is_empty());
        assert!(tier.put(key("a"), Bytes::from_static(b"world")).is_empty());
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn clear_empties_the_tier() {
        let mut tier = MemTier::new(4);
        tier.put(key("a"), Bytes::from_static(b"hello"));
        tier.put(key("b"), Bytes::from_static(b"world"));
        tier.clear();
        assert!(tier.is_empty());
        assert!(!tier.contains(&key("a")));
    }
}
