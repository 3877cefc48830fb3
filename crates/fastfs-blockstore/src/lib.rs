//! Two-tier block cache: a bounded in-memory LRU in front of an mmap-backed
//! disk arena, fronting the object store.
//!
//! Reads check memory first, fall back to disk, and promote on hit; writes
//! land in memory and spill to disk only on eviction. The disk tier's
//! writes are asynchronous: a spill enqueues onto a bounded channel drained
//! by a single background task, so a burst of evictions applies
//! backpressure to callers instead of piling up arbitrarily many pending
//! mmap writes in memory.

mod arena;
mod mem;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use arena::{Arena, ArenaSlot};
use mem::MemTier;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("disk arena is full")]
    OutOfSlots,
    #[error("block of {len} bytes does not fit in a {slot_size}-byte slot")]
    BlockTooLarge { len: usize, slot_size: usize },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Identifies a single cached block: a file path plus block index. Kept
/// structured here instead of pre-formatted so the store never pays a
/// string-allocation cost on the hot path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub path: String,
    pub block: u64,
}

impl BlockKey {
    pub fn new(path: String, block: u64) -> Self {
        Self { path, block }
    }
}

/// Point-in-time counters for the two tiers.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub mem_len: usize,
    pub disk_len: usize,
    pub mem_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
}

/// Configuration for a [`BlockStore`]. Both tiers are sized by entry count:
/// the memory tier directly, the disk tier by way of `disk_num_slots`
/// (every slot is a potential entry).
#[derive(Debug, Clone)]
pub struct BlockStoreConfig {
    pub mem_capacity_entries: usize,
    pub disk_slot_size: usize,
    pub disk_num_slots: u32,
}

enum DiskState {
    /// Indexed, slot reserved, bytes not yet durably written to the arena.
    /// `get` can still serve straight out of this buffer.
    Pending(Bytes),
    /// Durably written; reads go through the arena mmap.
    Written,
}

struct DiskEntry {
    slot: ArenaSlot,
    state: RwLock<DiskState>,
    seq: AtomicU64,
}

struct DiskIndex {
    order: BTreeMap<u64, BlockKey>,
    entries: HashMap<BlockKey, Arc<DiskEntry>>,
    next_seq: u64,
}

impl DiskIndex {
    fn touch(&mut self, key: &BlockKey, entry: &Arc<DiskEntry>) {
        let old_seq = entry.seq.load(Ordering::Relaxed);
        self.order.remove(&old_seq);
        let seq = self.next_seq;
        self.next_seq += 1;
        entry.seq.store(seq, Ordering::Relaxed);
        self.order.insert(seq, key.clone());
    }
}

enum WriteJob {
    Write(ArenaSlot, Bytes, Arc<DiskEntry>),
    Free(ArenaSlot),
}

const WRITER_QUEUE_DEPTH: usize = 64;

/// Disk tier: a raw-slot [`Arena`] plus the key bookkeeping the arena
/// itself doesn't do. Two independent lock levels: the tier-level `index`
/// `RwLock` guards the key-to-slot map and LRU order (held only for short,
/// non-blocking critical sections), while each entry's volatile state
/// (buffered vs durably written) lives behind its own per-entry `RwLock`,
/// so a slow arena write for one key never blocks a lookup of another.
/// Actual mmap writes happen on a background task fed by a bounded channel
/// shared by both `Write` and `Free` jobs — ordering them on one queue
/// guarantees a slot is never freed before its pending write has landed.
struct DiskTier {
    arena: Arc<Arena>,
    index: RwLock<DiskIndex>,
    capacity: usize,
    writer: mpsc::Sender<WriteJob>,
}

impl DiskTier {
    fn new(arena: Arena) -> Self {
        let capacity = arena.capacity() as usize;
        let arena = Arc::new(arena);
        let (tx, mut rx) = mpsc::channel::<WriteJob>(WRITER_QUEUE_DEPTH);

        let writer_arena = arena.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    WriteJob::Write(slot, data, entry) => {
                        if let Err(e) = writer_arena.write_slot(slot, &data) {
                            warn!(error = %e, "disk arena write failed");
                            continue;
                        }
                        let mut state = entry.state.write().await;
                        *state = DiskState::Written;
                    }
                    WriteJob::Free(slot) => writer_arena.free(slot),
                }
            }
        });

        Self {
            arena,
            index: RwLock::new(DiskIndex {
                order: BTreeMap::new(),
                entries: HashMap::new(),
                next_seq: 0,
            }),
            capacity,
            writer: tx,
        }
    }

    async fn get(&self, key: &BlockKey, len: usize) -> Option<Bytes> {
        let entry = {
            let mut index = self.index.write().await;
            let entry = index.entries.get(key)?.clone();
            index.touch(key, &entry);
            entry
        };
        let state = entry.state.read().await;
        match &*state {
            DiskState::Pending(data) => Some(data.clone()),
            DiskState::Written => Some(self.arena.read_slot(entry.slot, len)),
        }
    }

    /// Insert `key`, evicting least-recently-used entries (freeing their
    /// slots) until there is room. Backpressure comes from the bounded
    /// writer channel: if the background task is behind, this send waits.
    async fn put(&self, key: BlockKey, data: Bytes) -> Result<()> {
        let slot = self.arena.allocate()?;

        let mut freed_slots = Vec::new();
        let entry = {
            let mut index = self.index.write().await;
            if let Some(old) = index.entries.remove(&key) {
                index.order.remove(&old.seq.load(Ordering::Relaxed));
                freed_slots.push(old.slot);
            }
            while index.entries.len() >= self.capacity {
                let Some((&seq, _)) = index.order.iter().next() else {
                    break;
                };
                let lru_key = index.order.remove(&seq).unwrap();
                if let Some(old) = index.entries.remove(&lru_key) {
                    freed_slots.push(old.slot);
                }
            }
            let seq = index.next_seq;
            index.next_seq += 1;
            let entry = Arc::new(DiskEntry {
                slot,
                state: RwLock::new(DiskState::Pending(data.clone())),
                seq: AtomicU64::new(seq),
            });
            index.order.insert(seq, key.clone());
            index.entries.insert(key, entry.clone());
            entry
        };

        self.writer
            .send(WriteJob::Write(slot, data, entry))
            .await
            .ok();
        for freed in freed_slots {
            self.writer.send(WriteJob::Free(freed)).await.ok();
        }
        Ok(())
    }

    async fn remove(&self, key: &BlockKey) {
        let slot = {
            let mut index = self.index.write().await;
            index.entries.remove(key).map(|e| {
                index.order.remove(&e.seq.load(Ordering::Relaxed));
                e.slot
            })
        };
        if let Some(slot) = slot {
            self.writer.send(WriteJob::Free(slot)).await.ok();
        }
    }

    async fn len(&self) -> usize {
        self.index.read().await.entries.len()
    }

    async fn clear(&self) {
        let mut index = self.index.write().await;
        for (_, entry) in index.entries.drain() {
            self.writer.send(WriteJob::Free(entry.slot)).await.ok();
        }
        index.order.clear();
    }
}

struct Mem {
    tier: MemTier,
}

/// The two-tier cache. Cheaply cloneable; clones share the same tiers.
#[derive(Clone)]
pub struct BlockStore {
    mem: Arc<Mutex<Mem>>,
    disk: Arc<DiskTier>,
    stats: Arc<Mutex<Stats>>,
}

impl BlockStore {
    pub fn open(arena_path: &Path, config: BlockStoreConfig) -> Result<Self> {
        let disk = Arena::create(arena_path, config.disk_slot_size, config.disk_num_slots)?;
        let mem = MemTier::new(config.mem_capacity_entries);
        Ok(Self {
            mem: Arc::new(Mutex::new(Mem { tier: mem })),
            disk: Arc::new(DiskTier::new(disk)),
            stats: Arc::new(Mutex::new(Stats::default())),
        })
    }

    /// Read a block, checking memory then disk. A disk hit is promoted back
    /// into the memory tier. The arena stores fixed-size slots, not
    /// lengths, so `len` must come from the caller's own knowledge of the
    /// block size (fixed per file).
    pub async fn get_with_len(&self, key: &BlockKey, len: usize) -> Option<Bytes> {
        {
            let mut mem = self.mem.lock().await;
            if let Some(data) = mem.tier.get(key) {
                self.stats.lock().await.mem_hits += 1;
                return Some(data);
            }
        }

        if let Some(data) = self.disk.get(key, len).await {
            self.stats.lock().await.disk_hits += 1;
            let evicted = {
                let mut mem = self.mem.lock().await;
                mem.tier.put(key.clone(), data.clone())
            };
            for (ev_key, ev_data) in evicted {
                if let Err(e) = self.disk.put(ev_key.clone(), ev_data).await {
                    debug!(?ev_key, error = %e, "failed to spill evicted block to disk");
                }
            }
            self.disk.remove(key).await;
            return Some(data);
        }

        self.stats.lock().await.misses += 1;
        None
    }

    /// Write a block. New writes always land in the memory tier; any block
    /// evicted to make room is spilled to the disk arena.
    pub async fn put(&self, key: BlockKey, data: Bytes) -> Result<()> {
        let evicted = {
            let mut mem = self.mem.lock().await;
            mem.tier.put(key, data)
        };
        for (ev_key, ev_data) in evicted {
            self.disk.put(ev_key, ev_data).await?;
        }
        Ok(())
    }

    /// Remove a block from both tiers (used when a block is known stale,
    /// e.g. after a failed upload confirm).
    pub async fn invalidate(&self, key: &BlockKey) {
        self.mem.lock().await.tier.remove(key);
        self.disk.remove(key).await;
    }

    /// Drop every entry from both tiers.
    pub async fn clear(&self) {
        self.mem.lock().await.tier.clear();
        self.disk.clear().await;
        *self.stats.lock().await = Stats::default();
    }

    pub async fn stats(&self) -> Stats {
        let mem_len = self.mem.lock().await.tier.len();
        let disk_len = self.disk.len().await;
        Stats {
            mem_len,
            disk_len,
            ..self.stats.lock().await.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BlockStoreConfig {
        BlockStoreConfig {
            mem_capacity_entries: 2,
            disk_slot_size: 32,
            disk_num_slots: 4,
        }
    }

    #[tokio::test]
    async fn put_then_get_hits_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(&dir.path().join("arena.bin"), cfg()).unwrap();
        let key = BlockKey::new("f".into(), 0);
        store.put(key.clone(), Bytes::from_static(b"hello")).await.unwrap();
        let got = store.get_with_len(&key, 5).await.unwrap();
        assert_eq!(&got[..], b"hello");
        let stats = store.stats().await;
        assert_eq!(stats.mem_hits, 1);
    }

    #[tokio::test]
    async fn eviction_spills_to_disk_and_is_retrievable() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(&dir.path().join("arena.bin"), cfg()).unwrap();
        let k0 = BlockKey::new("f".into(), 0);
        let k1 = BlockKey::new("f".into(), 1);
        let k2 = BlockKey::new("f".into(), 2);

        store.put(k0.clone(), Bytes::from_static(b"0123456789")).await.unwrap();
        store.put(k1.clone(), Bytes::from_static(b"abcdefghij")).await.unwrap();
        // mem capacity is 2 entries; this third put evicts k0 to disk.
        store.put(k2.clone(), Bytes::from_static(b"klmnopqrst")).await.unwrap();

        let got = store.get_with_len(&k0, 10).await.unwrap();
        assert_eq!(&got[..], b"0123456789");
        let stats = store.stats().await;
        assert_eq!(stats.disk_hits, 1);
    }

    #[tokio::test]
    async fn missing_block_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(&dir.path().join("arena.bin"), cfg()).unwrap();
        let key = BlockKey::new("missing".into(), 0);
        assert!(store.get_with_len(&key, 4).await.is_none());
        assert_eq!(store.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn clear_drops_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(&dir.path().join("arena.bin"), cfg()).unwrap();
        let k0 = BlockKey::new("f".into(), 0);
        let k1 = BlockKey::new("f".into(), 1);
        let k2 = BlockKey::new("f".into(), 2);
        store.put(k0.clone(), Bytes::from_static(b"0123456789")).await.unwrap();
        store.put(k1.clone(), Bytes::from_static(b"abcdefghij")).await.unwrap();
        store.put(k2.clone(), Bytes::from_static(b"klmnopqrst")).await.unwrap();

        store.clear().await;

        assert!(store.get_with_len(&k0, 10).await.is_none());
        assert!(store.get_with_len(&k1, 10).await.is_none());
        assert!(store.get_with_len(&k2, 10).await.is_none());
        let stats = store.stats().await;
        assert_eq!(stats.mem_len, 0);
        assert_eq!(stats.disk_len, 0);
    }

    #[tokio::test]
    async fn disk_capacity_is_entry_count_not_bytes() {
        let dir = tempfile::tempdir().unwrap();
        // mem capacity 1 forces every put after the first straight to
        // disk; disk has only 2 slots, so a fourth distinct key must
        // evict the oldest disk entry (k0) too.
        let store = BlockStore::open(
            &dir.path().join("arena.bin"),
            BlockStoreConfig {
                mem_capacity_entries: 1,
                disk_slot_size: 8,
                disk_num_slots: 2,
            },
        )
        .unwrap();
        let k0 = BlockKey::new("f".into(), 0);
        let k1 = BlockKey::new("f".into(), 1);
        let k2 = BlockKey::new("f".into(), 2);
        let k3 = BlockKey::new("f".into(), 3);
        store.put(k0.clone(), Bytes::from_static(b"aaaaaaaa")).await.unwrap();
        store.put(k1.clone(), Bytes::from_static(b"bbbbbbbb")).await.unwrap();
        store.put(k2.clone(), Bytes::from_static(b"cccccccc")).await.unwrap();
        store.put(k3.clone(), Bytes::from_static(b"dddddddd")).await.unwrap();
        // k0 should have been evicted from disk by now; give the
        // background writer a moment to catch up.
        tokio::task::yield_now().await;
        assert!(store.get_with_len(&k0, 8).await.is_none());
        assert!(store.get_with_len(&k2, 8).await.is_some());
    }
}
