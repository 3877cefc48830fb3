//! Fixed-slot, memory-mapped disk arena: raw slot storage for the disk
//! tier of the block store.
//!
//! A fixed-slot arena over a memory-mapped file: a free-list plus monotonic
//! `next_id` allocation over a set of on-disk slots, backed by
//! `memmap2::MmapMut` over a pre-sized `File`. The arena itself has no idea
//! which `BlockKey` owns a slot — that bookkeeping, and the LRU over it,
//! lives one layer up in [`crate::DiskTier`], matching the split the
//! two-tier store keeps between "where are the bytes" and "which key owns
//! which slot."

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use bytes::Bytes;
use memmap2::MmapMut;

use crate::StoreError;

/// An allocated position in the arena file.
pub type ArenaSlot = u32;

struct AllocState {
    free_list: Vec<ArenaSlot>,
    next_id: ArenaSlot,
}

/// Fixed-size-slot backing store. Every slot is exactly `slot_size` bytes;
/// blocks smaller than a slot simply don't use the tail of it, blocks larger
/// than a slot are rejected with [`StoreError::BlockTooLarge`] rather than
/// silently truncated — the arena never resizes a slot.
///
/// `write_slot`/`read_slot` take `&self`: allocation bookkeeping is guarded
/// by a short-lived `std::sync::Mutex`, but the mmap itself is addressed by
/// disjoint, slot-aligned byte ranges, so concurrent writers/readers of
/// different slots never touch the same bytes.
pub struct Arena {
    _file: File,
    mmap: MmapMut,
    slot_size: usize,
    num_slots: u32,
    alloc: Mutex<AllocState>,
}

// Safety: every accessor only ever touches the byte range belonging to the
// slot it was handed, and slot ranges never overlap.
unsafe impl Sync for Arena {}

impl Arena {
    /// Create (or truncate) an arena file at `path` sized for `num_slots`
    /// slots of `slot_size` bytes each.
    pub fn create(path: &Path, slot_size: usize, num_slots: u32) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let total_len = slot_size as u64 * num_slots as u64;
        file.set_len(total_len)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            _file: file,
            mmap,
            slot_size,
            num_slots,
            alloc: Mutex::new(AllocState {
                free_list: Vec::new(),
                next_id: 0,
            }),
        })
    }

    /// Reserve a slot, from the free list if one is available, else by
    /// bumping the monotonic counter.
    pub fn allocate(&self) -> Result<ArenaSlot, StoreError> {
        let mut alloc = self.alloc.lock().expect("arena allocation lock poisoned");
        if let Some(slot) = alloc.free_list.pop() {
            return Ok(slot);
        }
        if alloc.next_id >= self.num_slots {
            return Err(StoreError::OutOfSlots);
        }
        let slot = alloc.next_id;
        alloc.next_id += 1;
        Ok(slot)
    }

    /// Return `slot` to the free list. Callers must ensure no read of
    /// `slot` is in flight (the per-entry lock in `DiskTier` serializes
    /// this against `read_slot`).
    pub fn free(&self, slot: ArenaSlot) {
        let mut alloc = self.alloc.lock().expect("arena allocation lock poisoned");
        alloc.free_list.push(slot);
    }

    fn slot_range(&self, slot: ArenaSlot) -> std::ops::Range<usize> {
        let start = slot as usize * self.slot_size;
        start..start + self.slot_size
    }

    /// Copy `data` into `slot`, zero-filling the slack so a shorter write
    /// can't resurrect stale bytes from a previous, longer occupant. This
    /// is the only method that mutates the mmap; it runs on the background
    /// arena-writer task, never inline with a cache `put`.
    pub fn write_slot(&self, slot: ArenaSlot, data: &[u8]) -> Result<(), StoreError> {
        if data.len() > self.slot_size {
            return Err(StoreError::BlockTooLarge {
                len: data.len(),
                slot_size: self.slot_size,
            });
        }
        let range = self.slot_range(slot);
        // Safety: `range` belongs exclusively to `slot`, and no two slots'
        // ranges overlap, so this is the only writer of these bytes at a
        // given time even though other slots may be written concurrently.
        let base = self.mmap.as_ptr() as *mut u8;
        unsafe {
            let dst = std::slice::from_raw_parts_mut(base.add(range.start), self.slot_size);
            dst[..data.len()].copy_from_slice(data);
            if data.len() < self.slot_size {
                dst[data.len()..].fill(0);
            }
        }
        Ok(())
    }

    /// Read `len` bytes back from `slot`.
    pub fn read_slot(&self, slot: ArenaSlot, len: usize) -> Bytes {
        let range = self.slot_range(slot);
        let base = self.mmap.as_ptr();
        // Safety: see `write_slot`; reads never outrun the slot boundary
        // because `len` is bounded by `slot_size` at the call site.
        let src = unsafe { std::slice::from_raw_parts(base.add(range.start), len) };
        Bytes::copy_from_slice(src)
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn capacity(&self) -> u32 {
        self.num_slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(&dir.path().join("arena.bin"), 64, 4).unwrap();
        let slot = arena.allocate().unwrap();
        arena.write_slot(slot, b"hello").unwrap();
        assert_eq!(&arena.read_slot(slot, 5)[..], b"hello");
    }

    #[test]
    fn free_recycles_slots() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(&dir.path().join("arena.bin"), 16, 1).unwrap();
        let a = arena.allocate().unwrap();
        arena.write_slot(a, b"one").unwrap();
        arena.free(a);
        // With capacity 1 and the only slot freed, a second allocation must
        // reuse it.
        let b = arena.allocate().unwrap();
        assert_eq!(a, b);
        arena.write_slot(b, b"two").unwrap();
        assert_eq!(&arena.read_slot(b, 3)[..], b"two");
    }

    #[test]
    fn out_of_slots_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(&dir.path().join("arena.bin"), 8, 1).unwrap();
        arena.allocate().unwrap();
        let err = arena.allocate().unwrap_err();
        assert!(matches!(err, StoreError::OutOfSlots));
    }

    #[test]
    fn oversized_block_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(&dir.path().join("arena.bin"), 4, 1).unwrap();
        let slot = arena.allocate().unwrap();
        let err = arena.write_slot(slot, b"too big").unwrap_err();
        assert!(matches!(err, StoreError::BlockTooLarge { .. }));
    }
}
