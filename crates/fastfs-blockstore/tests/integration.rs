//! Cross-tier behavior that doesn't fit naturally as a single-module unit
//! test: capacity spill across both tiers and post-clear reuse of the
//! same store.

use bytes::Bytes;
use fastfs_blockstore::{BlockKey, BlockStore, BlockStoreConfig};

fn block_of(byte: u8) -> Bytes {
    Bytes::from(vec![byte; 1024])
}

#[tokio::test]
async fn mem_capacity_spill_keeps_all_entries_reachable() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(
        &dir.path().join("arena.bin"),
        BlockStoreConfig {
            mem_capacity_entries: 2,
            disk_slot_size: 1024,
            disk_num_slots: 4,
        },
    )
    .unwrap();

    let a = BlockKey::new("f".into(), 0);
    let b = BlockKey::new("f".into(), 1);
    let c = BlockKey::new("f".into(), 2);

    store.put(a.clone(), block_of(b'A')).await.unwrap();
    store.put(b.clone(), block_of(b'B')).await.unwrap();
    store.put(c.clone(), block_of(b'C')).await.unwrap();

    // A was evicted to disk to make room for C; it must still be
    // retrievable and the store must report all three entries live.
    let got_a = store.get_with_len(&a, 1024).await.unwrap();
    assert_eq!(&got_a[..], &block_of(b'A')[..]);

    let stats = store.stats().await;
    assert_eq!(stats.mem_len + stats.disk_len, 3);
}

#[tokio::test]
async fn clear_then_reuse_starts_from_a_clean_slate() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(
        &dir.path().join("arena.bin"),
        BlockStoreConfig {
            mem_capacity_entries: 1,
            disk_slot_size: 1024,
            disk_num_slots: 2,
        },
    )
    .unwrap();

    let a = BlockKey::new("f".into(), 0);
    let b = BlockKey::new("f".into(), 1);
    store.put(a.clone(), block_of(b'A')).await.unwrap();
    store.put(b.clone(), block_of(b'B')).await.unwrap();
    store.clear().await;

    assert!(store.get_with_len(&a, 1024).await.is_none());
    assert!(store.get_with_len(&b, 1024).await.is_none());

    // The arena's freed slots must be usable again after a clear.
    store.put(a.clone(), block_of(b'Z')).await.unwrap();
    let got = store.get_with_len(&a, 1024).await.unwrap();
    assert_eq!(&got[..], &block_of(b'Z')[..]);
}
