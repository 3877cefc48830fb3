//! Exercises the full upload/download path across the block store, data
//! manager, ring, and both aggregators together, rather than any one
//! component in isolation.

use std::sync::Arc;

use bytes::Bytes;
use fastfs_blockstore::{BlockStore, BlockStoreConfig};
use fastfs_datamanager::DataManager;
use fastfs_hashring::SharedRing;
use fastfs_membership::{Membership, MembershipConfig};
use fastfs_objectstore::fake::InMemoryObjectStore;
use fastfs_pipeline::{Aggregator, ReverseAggregator};

async fn single_node_ring(local_addr: &str) -> Arc<SharedRing> {
    let membership = Membership::start(
        local_addr.to_string(),
        "127.0.0.1:0".parse().unwrap(),
        Vec::new(),
        MembershipConfig::default(),
    )
    .await
    .unwrap();
    SharedRing::spawn(membership, 50).await
}

#[tokio::test]
async fn unaligned_file_round_trips_and_reads_back_partial_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let block_size = 64u64;
    let store = BlockStore::open(
        &dir.path().join("arena.bin"),
        BlockStoreConfig {
            mem_capacity_entries: 8,
            disk_slot_size: block_size as usize,
            disk_num_slots: 8,
        },
    )
    .unwrap();
    let objects = Arc::new(InMemoryObjectStore::default());
    let dm = DataManager::new(store, objects, 4, block_size);

    let local_addr = "127.0.0.1:9200".to_string();
    let ring = single_node_ring(&local_addr).await;

    // 3 full blocks plus a short terminal block.
    let payload: Vec<u8> = (0u32..(3 * block_size as u32 + 17)).map(|b| (b % 251) as u8).collect();

    let rev = ReverseAggregator::new(dm.clone(), ring.clone(), local_addr.clone(), block_size);
    let mut reader = std::io::Cursor::new(payload.clone());
    let blocks = rev.read_from(&mut reader, "dataset.bin", 0).await.unwrap();
    assert_eq!(blocks, 4);

    let fwd = Aggregator::new(dm, ring, local_addr, block_size);

    let mut whole = Vec::new();
    let written = fwd
        .write_to(&mut whole, "dataset.bin", 0, payload.len() as u64)
        .await
        .unwrap();
    assert_eq!(written, payload.len() as u64);
    assert_eq!(whole, payload);

    // A sub-range spanning a block boundary must also match exactly.
    let mut partial = Vec::new();
    let start = block_size - 10;
    let len = 40;
    let written = fwd.write_to(&mut partial, "dataset.bin", start, len).await.unwrap();
    assert_eq!(written, len);
    assert_eq!(partial, payload[start as usize..(start + len) as usize]);
}

#[tokio::test]
async fn upload_is_durable_even_if_every_block_cache_is_cold() {
    let dir = tempfile::tempdir().unwrap();
    let block_size = 32u64;
    let store = BlockStore::open(
        &dir.path().join("arena.bin"),
        BlockStoreConfig {
            mem_capacity_entries: 8,
            disk_slot_size: block_size as usize,
            disk_num_slots: 8,
        },
    )
    .unwrap();
    let objects = Arc::new(InMemoryObjectStore::default());
    let dm = DataManager::new(store, objects, 2, block_size);

    let local_addr = "127.0.0.1:9201".to_string();
    let ring = single_node_ring(&local_addr).await;

    let payload = Bytes::from(vec![7u8; (block_size * 3) as usize]);
    let rev = ReverseAggregator::new(dm.clone(), ring.clone(), local_addr.clone(), block_size);
    let mut reader = std::io::Cursor::new(payload.to_vec());
    rev.read_from(&mut reader, "cold.bin", 0).await.unwrap();

    dm.cache_delete("cold.bin", 0).await;
    dm.cache_delete("cold.bin", 1).await;
    dm.cache_delete("cold.bin", 2).await;

    let fwd = Aggregator::new(dm, ring, local_addr, block_size);
    let mut out = Vec::new();
    fwd.write_to(&mut out, "cold.bin", 0, payload.len() as u64).await.unwrap();
    assert_eq!(out, payload.to_vec());
}
