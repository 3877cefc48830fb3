//! Read-through/write-back coordination between the block cache and the
//! object store: fetch deduplication, a bounded download worker pool, and
//! the upload path.
//!
//! Concurrent fetches for the same block are coalesced with a `DashMap` of
//! `futures::future::Shared` futures, and downloads run on a fixed set of
//! `tokio::spawn`ed workers draining an `mpsc::Receiver`.
//!
//! The object store holds one object per file, addressed by its path;
//! block indices only ever select a byte range within that object. The
//! block cache is advisory — `cache_put`/`cache_get`/`cache_delete` never
//! touch the object store, and `upload_object` is the only thing that
//! does, so a full-file write always leaves the object store in a
//! consistent state regardless of which individual block caches succeeded.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use fastfs_blockstore::{BlockKey, BlockStore, StoreError};
use fastfs_objectstore::{ObjectStore, ObjectStoreError};

#[derive(Debug, Error)]
pub enum DataError {
    #[error("block not found: {path}:{block}")]
    NotFound { path: String, block: u64 },
    #[error("transient failure fetching {path}:{block}: {source}")]
    Transient {
        path: String,
        block: u64,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
    #[error("fatal failure fetching {path}:{block}: {source}")]
    Fatal {
        path: String,
        block: u64,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
    #[error("disk cache is out of slots")]
    OutOfSlots,
}

pub type DataResult<T> = std::result::Result<T, Arc<DataError>>;

struct FetchJob {
    path: String,
    offset: u64,
    len: u64,
    respond: oneshot::Sender<std::result::Result<Bytes, ObjectStoreError>>,
}

type SharedFetch = Shared<BoxFuture<'static, DataResult<Bytes>>>;

/// Coordinates reads and writes between the block cache and an
/// [`ObjectStore`]. Every file under management shares one fixed
/// `block_size`, matching the node-wide configuration.
pub struct DataManager<O: ObjectStore + 'static> {
    store: BlockStore,
    objects: Arc<O>,
    inflight: Arc<DashMap<BlockKey, SharedFetch>>,
    fetch_tx: mpsc::Sender<FetchJob>,
    block_size: u64,
}

impl<O: ObjectStore + 'static> Clone for DataManager<O> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            objects: self.objects.clone(),
            inflight: self.inflight.clone(),
            fetch_tx: self.fetch_tx.clone(),
            block_size: self.block_size,
        }
    }
}

impl<O: ObjectStore + 'static> DataManager<O> {
    /// Spawn `num_workers` download workers and return a manager ready to
    /// serve `get`/`upload_object` calls.
    pub fn new(store: BlockStore, objects: Arc<O>, num_workers: usize, block_size: u64) -> Self {
        let (fetch_tx, fetch_rx) = mpsc::channel::<FetchJob>(256);
        let manager = Self {
            store,
            objects,
            inflight: Arc::new(DashMap::new()),
            fetch_tx,
            block_size,
        };
        manager.spawn_workers(fetch_rx, num_workers);
        manager
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn spawn_workers(&self, rx: mpsc::Receiver<FetchJob>, num_workers: usize) {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker_id in 0..num_workers.max(1) {
            let rx = rx.clone();
            let objects = self.objects.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else { break };
                    debug!(worker_id, path = %job.path, offset = job.offset, "fetching block range");
                    let result = objects.download_range(&job.path, job.offset, Some(job.len)).await;
                    let _ = job.respond.send(result);
                }
            });
        }
    }

    /// Fetch block `block` of `path`, checking the cache first and
    /// coalescing concurrent misses for the same block into a single
    /// object-store request.
    pub async fn get(&self, path: &str, block: u64) -> DataResult<Bytes> {
        let key = BlockKey::new(path.to_string(), block);

        if let Some(data) = self.store.get_with_len(&key, self.block_size as usize).await {
            return Ok(data);
        }

        let shared = match self.inflight.get(&key) {
            Some(existing) => existing.clone(),
            None => {
                let fut = self.clone().do_fetch(key.clone()).boxed().shared();
                self.inflight.insert(key.clone(), fut.clone());
                fut
            }
        };

        let result = shared.await;
        self.inflight.remove(&key);
        result
    }

    async fn do_fetch(self, key: BlockKey) -> DataResult<Bytes> {
        let (tx, rx) = oneshot::channel();
        let offset = key.block * self.block_size;
        self.fetch_tx
            .send(FetchJob {
                path: key.path.clone(),
                offset,
                len: self.block_size,
                respond: tx,
            })
            .await
            .map_err(|_| {
                Arc::new(DataError::Fatal {
                    path: key.path.clone(),
                    block: key.block,
                    source: Arc::new(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "fetch worker pool is shut down",
                    )),
                })
            })?;

        let data = rx
            .await
            .map_err(|_| {
                Arc::new(DataError::Fatal {
                    path: key.path.clone(),
                    block: key.block,
                    source: Arc::new(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "fetch worker dropped the response channel",
                    )),
                })
            })?
            .map_err(|e| classify(&key, e))?;

        if let Err(e) = self.store.put(key.clone(), data.clone()).await {
            warn!(path = %key.path, block = key.block, error = %e, "failed to cache fetched block");
        }

        Ok(data)
    }

    /// Cache `data` for `block` of `path` without touching the object
    /// store. Used for block-level write-back PUTs, which are advisory —
    /// the object store only learns about the write through
    /// [`Self::upload_object`].
    pub async fn cache_put(&self, path: &str, block: u64, data: Bytes) -> std::result::Result<(), StoreError> {
        let key = BlockKey::new(path.to_string(), block);
        self.store.put(key, data).await
    }

    /// Read `block` of `path` from the cache only; `None` means the block
    /// isn't cached on this node (a cache miss, not necessarily an error —
    /// callers typically fall back to [`Self::get`] or a peer).
    pub async fn cache_get(&self, path: &str, block: u64) -> Option<Bytes> {
        let key = BlockKey::new(path.to_string(), block);
        self.store.get_with_len(&key, self.block_size as usize).await
    }

    /// Evict `block` of `path` from the cache.
    pub async fn cache_delete(&self, path: &str, block: u64) {
        let key = BlockKey::new(path.to_string(), block);
        self.store.invalidate(&key).await;
    }

    /// Upload the full contents of `path` as a single object. This is the
    /// durable write: once it returns `Ok`, `path` is readable from the
    /// object store regardless of what happened to any per-block cache
    /// write along the way.
    pub async fn upload_object(&self, path: &str, body: Bytes) -> DataResult<()> {
        let key = BlockKey::new(path.to_string(), 0);
        self.objects
            .upload(path, body)
            .await
            .map_err(|e| Arc::new(classify(&key, e)))
    }

    /// Delete `path` from the object store. Does not purge any cached
    /// blocks for it; callers that need that should also call
    /// [`Self::cache_delete`] per block, or rely on cache TTL/eviction.
    pub async fn delete(&self, path: &str) -> DataResult<()> {
        let key = BlockKey::new(path.to_string(), 0);
        self.objects
            .delete(path)
            .await
            .map_err(|e| Arc::new(classify(&key, e)))
    }
}

fn classify(key: &BlockKey, err: ObjectStoreError) -> DataError {
    match err {
        ObjectStoreError::NotFound(_) => DataError::NotFound {
            path: key.path.clone(),
            block: key.block,
        },
        ObjectStoreError::Backend(_) => DataError::Transient {
            path: key.path.clone(),
            block: key.block,
            source: Arc::new(err),
        },
        ObjectStoreError::Io(_) => DataError::Transient {
            path: key.path.clone(),
            block: key.block,
            source: Arc::new(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastfs_blockstore::BlockStoreConfig;
    use fastfs_objectstore::fake::InMemoryObjectStore;

    async fn manager() -> (DataManager<InMemoryObjectStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(
            &dir.path().join("arena.bin"),
            BlockStoreConfig {
                mem_capacity_entries: 64,
                disk_slot_size: 64,
                disk_num_slots: 16,
            },
        )
        .unwrap();
        let objects = Arc::new(InMemoryObjectStore::default());
        (DataManager::new(store, objects, 4, 64), dir)
    }

    #[tokio::test]
    async fn get_falls_through_to_object_store_on_miss() {
        let (dm, _dir) = manager().await;
        dm.objects.upload("f", Bytes::from_static(b"hello world")).await.unwrap();
        let data = dm.get("f", 0).await.unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn get_hits_cache_on_second_call() {
        let (dm, _dir) = manager().await;
        dm.objects.upload("f", Bytes::from_static(b"hello world")).await.unwrap();
        let _ = dm.get("f", 0).await.unwrap();
        // second fetch must not require the object to still exist
        dm.objects.delete("f").await.unwrap();
        let data = dm.get("f", 0).await.unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn missing_object_yields_not_found() {
        let (dm, _dir) = manager().await;
        let err = dm.get("missing", 0).await.unwrap_err();
        assert!(matches!(*err, DataError::NotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_fetches_for_same_block_coalesce() {
        let (dm, _dir) = manager().await;
        dm.objects.upload("f", Bytes::from_static(b"0123456789")).await.unwrap();

        let a = dm.clone();
        let b = dm.clone();
        let (ra, rb) = tokio::join!(a.get("f", 0), b.get("f", 0));
        assert_eq!(&ra.unwrap()[..], b"0123456789");
        assert_eq!(&rb.unwrap()[..], b"0123456789");
    }

    #[tokio::test]
    async fn upload_object_is_readable_regardless_of_block_cache() {
        let (dm, _dir) = manager().await;
        dm.upload_object("f", Bytes::from_static(b"payload")).await.unwrap();
        let fetched = dm.get("f", 0).await.unwrap();
        assert_eq!(&fetched[..], b"payload");
        let listed = dm.objects.list("f").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn cache_put_does_not_reach_the_object_store() {
        let (dm, _dir) = manager().await;
        dm.cache_put("f", 0, Bytes::from_static(b"only cached")).await.unwrap();
        assert!(dm.objects.list("f").await.unwrap().is_empty());
        let cached = dm.cache_get("f", 0).await.unwrap();
        assert_eq!(&cached[..], b"only cached");
    }

    #[tokio::test]
    async fn cache_delete_evicts_and_falls_back_to_object_store() {
        let (dm, _dir) = manager().await;
        dm.objects.upload("f", Bytes::from_static(b"from object store")).await.unwrap();
        dm.cache_put("f", 0, Bytes::from_static(b"stale cached")).await.unwrap();
        dm.cache_delete("f", 0).await;
        assert!(dm.cache_get("f", 0).await.is_none());
        let data = dm.get("f", 0).await.unwrap();
        assert_eq!(&data[..], b"from object store");
    }

    #[tokio::test]
    async fn delete_removes_the_object() {
        let (dm, _dir) = manager().await;
        dm.upload_object("f", Bytes::from_static(b"payload")).await.unwrap();
        dm.delete("f").await.unwrap();
        assert!(dm.objects.list("f").await.unwrap().is_empty());
    }
}
