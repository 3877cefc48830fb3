//! Parallel range pipeline: a download aggregator and an upload
//! reverse-aggregator, both bounded by a lookahead window and both
//! Ring-aware — every block fetch/PUT first asks the hash ring who owns
//! the block, and only falls back to the local cache/object-store path
//! when that owner is this node.
//!
//! `Aggregator::write_to` fetches blocks in parallel into a reorder map
//! and drains them in-order to the response writer; `ReverseAggregator::
//! read_from` reads sequentially, chunks into blocks, fans out parallel
//! block-owner PUTs bounded by a buffer pool, and finishes with a single
//! ordered object-store upload of the whole file. A
//! `tokio::sync::Semaphore` bounds in-flight work; a `tokio::sync::mpsc`
//! of `(block_index, result)` pairs carries completions back to the
//! reorder loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use fastfs_datamanager::{DataError, DataManager, DataResult};
use fastfs_hashring::SharedRing;
use fastfs_objectstore::ObjectStore;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("block fetch/upload failed: {0}")]
    Data(#[from] Arc<DataError>),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Default number of blocks allowed to be in flight at once, in either
/// direction.
pub const DEFAULT_CONCURRENCY: usize = 8;

fn peer_error(path: &str, block: u64, source: impl std::error::Error + Send + Sync + 'static) -> Arc<DataError> {
    Arc::new(DataError::Transient {
        path: path.to_string(),
        block,
        source: Arc::new(source),
    })
}

fn peer_status_error(path: &str, block: u64, owner: &str, status: reqwest::StatusCode) -> Arc<DataError> {
    peer_error(
        path,
        block,
        std::io::Error::other(format!("peer {owner} returned {status}")),
    )
}

/// Consults the ring for a block's owner and routes to either the local
/// `DataManager` or an HTTP call to the owning peer's `/block` route.
/// Shared by both directions of the pipeline.
#[derive(Clone)]
struct RingRouter {
    ring: Arc<SharedRing>,
    local_addr: String,
    http: reqwest::Client,
}

impl RingRouter {
    fn new(ring: Arc<SharedRing>, local_addr: String) -> Self {
        Self {
            ring,
            local_addr,
            http: reqwest::Client::new(),
        }
    }

    async fn owner(&self, path: &str, block: u64) -> Option<String> {
        self.ring.get_server(path, block).await
    }

    async fn fetch_remote(&self, owner: &str, path: &str, block: u64) -> DataResult<Bytes> {
        let url = format!("http://{owner}/block/{path}?block={block}&force=1");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| peer_error(path, block, e))?;
        if !resp.status().is_success() {
            return Err(peer_status_error(path, block, owner, resp.status()));
        }
        resp.bytes().await.map_err(|e| peer_error(path, block, e))
    }

    async fn put_remote(&self, owner: &str, path: &str, block: u64, data: Bytes) -> DataResult<()> {
        let url = format!("http://{owner}/block/{path}?block={block}");
        let resp = self
            .http
            .put(&url)
            .body(data)
            .send()
            .await
            .map_err(|e| peer_error(path, block, e))?;
        if !resp.status().is_success() {
            return Err(peer_status_error(path, block, owner, resp.status()));
        }
        Ok(())
    }
}

async fn fetch_block<O: ObjectStore + 'static>(
    dm: &DataManager<O>,
    router: &RingRouter,
    path: &str,
    block: u64,
) -> DataResult<Bytes> {
    match router.owner(path, block).await {
        Some(owner) if owner != router.local_addr => router.fetch_remote(&owner, path, block).await,
        _ => dm.get(path, block).await,
    }
}

async fn put_block<O: ObjectStore + 'static>(
    dm: &DataManager<O>,
    router: &RingRouter,
    path: &str,
    block: u64,
    data: Bytes,
) -> DataResult<()> {
    match router.owner(path, block).await {
        Some(owner) if owner != router.local_addr => router.put_remote(&owner, path, block, data).await,
        _ => dm
            .cache_put(path, block, data)
            .await
            .map_err(|_| Arc::new(DataError::OutOfSlots)),
    }
}

/// Downloads a byte range of `path` in parallel and streams it, in order,
/// to `writer`.
pub struct Aggregator<O: ObjectStore + 'static> {
    dm: DataManager<O>,
    router: RingRouter,
    block_size: u64,
    concurrency: usize,
}

impl<O: ObjectStore + 'static> Aggregator<O> {
    pub fn new(dm: DataManager<O>, ring: Arc<SharedRing>, local_addr: String, block_size: u64) -> Self {
        Self {
            dm,
            router: RingRouter::new(ring, local_addr),
            block_size,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Write `len` bytes of `path` starting at `offset` to `writer`. Blocks
    /// are fetched concurrently (up to `concurrency` in flight) but written
    /// out strictly in order, matching `WriteTo`'s reorder-buffer behavior.
    pub async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        path: &str,
        offset: u64,
        len: u64,
    ) -> Result<u64> {
        if len == 0 {
            return Ok(0);
        }
        let block_size = self.block_size;
        let first_block = offset / block_size;
        let last_block = (offset + len - 1) / block_size;

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (tx, mut rx) = mpsc::channel(self.concurrency.max(1));

        for block in first_block..=last_block {
            let path = path.to_string();
            let tx = tx.clone();
            let dm = self.dm.clone();
            let router = self.router.clone();
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            tokio::spawn(async move {
                let result = fetch_block(&dm, &router, &path, block).await;
                drop(permit);
                let _ = tx.send((block, result)).await;
            });
        }
        drop(tx);

        let mut pending: BTreeMap<u64, Bytes> = BTreeMap::new();
        let mut next_block = first_block;
        let mut written = 0u64;

        while next_block <= last_block {
            let (block, result) = match rx.recv().await {
                Some(item) => item,
                None => break,
            };
            pending.insert(block, result?);

            while let Some(data) = pending.remove(&next_block) {
                let block_start = next_block * block_size;
                let block_end = block_start + data.len() as u64;
                let want_start = offset.max(block_start);
                let want_end = (offset + len).min(block_end);
                if want_start < want_end {
                    let lo = (want_start - block_start) as usize;
                    let hi = (want_end - block_start) as usize;
                    writer.write_all(&data[lo..hi]).await?;
                    written += (hi - lo) as u64;
                }
                next_block += 1;
            }
        }

        writer.flush().await?;
        debug!(path, offset, len, written, "aggregator wrote range");
        Ok(written)
    }
}

/// Reads a byte stream sequentially, splits it into fixed-size blocks,
/// uploads each block to its ring owner in parallel (bounded lookahead),
/// and finishes with one ordered whole-file upload to the object store —
/// the object store is the write's source of truth; a failed block PUT to
/// a peer does not fail the upload.
pub struct ReverseAggregator<O: ObjectStore + 'static> {
    dm: DataManager<O>,
    router: RingRouter,
    block_size: u64,
    concurrency: usize,
}

impl<O: ObjectStore + 'static> ReverseAggregator<O> {
    pub fn new(dm: DataManager<O>, ring: Arc<SharedRing>, local_addr: String, block_size: u64) -> Self {
        Self {
            dm,
            router: RingRouter::new(ring, local_addr),
            block_size,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Read all of `reader`, chunk it into blocks starting at `start_block`,
    /// PUT each block to its ring owner, and upload the whole, ordered
    /// byte stream to the object store under `path`. Returns the number of
    /// blocks written. A block PUT failure is logged and does not abort
    /// the call; only the final object-store upload can fail the whole
    /// operation.
    pub async fn read_from<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        path: &str,
        start_block: u64,
    ) -> Result<u64> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::new();
        let mut block = start_block;
        let mut buf = vec![0u8; self.block_size as usize];
        let mut whole = BytesMut::new();

        loop {
            let mut filled = 0usize;
            while filled < buf.len() {
                let n = reader.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }

            let chunk = Bytes::copy_from_slice(&buf[..filled]);
            whole.extend_from_slice(&chunk);

            let path_owned = path.to_string();
            let router = self.router.clone();
            let dm = self.dm.clone();
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let this_block = block;
            handles.push(tokio::spawn(async move {
                let result = put_block(&dm, &router, &path_owned, this_block, chunk).await;
                drop(permit);
                (this_block, result)
            }));

            block += 1;
            if filled < buf.len() {
                break;
            }
        }

        for handle in handles {
            let (block, result) = handle.await.expect("upload task panicked");
            if let Err(e) = result {
                warn!(path, block, error = %e, "block write-back failed, continuing (object store is the source of truth)");
            }
        }

        self.dm.upload_object(path, whole.freeze()).await?;

        Ok(block - start_block)
    }
}
