use std::sync::Arc;

use fastfs_blockstore::BlockStore;
use fastfs_datamanager::DataManager;
use fastfs_hashring::SharedRing;
use fastfs_index::LocationIndex;
use fastfs_membership::Membership;
use fastfs_objectstore::S3ObjectStore;
use fastfs_pipeline::{Aggregator, ReverseAggregator};

/// Shared application state threaded through every handler via
/// `axum::extract::State`, bundling the cache, pipeline, object store,
/// location index, and ring a request needs regardless of which route
/// it came in on.
#[derive(Clone)]
pub struct AppState {
    pub dm: DataManager<S3ObjectStore>,
    pub aggregator: Arc<Aggregator<S3ObjectStore>>,
    pub reverse_aggregator: Arc<ReverseAggregator<S3ObjectStore>>,
    pub objects: Arc<S3ObjectStore>,
    pub index: LocationIndex,
    pub ring: Arc<SharedRing>,
    pub membership: Membership,
    pub block_size: u64,
    pub local_addr: String,
    /// Used for migration-on-miss peer GETs in `block_get`; the pipeline
    /// crate keeps its own client for the ring-aware fetch/upload paths.
    pub http: reqwest::Client,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: BlockStore,
        objects: Arc<S3ObjectStore>,
        index: LocationIndex,
        ring: Arc<SharedRing>,
        membership: Membership,
        block_size: u64,
        num_downloaders: usize,
        local_addr: String,
    ) -> Self {
        let dm = DataManager::new(store, objects.clone(), num_downloaders, block_size);
        let aggregator = Arc::new(Aggregator::new(dm.clone(), ring.clone(), local_addr.clone(), block_size));
        let reverse_aggregator = Arc::new(ReverseAggregator::new(
            dm.clone(),
            ring.clone(),
            local_addr.clone(),
            block_size,
        ));
        Self {
            dm,
            aggregator,
            reverse_aggregator,
            objects,
            index,
            ring,
            membership,
            block_size,
            local_addr,
            http: reqwest::Client::new(),
        }
    }
}
