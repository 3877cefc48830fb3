//! LocationIndex: tracks which node owns which cached block, and per-file
//! metadata, via a shared KV store.
//!
//! Talks to Redis through `redis::aio::ConnectionManager`, matching how
//! the rest of this codebase reaches a shared, networked cache tier.

use std::time::Duration;

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Per-file metadata tracked alongside block locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub block_size: u32,
    pub num_blocks: u64,
}

/// Default TTL for block-location entries, recorded as a tunable in
/// DESIGN.md rather than a hardcoded constant.
pub const DEFAULT_LOCATION_TTL: Duration = Duration::from_secs(3600);

fn file_key(path: &str) -> String {
    format!("fastfs:file:{path}")
}

fn block_key(path: &str, block: u64) -> String {
    format!("fastfs:block:{path}:{block}")
}

/// Block-location and file-metadata index backed by a shared Redis
/// instance. Every node in the cluster reads and writes the same index, so
/// it is the authority for "who owns this block" independent of ring
/// membership (the ring gives the *current* target; the index records where
/// a block actually landed, which matters during migration).
#[derive(Clone)]
pub struct LocationIndex {
    conn: redis::aio::ConnectionManager,
    location_ttl: Duration,
}

impl LocationIndex {
    pub async fn connect(redis_addr: &str) -> Result<Self> {
        Self::connect_with_ttl(redis_addr, DEFAULT_LOCATION_TTL).await
    }

    pub async fn connect_with_ttl(redis_addr: &str, location_ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_addr)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn, location_ttl })
    }

    /// Record that `path`'s `block` is cached on `node`.
    pub async fn put_block_location(&self, path: &str, block: u64, node: &str) -> Result<()> {
        let key = block_key(path, block);
        let mut conn = self.conn.clone();
        let ttl_secs = self.location_ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(&key, node, ttl_secs).await?;
        debug!(path, block, node, "recorded block location");
        Ok(())
    }

    /// Look up which node last reported caching `path`'s `block`, if known
    /// and not expired.
    pub async fn get_block_location(&self, path: &str, block: u64) -> Result<Option<String>> {
        let key = block_key(path, block);
        let mut conn = self.conn.clone();
        let node: Option<String> = conn.get(&key).await?;
        Ok(node)
    }

    /// Remove a stale or migrated block-location entry.
    pub async fn delete_block_location(&self, path: &str, block: u64) -> Result<()> {
        let key = block_key(path, block);
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&key).await?;
        Ok(())
    }

    /// Store file metadata (size, block size, block count) for `path`.
    pub async fn put_file_info(&self, info: &FileInfo) -> Result<()> {
        let key = file_key(&info.path);
        let payload = serde_json::to_string(info)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(&key, payload).await?;
        Ok(())
    }

    /// Fetch file metadata for `path`, if present.
    pub async fn get_file_info(&self, path: &str) -> Result<Option<FileInfo>> {
        let key = file_key(path);
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&key).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Drop all metadata for `path`. Block-location entries expire on their
    /// own TTL and are not swept eagerly here.
    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let key = file_key(path);
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(&key).await?;
        if removed == 0 {
            warn!(path, "delete_file called for unknown path");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_info_round_trips_through_json() {
        let info = FileInfo {
            path: "datasets/a.csv".into(),
            size: 4096,
            block_size: 1024,
            num_blocks: 4,
        };
        let raw = serde_json::to_string(&info).unwrap();
        let back: FileInfo = serde_json::from_str(&raw).unwrap();
        assert_eq!(info, back);
    }

    #[test]
    fn keys_are_namespaced_and_stable() {
        assert_eq!(file_key("a/b"), "fastfs:file:a/b");
        assert_eq!(block_key("a/b", 3), "fastfs:block:a/b:3");
    }
}
