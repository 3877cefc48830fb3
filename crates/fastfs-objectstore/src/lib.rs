//! Object-store client contract.
//!
//! FastFS treats the backing object store as an external collaborator: this
//! crate defines the narrow `ObjectStore` trait the rest of the system
//! programs against, plus an `aws-sdk-s3` backed implementation.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object store request failed: {0}")]
    Backend(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ObjectStoreError>;

/// A single entry returned from [`ObjectStore::list`].
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
}

/// The operations FastFS needs from the backing object store. Kept
/// deliberately narrow (four verbs) so tests can substitute an in-memory
/// fake without depending on `aws-sdk-s3`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch `len` bytes of `key` starting at `offset`. A `len` of `None`
    /// reads to the end of the object.
    async fn download_range(&self, key: &str, offset: u64, len: Option<u64>) -> Result<Bytes>;

    /// Upload `body` as `key`, replacing any existing object at that key.
    async fn upload(&self, key: &str, body: Bytes) -> Result<()>;

    /// List objects under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// `aws-sdk-s3` backed [`ObjectStore`].
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a store from the ambient AWS config (env vars, profile, IMDS).
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        let client = aws_sdk_s3::Client::new(&config);
        Self::new(client, bucket)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn download_range(&self, key: &str, offset: u64, len: Option<u64>) -> Result<Bytes> {
        let range = match len {
            Some(len) => format!("bytes={}-{}", offset, offset + len.saturating_sub(1)),
            None => format!("bytes={}-", offset),
        };
        debug!(key, range = %range, "downloading object range");

        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(se) if se.is_no_such_key() => ObjectStoreError::NotFound(key.to_string()),
                _ => ObjectStoreError::Backend(e.to_string()),
            })?;

        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        Ok(body.into_bytes())
    }

    #[instrument(skip(self, body), fields(bucket = %self.bucket, bytes = body.len()))]
    async fn upload(&self, key: &str, body: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut out = Vec::new();
        let mut stream = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = stream.next().await {
            let page = page.map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
            for obj in page.contents() {
                if let Some(key) = obj.key() {
                    out.push(ObjectMeta {
                        key: key.to_string(),
                        size: obj.size().unwrap_or_default().max(0) as u64,
                    });
                }
            }
        }
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

use futures::StreamExt as _;

/// In-memory fake used by tests in this crate and downstream crates.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryObjectStore {
        objects: Mutex<HashMap<String, Bytes>>,
    }

    #[async_trait]
    impl ObjectStore for InMemoryObjectStore {
        async fn download_range(&self, key: &str, offset: u64, len: Option<u64>) -> Result<Bytes> {
            let objects = self.objects.lock().await;
            let data = objects
                .get(key)
                .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?;
            let start = offset as usize;
            if start > data.len() {
                return Ok(Bytes::new());
            }
            let end = match len {
                Some(len) => (start + len as usize).min(data.len()),
                None => data.len(),
            };
            Ok(data.slice(start..end))
        }

        async fn upload(&self, key: &str, body: Bytes) -> Result<()> {
            self.objects.lock().await.insert(key.to_string(), body);
            Ok(())
        }

        async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
            let objects = self.objects.lock().await;
            Ok(objects
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| ObjectMeta {
                    key: k.clone(),
                    size: v.len() as u64,
                })
                .collect())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.objects.lock().await.remove(key);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::InMemoryObjectStore;
    use super::*;

    #[tokio::test]
    async fn round_trips_a_range() {
        let store = InMemoryObjectStore::default();
        store.upload("a/b", Bytes::from_static(b"0123456789")).await.unwrap();
        let got = store.download_range("a/b", 2, Some(4)).await.unwrap();
        assert_eq!(&got[..], b"2345");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let store = InMemoryObjectStore::default();
        let err = store.download_range("missing", 0, None).await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let store = InMemoryObjectStore::default();
        store.upload("logs/a", Bytes::from_static(b"x")).await.unwrap();
        store.upload("logs/b", Bytes::from_static(b"y")).await.unwrap();
        store.upload("data/c", Bytes::from_static(b"z")).await.unwrap();
        let listed = store.list("logs/").await.unwrap();
        assert_eq!(listed.len(), 2);
    }
}
