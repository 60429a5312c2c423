//! Client-side asset cache for narration audio and other binaries.
//!
//! Assets are keyed by their stable object key, never by the signed URL used
//! to fetch them.

pub mod cache;
pub mod store;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

pub use cache::{AssetCache, ResolvedAsset};
pub use store::{DiskAssetStore, MemoryAssetStore, MemoryBlobStore};

/// When the binary for `object_key` was last fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub object_key: String,
    pub cached_at_ms: i64,
}

/// Persistent key/value binary storage.
#[async_trait]
pub trait BinaryStore: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<Option<Bytes>, CacheError>;
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn clear(&self) -> Result<(), CacheError>;
}

#[async_trait]
pub trait AssetMetadataStore: Send + Sync {
    async fn get_metadata(&self, key: &str) -> Result<Option<AssetMetadata>, CacheError>;
    async fn put_metadata(&self, metadata: AssetMetadata) -> Result<(), CacheError>;
    async fn delete_metadata(&self, key: &str) -> Result<(), CacheError>;
    async fn clear_metadata(&self) -> Result<(), CacheError>;
}

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, CacheError>;
}

/// Issues and revokes in-process handles (blob URLs) for cached bytes.
pub trait BlobFactory: Send + Sync {
    fn create(&self, bytes: Bytes) -> String;
    fn revoke(&self, blob_url: &str);
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, CacheError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CacheError::fetch("client", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, CacheError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CacheError::fetch(url, e))?;
        if !resp.status().is_success() {
            return Err(CacheError::fetch(url, format!("status {}", resp.status())));
        }
        resp.bytes().await.map_err(|e| CacheError::fetch(url, e))
    }
}

const OBJECT_PATH_PREFIXES: [&str; 3] = ["/objects/", "/object/sign/", "/object/public/"];

/// Recover the stable object key from a storage download URL
/// (`.../objects/{bucket}/{key}?expires=...`). Returns `None` for URLs that
/// are not storage object links.
pub fn object_key_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let path = path
        .split_once("://")
        .map_or(path, |(_, rest)| rest.find('/').map_or("", |i| &rest[i..]));

    OBJECT_PATH_PREFIXES.iter().find_map(|prefix| {
        let rest = path.find(prefix).map(|i| &path[i + prefix.len()..])?;
        let (_bucket, key) = rest.split_once('/')?;
        (!key.is_empty()).then(|| key.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_object_keys() {
        assert_eq!(
            object_key_from_url(
                "http://127.0.0.1:8770/objects/book-assets/moby/audio/Kevin/3.mp3?expires=1&sig=ab"
            )
            .as_deref(),
            Some("moby/audio/Kevin/3.mp3")
        );
        assert_eq!(
            object_key_from_url(
                "https://x.supabase.co/storage/v1/object/sign/book-assets/b/cover.png?token=t"
            )
            .as_deref(),
            Some("b/cover.png")
        );
        assert_eq!(
            object_key_from_url("https://cdn.test/object/public/imgs/a.png#frag").as_deref(),
            Some("a.png")
        );
    }

    #[test]
    fn non_object_urls_have_no_key() {
        assert_eq!(object_key_from_url("https://example.com/audio.mp3"), None);
        assert_eq!(object_key_from_url("https://example.com/objects/bucket-only"), None);
        assert_eq!(object_key_from_url("https://example.com/objects/bucket/"), None);
        // Host names never count as path.
        assert_eq!(object_key_from_url("https://objects.test"), None);
    }
}
