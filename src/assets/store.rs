//! Binary/metadata stores and blob handles backing the asset cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{AssetMetadata, AssetMetadataStore, BinaryStore, BlobFactory};
use crate::error::CacheError;
use crate::storage::local::write_atomic;

/// On-disk store: `{dir}/{md5(key)}.bin` plus a `{md5(key)}.json` metadata sidecar.
pub struct DiskAssetStore {
    dir: PathBuf,
}

impl DiskAssetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn stem(key: &str) -> String {
        format!("{:x}", md5::compute(key.as_bytes()))
    }

    fn bin_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", Self::stem(key)))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::stem(key)))
    }

    async fn remove(&self, key: &str, path: PathBuf) -> Result<(), CacheError> {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::storage(key, e)),
        }
    }

    async fn remove_with_extension(&self, ext: &str) -> Result<(), CacheError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CacheError::storage("*", e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::storage("*", e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|x| x == ext) {
                self.remove("*", path).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BinaryStore for DiskAssetStore {
    async fn lookup(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        match tokio::fs::read(self.bin_path(key)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::storage(key, e)),
        }
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), CacheError> {
        write_atomic(&self.bin_path(key), &bytes)
            .await
            .map_err(|e| CacheError::storage(key, e))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.remove(key, self.bin_path(key)).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.remove_with_extension("bin").await
    }
}

#[async_trait]
impl AssetMetadataStore for DiskAssetStore {
    async fn get_metadata(&self, key: &str) -> Result<Option<AssetMetadata>, CacheError> {
        let raw = match tokio::fs::read(self.meta_path(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::storage(key, e)),
        };
        match serde_json::from_slice(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                debug!("Ignoring unreadable asset metadata for {key}: {e}");
                Ok(None)
            }
        }
    }

    async fn put_metadata(&self, metadata: AssetMetadata) -> Result<(), CacheError> {
        let key = metadata.object_key.clone();
        let json = serde_json::to_vec(&metadata).map_err(|e| CacheError::storage(&key, e))?;
        write_atomic(&self.meta_path(&key), &json)
            .await
            .map_err(|e| CacheError::storage(&key, e))
    }

    async fn delete_metadata(&self, key: &str) -> Result<(), CacheError> {
        self.remove(key, self.meta_path(key)).await
    }

    async fn clear_metadata(&self) -> Result<(), CacheError> {
        self.remove_with_extension("json").await
    }
}

/// Process-local store, for clients without a writable cache directory.
#[derive(Default)]
pub struct MemoryAssetStore {
    binaries: Mutex<HashMap<String, Bytes>>,
    metadata: Mutex<HashMap<String, AssetMetadata>>,
}

#[async_trait]
impl BinaryStore for MemoryAssetStore {
    async fn lookup(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(self.binaries.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), CacheError> {
        self.binaries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.binaries.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.binaries.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}

#[async_trait]
impl AssetMetadataStore for MemoryAssetStore {
    async fn get_metadata(&self, key: &str) -> Result<Option<AssetMetadata>, CacheError> {
        Ok(self.metadata.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    async fn put_metadata(&self, metadata: AssetMetadata) -> Result<(), CacheError> {
        self.metadata
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(metadata.object_key.clone(), metadata);
        Ok(())
    }

    async fn delete_metadata(&self, key: &str) -> Result<(), CacheError> {
        self.metadata.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        Ok(())
    }

    async fn clear_metadata(&self) -> Result<(), CacheError> {
        self.metadata.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}

/// Holds materialized bytes behind `blob:narrator/{uuid}` handles until revoked.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn get(&self, blob_url: &str) -> Option<Bytes> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(blob_url)
            .cloned()
    }

    pub fn live(&self) -> usize {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl BlobFactory for MemoryBlobStore {
    fn create(&self, bytes: Bytes) -> String {
        let url = format!("blob:narrator/{}", uuid::Uuid::new_v4());
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.clone(), bytes);
        url
    }

    fn revoke(&self, blob_url: &str) {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(blob_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disk_store_round_trip_and_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskAssetStore::new(dir.path().join("assets"));
        assert!(store.lookup("b/audio/v/0.mp3").await.expect("lookup").is_none());

        store
            .put("b/audio/v/0.mp3", Bytes::from_static(b"mp3"))
            .await
            .expect("put");
        store
            .put_metadata(AssetMetadata {
                object_key: "b/audio/v/0.mp3".into(),
                cached_at_ms: 42,
            })
            .await
            .expect("meta");

        let bytes = store.lookup("b/audio/v/0.mp3").await.expect("lookup");
        assert_eq!(bytes.as_deref(), Some(&b"mp3"[..]));
        let meta = store.get_metadata("b/audio/v/0.mp3").await.expect("meta");
        assert_eq!(meta.map(|m| m.cached_at_ms), Some(42));

        store.clear().await.expect("clear");
        assert!(store.lookup("b/audio/v/0.mp3").await.expect("lookup").is_none());
        // metadata is cleared separately
        assert!(store.get_metadata("b/audio/v/0.mp3").await.expect("meta").is_some());
        store.clear_metadata().await.expect("clear");
        assert!(store.get_metadata("b/audio/v/0.mp3").await.expect("meta").is_none());
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskAssetStore::new(dir.path());
        store.delete("nope").await.expect("delete");
        store.delete_metadata("nope").await.expect("delete");
    }

    #[test]
    fn blob_handles_are_unique_and_revocable() {
        let blobs = MemoryBlobStore::default();
        let a = blobs.create(Bytes::from_static(b"a"));
        let b = blobs.create(Bytes::from_static(b"a"));
        assert_ne!(a, b);
        assert!(a.starts_with("blob:narrator/"));
        assert_eq!(blobs.live(), 2);
        blobs.revoke(&a);
        assert!(blobs.get(&a).is_none());
        assert_eq!(blobs.get(&b).as_deref(), Some(&b"a"[..]));
    }
}
