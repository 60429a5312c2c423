//! Filesystem object storage with md5-signed, expiring download URLs.
//!
//! Layout: `{root}/{bucket}/{key}` for data and
//! `{root}/.content-types/{bucket}/{key}` for the stored content type.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{validate_key, ObjectStorage};
use crate::error::StorageError;

const CONTENT_TYPES_DIR: &str = ".content-types";

pub struct LocalObjectStorage {
    root: PathBuf,
    public_url: String,
    secret: String,
}

pub struct StoredObject {
    pub bytes: Bytes,
    pub content_type: String,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, public_url: &str, secret: &str) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        Ok(self.root.join(bucket).join(key))
    }

    fn content_type_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(CONTENT_TYPES_DIR).join(bucket).join(key)
    }

    fn signature(&self, bucket: &str, key: &str, expires: i64) -> String {
        format!(
            "{:x}",
            md5::compute(format!("{}:{bucket}:{key}:{expires}", self.secret))
        )
    }

    /// Signed download URL valid until `expires` (unix seconds).
    pub fn sign(&self, bucket: &str, key: &str, expires: i64) -> String {
        format!(
            "{}/objects/{bucket}/{key}?expires={expires}&sig={}",
            self.public_url,
            self.signature(bucket, key, expires)
        )
    }

    /// Check a presented signature. Expired links are rejected.
    pub fn verify(&self, bucket: &str, key: &str, expires: i64, sig: &str) -> bool {
        expires >= chrono::Utc::now().timestamp()
            && signatures_match(&self.signature(bucket, key, expires), sig)
    }

    pub async fn read(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError> {
        let path = self.object_path(bucket, key)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| StorageError::io("reading object", e))?;
        let content_type = tokio::fs::read_to_string(self.content_type_path(bucket, key))
            .await
            .unwrap_or_else(|_| "application/octet-stream".to_string());
        Ok(StoredObject {
            bytes: Bytes::from(bytes),
            content_type,
        })
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        write_atomic(&path, &bytes).await?;
        write_atomic(&self.content_type_path(bucket, key), content_type.as_bytes()).await?;
        debug!("Stored {bucket}/{key} ({} bytes, {content_type})", bytes.len());
        Ok(())
    }

    async fn create_signed_url(
        &self,
        bucket: &str,
        key: &str,
        ttl_secs: u64,
    ) -> Result<String, StorageError> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let expires = chrono::Utc::now().timestamp() + ttl_secs as i64;
        Ok(self.sign(bucket, key, expires))
    }

    async fn remove(&self, bucket: &str, keys: &[String]) -> Result<(), StorageError> {
        for key in keys {
            let path = self.object_path(bucket, key)?;
            for p in [path, self.content_type_path(bucket, key)] {
                match tokio::fs::remove_file(&p).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StorageError::io("removing object", e)),
                }
            }
        }
        Ok(())
    }
}

/// Equal-length comparison that always scans every byte, so response time
/// does not reveal how much of a forged signature was right.
fn signatures_match(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn validate_bucket(bucket: &str) -> Result<(), StorageError> {
    if bucket.is_empty() || bucket.starts_with('.') || bucket.contains('/') {
        return Err(StorageError::InvalidKey(format!("bucket {bucket}")));
    }
    validate_key(bucket)
}

/// Write to a sibling temp file, then rename over the target.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io("creating directory", e))?;
    }
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| StorageError::io("writing temp file", e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StorageError::io("renaming temp file", e))
}
