//! Object storage and chunk record store interfaces.
//!
//! Only stable object keys are ever persisted; signed URLs are minted fresh on read.

pub mod local;
pub mod metadata;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::narration::NarrationChunkRecord;

pub use local::LocalObjectStorage;
pub use metadata::JsonChunkRepository;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUrl {
    pub key: String,
    pub url: String,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError>;

    async fn create_signed_url(
        &self,
        bucket: &str,
        key: &str,
        ttl_secs: u64,
    ) -> Result<String, StorageError>;

    async fn create_signed_urls(
        &self,
        bucket: &str,
        keys: &[String],
        ttl_secs: u64,
    ) -> Result<Vec<SignedUrl>, StorageError> {
        let mut urls = Vec::with_capacity(keys.len());
        for key in keys {
            let url = self.create_signed_url(bucket, key, ttl_secs).await?;
            urls.push(SignedUrl {
                key: key.clone(),
                url,
            });
        }
        Ok(urls)
    }

    /// Remove objects. Missing keys are not an error.
    async fn remove(&self, bucket: &str, keys: &[String]) -> Result<(), StorageError>;
}

/// Row store for chunk records, keyed by `(book_id, chunk_index, voice_id)`.
#[async_trait]
pub trait ChunkRepository: Send + Sync {
    /// All records for a book and voice, ordered by `chunk_index`.
    async fn get_chunks(
        &self,
        book_id: &str,
        voice_id: &str,
    ) -> Result<Vec<NarrationChunkRecord>, StorageError>;

    async fn get_chunk(
        &self,
        book_id: &str,
        voice_id: &str,
        chunk_index: u32,
    ) -> Result<Option<NarrationChunkRecord>, StorageError>;

    /// Insert or replace by natural key.
    async fn upsert_chunk(&self, record: NarrationChunkRecord) -> Result<(), StorageError>;

    /// Batch insert, skipping rows whose natural key already exists.
    /// Returns the number of rows inserted.
    async fn insert_placeholders(
        &self,
        records: Vec<NarrationChunkRecord>,
    ) -> Result<usize, StorageError>;

    /// Delete every record for a book and voice. Returns the removed rows.
    async fn delete_chunks(
        &self,
        book_id: &str,
        voice_id: &str,
    ) -> Result<Vec<NarrationChunkRecord>, StorageError>;
}

/// Object keys are relative paths of `[A-Za-z0-9._-]` segments.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key.split('/').all(|seg| {
            !seg.is_empty()
                && seg != "."
                && seg != ".."
                && seg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        });
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}
