//! Chunk record store backed by a JSON file.
//!
//! Rows live in a `BTreeMap` keyed by natural key, so listing a book/voice is
//! a range scan already ordered by chunk index. Every mutation rewrites the
//! file atomically; an in-memory store skips persistence.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::local::write_atomic;
use super::ChunkRepository;
use crate::error::StorageError;
use crate::narration::{ChunkKey, NarrationChunkRecord};

pub struct JsonChunkRepository {
    path: Option<PathBuf>,
    rows: Mutex<BTreeMap<ChunkKey, NarrationChunkRecord>>,
}

impl JsonChunkRepository {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open (or create on first write) the store at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let rows = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let records: Vec<NarrationChunkRecord> = serde_json::from_str(&contents)
                    .map_err(|e| StorageError::json("parsing chunk store", e))?;
                records.into_iter().map(|r| (r.key(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StorageError::io("reading chunk store", e)),
        };
        info!("Chunk store at {} ({} rows)", path.display(), rows.len());
        Ok(Self {
            path: Some(path),
            rows: Mutex::new(rows),
        })
    }

    async fn persist(&self, rows: &BTreeMap<ChunkKey, NarrationChunkRecord>) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let records: Vec<&NarrationChunkRecord> = rows.values().collect();
        let json = serde_json::to_vec(&records)
            .map_err(|e| StorageError::json("serializing chunk store", e))?;
        write_atomic(path, &json).await?;
        debug!("Persisted {} chunk rows", records.len());
        Ok(())
    }
}

fn range_bounds(book_id: &str, voice_id: &str) -> (ChunkKey, ChunkKey) {
    let lo = ChunkKey {
        book_id: book_id.to_string(),
        voice_id: voice_id.to_string(),
        chunk_index: 0,
    };
    let hi = ChunkKey {
        chunk_index: u32::MAX,
        ..lo.clone()
    };
    (lo, hi)
}

#[async_trait]
impl ChunkRepository for JsonChunkRepository {
    async fn get_chunks(
        &self,
        book_id: &str,
        voice_id: &str,
    ) -> Result<Vec<NarrationChunkRecord>, StorageError> {
        let (lo, hi) = range_bounds(book_id, voice_id);
        let rows = self.rows.lock().await;
        Ok(rows.range(lo..=hi).map(|(_, r)| r.clone()).collect())
    }

    async fn get_chunk(
        &self,
        book_id: &str,
        voice_id: &str,
        chunk_index: u32,
    ) -> Result<Option<NarrationChunkRecord>, StorageError> {
        let key = ChunkKey {
            book_id: book_id.to_string(),
            voice_id: voice_id.to_string(),
            chunk_index,
        };
        Ok(self.rows.lock().await.get(&key).cloned())
    }

    async fn upsert_chunk(&self, record: NarrationChunkRecord) -> Result<(), StorageError> {
        let mut rows = self.rows.lock().await;
        let previous = rows.insert(record.key(), record.clone());
        if let Err(e) = self.persist(&rows).await {
            // Keep memory consistent with disk.
            match previous {
                Some(prev) => rows.insert(record.key(), prev),
                None => rows.remove(&record.key()),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn insert_placeholders(
        &self,
        records: Vec<NarrationChunkRecord>,
    ) -> Result<usize, StorageError> {
        let mut rows = self.rows.lock().await;
        let mut inserted = Vec::new();
        for record in records {
            let key = record.key();
            if !rows.contains_key(&key) {
                rows.insert(key.clone(), record);
                inserted.push(key);
            }
        }
        if inserted.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.persist(&rows).await {
            for key in &inserted {
                rows.remove(key);
            }
            return Err(e);
        }
        Ok(inserted.len())
    }

    async fn delete_chunks(
        &self,
        book_id: &str,
        voice_id: &str,
    ) -> Result<Vec<NarrationChunkRecord>, StorageError> {
        let (lo, hi) = range_bounds(book_id, voice_id);
        let mut rows = self.rows.lock().await;
        let keys: Vec<ChunkKey> = rows.range(lo..=hi).map(|(k, _)| k.clone()).collect();
        let removed: Vec<NarrationChunkRecord> =
            keys.iter().filter_map(|k| rows.remove(k)).collect();
        if !removed.is_empty() {
            if let Err(e) = self.persist(&rows).await {
                for r in removed {
                    rows.insert(r.key(), r);
                }
                return Err(e);
            }
        }
        Ok(removed)
    }
}
