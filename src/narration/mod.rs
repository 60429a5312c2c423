//! Narration: speech-mark alignment, the resumable chunk store, its
//! supervising generation queue, the HTTP API, and the generation journal.

pub mod aligner;
pub mod api;
pub mod journal;
pub mod queue;
pub mod store;

use serde::{Deserialize, Serialize};

use crate::text::Chunk;

/// Timing for one canonical word. `word_index` is the token index in the
/// full book, not relative to the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word_index: u32,
    pub start_ms: u32,
    pub end_ms: u32,
}

/// Natural key of a chunk row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub book_id: String,
    pub voice_id: String,
    pub chunk_index: u32,
}

impl std::fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.book_id, self.voice_id, self.chunk_index)
    }
}

/// One row per chunk. A placeholder has an empty `audio_storage_key` and no
/// timings; it is filled in place exactly once when the chunk is synthesized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrationChunkRecord {
    pub book_id: String,
    pub voice_id: String,
    pub chunk_index: u32,
    pub start_word_index: u32,
    pub end_word_index: u32,
    #[serde(default)]
    pub audio_storage_key: String,
    #[serde(default)]
    pub timings: Vec<WordTiming>,
    /// Last write time, for client cache staleness checks.
    #[serde(default)]
    pub updated_at_ms: i64,
}

impl NarrationChunkRecord {
    pub fn placeholder(book_id: &str, voice_id: &str, chunk: &Chunk) -> Self {
        Self {
            book_id: book_id.to_string(),
            voice_id: voice_id.to_string(),
            chunk_index: chunk.index,
            start_word_index: chunk.start_word_index,
            end_word_index: chunk.end_word_index,
            audio_storage_key: String::new(),
            timings: Vec::new(),
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_populated(&self) -> bool {
        !self.audio_storage_key.is_empty()
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            book_id: self.book_id.clone(),
            voice_id: self.voice_id.clone(),
            chunk_index: self.chunk_index,
        }
    }
}

/// Storage path of a chunk's audio: `{book_id}/audio/{voice_id}/{chunk_index}.{ext}`.
pub fn audio_storage_key(book_id: &str, voice_id: &str, chunk_index: u32, extension: &str) -> String {
    format!("{book_id}/audio/{voice_id}/{chunk_index}.{extension}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_layout() {
        assert_eq!(audio_storage_key("b1", "Kevin", 3, "mp3"), "b1/audio/Kevin/3.mp3");
    }

    #[test]
    fn placeholder_is_unpopulated() {
        let chunk = Chunk {
            index: 2,
            start_word_index: 10,
            end_word_index: 19,
            text: "x".into(),
        };
        let rec = NarrationChunkRecord::placeholder("b", "v", &chunk);
        assert!(!rec.is_populated());
        assert!(rec.timings.is_empty());
        assert_eq!(rec.key().to_string(), "b/v#2");
    }
}
