//! Error types for narration generation, storage, and the asset cache.

use std::sync::Arc;

use thiserror::Error;

/// Failures of the external storage collaborators (object storage, row store).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error while {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("{0}")]
    Backend(String),
}

impl StorageError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }
}

#[derive(Debug, Error)]
pub enum NarrationError {
    #[error("book not found: {0}")]
    BookNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("chunk index {index} out of range (book has {count} chunks)")]
    ChunkOutOfRange { index: u32, count: usize },

    /// A chunk range does not line up with the canonical tokens. Indicates a
    /// chunker bug or a book text that changed after chunking.
    #[error("chunk bounds violated: {0}")]
    ChunkBounds(String),

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("upload of {key} failed: {source}")]
    Upload {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("generation queue is shutting down")]
    Shutdown,

    #[error("metadata store error: {0}")]
    Metadata(#[source] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NarrationError {
    /// I/O-originated failures the caller may retry; the placeholder row is untouched.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Synthesis(_) | Self::Upload { .. } | Self::Metadata(_))
    }
}

/// Asset cache errors. Cloneable so one shared fetch can report the same
/// failure to every waiter.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("fetch of {key} failed: {message}")]
    Fetch { key: String, message: Arc<str> },

    #[error("cache storage error for {key}: {message}")]
    Storage { key: String, message: Arc<str> },

    /// The caller stopped waiting. Not a system failure.
    #[error("the operation was aborted")]
    Aborted,
}

impl CacheError {
    pub(crate) fn fetch(key: &str, err: impl std::fmt::Display) -> Self {
        Self::Fetch {
            key: key.to_string(),
            message: err.to_string().into(),
        }
    }

    pub(crate) fn storage(key: &str, err: impl std::fmt::Display) -> Self {
        Self::Storage {
            key: key.to_string(),
            message: err.to_string().into(),
        }
    }
}

pub type Result<T, E = NarrationError> = std::result::Result<T, E>;
