//! In-memory fakes for the external collaborators, shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;

use crate::assets::AssetFetcher;
use crate::error::{CacheError, NarrationError, Result, StorageError};
use crate::narration::store::BookSource;
use crate::storage::{ObjectStorage, SignedUrl};
use crate::synthesis::{SpeechMark, SpeechSynthesizer, SynthesisOutput};
use crate::text::{tokenize, tokenizer};

#[derive(Default)]
pub struct MemoryBookSource {
    books: Mutex<HashMap<String, String>>,
}

impl MemoryBookSource {
    pub fn with_book(book_id: &str, text: &str) -> Self {
        let source = Self::default();
        source.set_text(book_id, text);
        source
    }

    /// Replace a book's text, as an edit after narration started would.
    pub fn set_text(&self, book_id: &str, text: &str) {
        self.books
            .lock()
            .unwrap()
            .insert(book_id.to_string(), text.to_string());
    }
}

#[async_trait]
impl BookSource for MemoryBookSource {
    async fn load_text(&self, book_id: &str) -> Result<String> {
        self.books
            .lock()
            .unwrap()
            .get(book_id)
            .cloned()
            .ok_or_else(|| NarrationError::BookNotFound(book_id.to_string()))
    }
}

/// Emits one mark per word, 100ms apart. Optionally gated: each call then
/// waits for a permit released by [`ScriptedSynthesizer::release`].
#[derive(Default)]
pub struct ScriptedSynthesizer {
    calls: AtomicUsize,
    failing: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    gate: Option<Semaphore>,
}

impl ScriptedSynthesizer {
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<SynthesisOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(NarrationError::Synthesis("scripted failure".into()));
        }

        let tokens = tokenize(text);
        let marks = tokenizer::words(&tokens)
            .enumerate()
            .map(|(i, t)| SpeechMark::word(i as u32 * 100, t.text.clone()))
            .collect();
        Ok(SynthesisOutput {
            audio: Bytes::from(format!("AUDIO:{voice_id}:{text}")),
            marks,
        })
    }
}

#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<HashMap<(String, String), (Bytes, String)>>,
    failing: AtomicBool,
    sign_batches: AtomicUsize,
}

impl MemoryObjectStorage {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .lock()
            .unwrap()
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(_, ct)| ct.clone())
    }

    pub fn sign_batches(&self) -> usize {
        self.sign_batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> std::result::Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("scripted upload failure".into()));
        }
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            (bytes, content_type.to_string()),
        );
        Ok(())
    }

    async fn create_signed_url(
        &self,
        bucket: &str,
        key: &str,
        ttl_secs: u64,
    ) -> std::result::Result<String, StorageError> {
        Ok(format!("http://objects.test/objects/{bucket}/{key}?ttl={ttl_secs}"))
    }

    async fn create_signed_urls(
        &self,
        bucket: &str,
        keys: &[String],
        ttl_secs: u64,
    ) -> std::result::Result<Vec<SignedUrl>, StorageError> {
        self.sign_batches.fetch_add(1, Ordering::SeqCst);
        let mut urls = Vec::new();
        for key in keys {
            urls.push(SignedUrl {
                key: key.clone(),
                url: self.create_signed_url(bucket, key, ttl_secs).await?,
            });
        }
        Ok(urls)
    }

    async fn remove(&self, bucket: &str, keys: &[String]) -> std::result::Result<(), StorageError> {
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(&(bucket.to_string(), key.clone()));
        }
        Ok(())
    }
}

/// Serves fixed bodies per URL and counts requests. Optionally gated like
/// [`ScriptedSynthesizer`].
#[derive(Default)]
pub struct CountingFetcher {
    bodies: Mutex<HashMap<String, Bytes>>,
    requests: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl CountingFetcher {
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn serve(&self, url: &str, body: &'static [u8]) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), Bytes::from_static(body));
    }

    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetFetcher for CountingFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<Bytes, CacheError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| CacheError::fetch(url, "status 404"))
    }
}
