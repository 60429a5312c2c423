//! Resumable per-chunk narration generation.
//!
//! Per `(book_id, voice_id)`:
//! - first request: tokenize and chunk once, synthesize chunk 0, then write
//!   placeholder rows for every remaining chunk in one batch
//! - populated chunk: returned unchanged, never re-synthesized
//! - placeholder chunk: synthesized, aligned, uploaded and upserted in place
//!
//! A failed synthesis or upload leaves the placeholder untouched, so the
//! caller can retry the same chunk index.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::aligner::{self, AlignmentReport};
use super::journal::{GenerationJournal, GenerationRecord};
use super::{audio_storage_key, NarrationChunkRecord};
use crate::config::NarrationConfig;
use crate::error::{NarrationError, Result};
use crate::storage::{validate_key, ChunkRepository, ObjectStorage};
use crate::synthesis::SpeechSynthesizer;
use crate::text::{chunk_with, tokenize, tokenizer, Chunk, Token};

/// Source of a book's full text.
#[async_trait]
pub trait BookSource: Send + Sync {
    async fn load_text(&self, book_id: &str) -> Result<String>;
}

/// Reads `{dir}/{book_id}.txt`.
pub struct DirectoryBookSource {
    dir: PathBuf,
}

impl DirectoryBookSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl BookSource for DirectoryBookSource {
    async fn load_text(&self, book_id: &str) -> Result<String> {
        validate_id("book_id", book_id)?;
        let path = self.dir.join(format!("{book_id}.txt"));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NarrationError::BookNotFound(book_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// A chunk record with a freshly signed download URL for playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackChunk {
    #[serde(flatten)]
    pub record: NarrationChunkRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
}

pub struct NarrationChunkStore {
    books: Arc<dyn BookSource>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    objects: Arc<dyn ObjectStorage>,
    chunks: Arc<dyn ChunkRepository>,
    journal: Option<Arc<GenerationJournal>>,
    config: NarrationConfig,
}

/// Ids become storage path segments, so they share the object key alphabet.
fn validate_id(field: &str, id: &str) -> Result<()> {
    if id.contains('/') || validate_key(id).is_err() {
        return Err(NarrationError::InvalidRequest(format!("invalid {field}: {id:?}")));
    }
    Ok(())
}

impl NarrationChunkStore {
    pub fn new(
        books: Arc<dyn BookSource>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        objects: Arc<dyn ObjectStorage>,
        chunks: Arc<dyn ChunkRepository>,
        config: NarrationConfig,
    ) -> Self {
        Self {
            books,
            synthesizer,
            objects,
            chunks,
            journal: None,
            config,
        }
    }

    pub fn with_journal(mut self, journal: Arc<GenerationJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &NarrationConfig {
        &self.config
    }

    pub fn default_voice(&self) -> &str {
        &self.config.voice_id
    }

    async fn load_tokens(&self, book_id: &str) -> Result<Vec<Token>> {
        let text = self.books.load_text(book_id).await?;
        Ok(tokenize(&text))
    }

    fn plan_chunks(&self, book_id: &str, tokens: &[Token]) -> Vec<Chunk> {
        let chunks = chunk_with(tokens, self.config.max_chunk_chars, self.config.chunking);
        debug!(
            "Chunked {book_id}: {} tokens into {} chunks (max {} chars, {:?})",
            tokens.len(),
            chunks.len(),
            self.config.max_chunk_chars,
            self.config.chunking
        );
        chunks
    }

    /// Ensure the book/voice has its chunk rows and a populated chunk 0.
    /// Returns every record ordered by chunk index.
    pub async fn ensure_initialized(
        &self,
        book_id: &str,
        voice_id: &str,
    ) -> Result<Vec<NarrationChunkRecord>> {
        validate_id("book_id", book_id)?;
        validate_id("voice_id", voice_id)?;

        let existing = self
            .chunks
            .get_chunks(book_id, voice_id)
            .await
            .map_err(NarrationError::Metadata)?;

        let tokens = self.load_tokens(book_id).await?;
        let plan = self.plan_chunks(book_id, &tokens);
        if plan.is_empty() {
            info!("Book {book_id} has no text to narrate");
            return Ok(existing);
        }
        check_layout(&existing, &plan)?;

        let head_populated = existing
            .first()
            .is_some_and(|r| r.chunk_index == 0 && r.is_populated());
        if existing.len() == plan.len() && head_populated {
            debug!("Narration {book_id}/{voice_id} already initialized");
            return Ok(existing);
        }

        if !head_populated {
            let head = existing
                .first()
                .filter(|r| r.chunk_index == 0)
                .cloned()
                .unwrap_or_else(|| NarrationChunkRecord::placeholder(book_id, voice_id, &plan[0]));
            self.generate(head, &tokens).await?;
        }

        let placeholders: Vec<NarrationChunkRecord> = plan[1..]
            .iter()
            .map(|c| NarrationChunkRecord::placeholder(book_id, voice_id, c))
            .collect();
        let inserted = self
            .chunks
            .insert_placeholders(placeholders)
            .await
            .map_err(NarrationError::Metadata)?;
        info!("Initialized {book_id}/{voice_id}: {inserted} placeholder rows");

        self.chunks
            .get_chunks(book_id, voice_id)
            .await
            .map_err(NarrationError::Metadata)
    }

    /// Ensure chunk `chunk_index` has audio and timings. A populated chunk is
    /// returned as stored, without calling the synthesis engine.
    pub async fn ensure_chunk(
        &self,
        book_id: &str,
        voice_id: &str,
        chunk_index: u32,
    ) -> Result<NarrationChunkRecord> {
        validate_id("book_id", book_id)?;
        validate_id("voice_id", voice_id)?;

        let record = match self
            .chunks
            .get_chunk(book_id, voice_id, chunk_index)
            .await
            .map_err(NarrationError::Metadata)?
        {
            Some(record) => record,
            None => {
                let all = self.ensure_initialized(book_id, voice_id).await?;
                let count = all.len();
                all.into_iter()
                    .find(|r| r.chunk_index == chunk_index)
                    .ok_or(NarrationError::ChunkOutOfRange {
                        index: chunk_index,
                        count,
                    })?
            }
        };

        if record.is_populated() {
            debug!("Chunk {} already populated", record.key());
            return Ok(record);
        }

        let tokens = self.load_tokens(book_id).await?;
        let plan = self.plan_chunks(book_id, &tokens);
        check_layout(std::slice::from_ref(&record), &plan)?;
        self.generate(record, &tokens).await
    }

    async fn generate(
        &self,
        record: NarrationChunkRecord,
        tokens: &[Token],
    ) -> Result<NarrationChunkRecord> {
        let mut entry =
            GenerationRecord::now(&record.book_id, &record.voice_id, record.chunk_index);
        let result = self.synthesize_chunk(record, tokens, &mut entry).await;
        if let Err(e) = &result {
            warn!(
                "Generation of {}/{}#{} failed: {e}",
                entry.book_id, entry.voice_id, entry.chunk_index
            );
            entry.error = Some(e.to_string());
        }
        if let Some(journal) = &self.journal {
            journal.save(&entry);
        }
        result
    }

    async fn synthesize_chunk(
        &self,
        record: NarrationChunkRecord,
        tokens: &[Token],
        entry: &mut GenerationRecord,
    ) -> Result<NarrationChunkRecord> {
        let t0 = Instant::now();
        let slice = tokenizer::slice(tokens, record.start_word_index, record.end_word_index)
            .ok_or_else(|| {
                NarrationError::ChunkBounds(format!(
                    "chunk {} range {}..{} exceeds {} tokens",
                    record.key(),
                    record.start_word_index,
                    record.end_word_index,
                    tokens.len()
                ))
            })?;
        let text = tokenizer::join(slice);
        entry.input_chars = text.chars().count();
        entry.word_count = tokenizer::words(slice).count();

        let t_synth = Instant::now();
        let output = self.synthesizer.synthesize(&text, &record.voice_id).await?;
        entry.synthesis_latency_ms = t_synth.elapsed().as_millis() as i64;
        entry.audio_bytes = output.audio.len();

        let alignment = aligner::align(slice, &output.marks, self.config.default_word_duration_ms);
        entry.alignment = alignment.report;
        log_alignment(&record, &alignment.report);

        let key = audio_storage_key(
            &record.book_id,
            &record.voice_id,
            record.chunk_index,
            &self.config.audio_extension,
        );
        self.objects
            .upload(&self.config.bucket, &key, output.audio, &self.config.content_type)
            .await
            .map_err(|source| NarrationError::Upload {
                key: key.clone(),
                source,
            })?;

        let populated = NarrationChunkRecord {
            audio_storage_key: key,
            timings: alignment.timings,
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
            ..record
        };
        self.chunks
            .upsert_chunk(populated.clone())
            .await
            .map_err(NarrationError::Metadata)?;

        entry.total_latency_ms = t0.elapsed().as_millis() as i64;
        info!(
            "Generated {} ({} chars, {} words) in {}ms",
            populated.key(),
            entry.input_chars,
            entry.word_count,
            entry.total_latency_ms
        );
        Ok(populated)
    }

    /// Attach freshly signed URLs to populated records in one batch call.
    pub async fn resolve_playback(
        &self,
        records: Vec<NarrationChunkRecord>,
    ) -> Result<Vec<PlaybackChunk>> {
        let keys: Vec<String> = records
            .iter()
            .filter(|r| r.is_populated())
            .map(|r| r.audio_storage_key.clone())
            .collect();
        let signed = if keys.is_empty() {
            Vec::new()
        } else {
            self.objects
                .create_signed_urls(&self.config.bucket, &keys, self.config.signed_url_ttl_secs)
                .await
                .map_err(NarrationError::Metadata)?
        };

        Ok(records
            .into_iter()
            .map(|record| {
                let audio_url = signed
                    .iter()
                    .find(|s| s.key == record.audio_storage_key)
                    .map(|s| s.url.clone());
                PlaybackChunk { record, audio_url }
            })
            .collect())
    }

    /// Remove every chunk row of a book/voice and its stored audio.
    /// Returns the number of rows removed.
    pub async fn delete_narration(&self, book_id: &str, voice_id: &str) -> Result<usize> {
        validate_id("book_id", book_id)?;
        validate_id("voice_id", voice_id)?;

        let removed = self
            .chunks
            .delete_chunks(book_id, voice_id)
            .await
            .map_err(NarrationError::Metadata)?;
        let keys: Vec<String> = removed
            .iter()
            .filter(|r| r.is_populated())
            .map(|r| r.audio_storage_key.clone())
            .collect();
        if !keys.is_empty() {
            self.objects
                .remove(&self.config.bucket, &keys)
                .await
                .map_err(NarrationError::Metadata)?;
        }
        info!(
            "Deleted narration {book_id}/{voice_id}: {} rows, {} audio objects",
            removed.len(),
            keys.len()
        );
        Ok(removed.len())
    }
}

/// Stored rows must match the current chunk plan. A mismatch means the book
/// text changed after chunking and stored timings would point at wrong words.
fn check_layout(existing: &[NarrationChunkRecord], plan: &[Chunk]) -> Result<()> {
    for record in existing {
        let matches = plan.get(record.chunk_index as usize).is_some_and(|c| {
            c.start_word_index == record.start_word_index && c.end_word_index == record.end_word_index
        });
        if !matches {
            return Err(NarrationError::ChunkBounds(format!(
                "stored chunk {} ({}..{}) does not match the book text; delete and regenerate",
                record.key(),
                record.start_word_index,
                record.end_word_index
            )));
        }
    }
    Ok(())
}

fn log_alignment(record: &NarrationChunkRecord, report: &AlignmentReport) {
    debug!(
        "Aligned {}: exact={} fuzzy={} merged={} spelled={} substituted={} unspoken={} skipped_marks={} backfilled={}",
        record.key(),
        report.exact,
        report.fuzzy,
        report.merged,
        report.spelled,
        report.substituted,
        report.unspoken,
        report.skipped_marks,
        report.backfilled
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::JsonChunkRepository;
    use crate::testing::{MemoryBookSource, MemoryObjectStorage, ScriptedSynthesizer};

    const BOOK: &str = "Call me Ishmael. Some years ago, never mind how long precisely, \
        having little or no money in my purse, and nothing particular to interest me on shore, \
        I thought I would sail about a little and see the watery part of the world.";

    struct Harness {
        store: NarrationChunkStore,
        synth: Arc<ScriptedSynthesizer>,
        objects: Arc<MemoryObjectStorage>,
        repo: Arc<JsonChunkRepository>,
        books: Arc<MemoryBookSource>,
    }

    fn harness(max_chunk_chars: usize) -> Harness {
        let synth = Arc::new(ScriptedSynthesizer::default());
        let objects = Arc::new(MemoryObjectStorage::default());
        let repo = Arc::new(JsonChunkRepository::in_memory());
        let books = Arc::new(MemoryBookSource::with_book("moby", BOOK));
        let config = NarrationConfig {
            max_chunk_chars,
            ..NarrationConfig::default()
        };
        let store = NarrationChunkStore::new(
            books.clone(),
            synth.clone(),
            objects.clone(),
            repo.clone(),
            config,
        );
        Harness {
            store,
            synth,
            objects,
            repo,
            books,
        }
    }

    #[tokio::test]
    async fn initialization_populates_only_chunk_zero() {
        let h = harness(60);
        let records = h.store.ensure_initialized("moby", "Kevin").await.expect("init");
        assert!(records.len() > 2);
        assert!(records[0].is_populated());
        assert_eq!(records[0].audio_storage_key, "moby/audio/Kevin/0.mp3");
        assert!(records[1..].iter().all(|r| !r.is_populated() && r.timings.is_empty()));
        assert_eq!(h.synth.calls(), 1);
        assert!(h.objects.contains("book-assets", "moby/audio/Kevin/0.mp3"));
        assert_eq!(
            h.objects.content_type("book-assets", "moby/audio/Kevin/0.mp3").as_deref(),
            Some("audio/mpeg")
        );

        for pair in records.windows(2) {
            assert_eq!(pair[0].end_word_index + 1, pair[1].start_word_index);
        }
        let tokens = tokenize(BOOK);
        assert_eq!(
            records.last().map(|r| r.end_word_index as usize),
            Some(tokens.len() - 1)
        );
    }

    #[tokio::test]
    async fn initialization_is_idempotent() {
        let h = harness(60);
        let first = h.store.ensure_initialized("moby", "Kevin").await.expect("init");
        let second = h.store.ensure_initialized("moby", "Kevin").await.expect("init");
        assert_eq!(first, second);
        assert_eq!(h.synth.calls(), 1);
    }

    #[tokio::test]
    async fn populated_chunk_is_never_resynthesized() {
        let h = harness(60);
        h.store.ensure_initialized("moby", "Kevin").await.expect("init");
        let first = h.store.ensure_chunk("moby", "Kevin", 2).await.expect("chunk");
        assert_eq!(h.synth.calls(), 2);
        assert!(first.is_populated());

        let again = h.store.ensure_chunk("moby", "Kevin", 2).await.expect("chunk");
        assert_eq!(again, first);
        assert_eq!(h.synth.calls(), 2);
    }

    #[tokio::test]
    async fn chunk_timings_cover_canonical_words() {
        let h = harness(60);
        h.store.ensure_initialized("moby", "Kevin").await.expect("init");
        let record = h.store.ensure_chunk("moby", "Kevin", 1).await.expect("chunk");
        let tokens = tokenize(BOOK);
        let slice = tokenizer::slice(&tokens, record.start_word_index, record.end_word_index)
            .expect("in range");
        aligner::check_coverage(slice, &record.timings).expect("coverage");
        assert!(record.timings[0].word_index >= record.start_word_index);
    }

    #[tokio::test]
    async fn chunks_generate_out_of_order() {
        let h = harness(40);
        let records = h.store.ensure_initialized("moby", "Kevin").await.expect("init");
        let last = records.len() as u32 - 1;
        h.store.ensure_chunk("moby", "Kevin", last).await.expect("last");
        h.store.ensure_chunk("moby", "Kevin", 1).await.expect("second");
        let rows = h.repo.get_chunks("moby", "Kevin").await.expect("rows");
        let populated: Vec<u32> = rows
            .iter()
            .filter(|r| r.is_populated())
            .map(|r| r.chunk_index)
            .collect();
        assert_eq!(populated, vec![0, 1, last]);
    }

    #[tokio::test]
    async fn ensure_chunk_initializes_lazily() {
        let h = harness(60);
        let record = h.store.ensure_chunk("moby", "Kevin", 1).await.expect("chunk");
        assert!(record.is_populated());
        // chunk 0 eagerly, then chunk 1
        assert_eq!(h.synth.calls(), 2);
    }

    #[tokio::test]
    async fn out_of_range_chunk() {
        let h = harness(1500);
        let err = h.store.ensure_chunk("moby", "Kevin", 5).await.unwrap_err();
        assert!(matches!(err, NarrationError::ChunkOutOfRange { index: 5, count: 1 }));
    }

    #[tokio::test]
    async fn synthesis_failure_leaves_placeholder_untouched() {
        let h = harness(60);
        h.store.ensure_initialized("moby", "Kevin").await.expect("init");
        let before = h.repo.get_chunk("moby", "Kevin", 1).await.expect("get");

        h.synth.set_failing(true);
        let err = h.store.ensure_chunk("moby", "Kevin", 1).await.unwrap_err();
        assert!(matches!(err, NarrationError::Synthesis(_)));
        assert!(err.is_retryable());
        assert_eq!(h.repo.get_chunk("moby", "Kevin", 1).await.expect("get"), before);

        h.synth.set_failing(false);
        let record = h.store.ensure_chunk("moby", "Kevin", 1).await.expect("retry");
        assert!(record.is_populated());
    }

    #[tokio::test]
    async fn upload_failure_leaves_placeholder_untouched() {
        let h = harness(60);
        h.store.ensure_initialized("moby", "Kevin").await.expect("init");
        h.objects.set_failing(true);
        let err = h.store.ensure_chunk("moby", "Kevin", 1).await.unwrap_err();
        assert!(matches!(err, NarrationError::Upload { .. }));
        let row = h.repo.get_chunk("moby", "Kevin", 1).await.expect("get").expect("row");
        assert!(!row.is_populated());
    }

    #[tokio::test]
    async fn failed_head_synthesis_writes_nothing() {
        let h = harness(60);
        h.synth.set_failing(true);
        assert!(h.store.ensure_initialized("moby", "Kevin").await.is_err());
        assert!(h.repo.get_chunks("moby", "Kevin").await.expect("rows").is_empty());

        h.synth.set_failing(false);
        let records = h.store.ensure_initialized("moby", "Kevin").await.expect("retry");
        assert!(records[0].is_populated());
    }

    #[tokio::test]
    async fn concurrent_requests_converge_on_one_row() {
        let h = harness(60);
        h.store.ensure_initialized("moby", "Kevin").await.expect("init");
        let (a, b) = tokio::join!(
            h.store.ensure_chunk("moby", "Kevin", 1),
            h.store.ensure_chunk("moby", "Kevin", 1)
        );
        assert_eq!(a.expect("a").audio_storage_key, b.expect("b").audio_storage_key);
        let rows = h.repo.get_chunks("moby", "Kevin").await.expect("rows");
        assert_eq!(rows.iter().filter(|r| r.chunk_index == 1).count(), 1);
    }

    #[tokio::test]
    async fn voices_are_independent() {
        let h = harness(60);
        h.store.ensure_initialized("moby", "Kevin").await.expect("kevin");
        h.store.ensure_initialized("moby", "Joanna").await.expect("joanna");
        assert_eq!(h.synth.calls(), 2);
        assert!(h.objects.contains("book-assets", "moby/audio/Joanna/0.mp3"));
    }

    #[tokio::test]
    async fn playback_signs_populated_chunks_only() {
        let h = harness(60);
        let records = h.store.ensure_initialized("moby", "Kevin").await.expect("init");
        let playback = h.store.resolve_playback(records).await.expect("sign");
        assert!(playback[0].audio_url.as_deref().is_some_and(|u| u.contains("moby/audio/Kevin/0.mp3")));
        assert!(playback[1..].iter().all(|p| p.audio_url.is_none()));
        assert_eq!(h.objects.sign_batches(), 1);

        let json = serde_json::to_value(&playback[0]).expect("json");
        assert_eq!(json["audio_storage_key"], "moby/audio/Kevin/0.mp3");
        assert!(json["audio_url"].is_string());
    }

    #[tokio::test]
    async fn delete_cascades_rows_and_audio() {
        let h = harness(60);
        let records = h.store.ensure_initialized("moby", "Kevin").await.expect("init");
        h.store.ensure_chunk("moby", "Kevin", 1).await.expect("chunk");
        let removed = h.store.delete_narration("moby", "Kevin").await.expect("delete");
        assert_eq!(removed, records.len());
        assert!(!h.objects.contains("book-assets", "moby/audio/Kevin/0.mp3"));
        assert!(!h.objects.contains("book-assets", "moby/audio/Kevin/1.mp3"));
        assert!(h.repo.get_chunks("moby", "Kevin").await.expect("rows").is_empty());
    }

    #[tokio::test]
    async fn changed_text_is_detected() {
        let h = harness(60);
        h.store.ensure_initialized("moby", "Kevin").await.expect("init");
        let mut row = h.repo.get_chunk("moby", "Kevin", 1).await.expect("get").expect("row");
        row.end_word_index += 1;
        h.repo.upsert_chunk(row).await.expect("upsert");
        let err = h.store.ensure_initialized("moby", "Kevin").await.unwrap_err();
        assert!(matches!(err, NarrationError::ChunkBounds(_)));
    }

    #[tokio::test]
    async fn edited_text_is_not_narrated_into_old_rows() {
        let h = harness(60);
        let records = h.store.ensure_initialized("moby", "Kevin").await.expect("init");
        assert!(records.len() > 2);

        h.books.set_text(
            "moby",
            "It was the best of times, it was the worst of times, it was the age of wisdom, \
             it was the age of foolishness, it was the epoch of belief.",
        );
        let err = h.store.ensure_chunk("moby", "Kevin", 1).await.unwrap_err();
        assert!(matches!(err, NarrationError::ChunkBounds(_)));
        assert_eq!(h.synth.calls(), 1);

        let row = h.repo.get_chunk("moby", "Kevin", 1).await.expect("get").expect("row");
        assert!(!row.is_populated());
        // populated rows are still served as stored
        let head = h.store.ensure_chunk("moby", "Kevin", 0).await.expect("head");
        assert_eq!(head, records[0]);
    }

    #[tokio::test]
    async fn unknown_book_and_bad_ids() {
        let h = harness(60);
        assert!(matches!(
            h.store.ensure_initialized("nope", "Kevin").await,
            Err(NarrationError::BookNotFound(_))
        ));
        assert!(matches!(
            h.store.ensure_initialized("../etc", "Kevin").await,
            Err(NarrationError::InvalidRequest(_))
        ));
        assert!(matches!(
            h.store.ensure_chunk("moby", "a/b", 0).await,
            Err(NarrationError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn directory_book_source_reads_txt_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("moby.txt"), BOOK).expect("write");
        let books = DirectoryBookSource::new(dir.path());
        assert_eq!(books.load_text("moby").await.expect("text"), BOOK);
        assert!(matches!(
            books.load_text("missing").await,
            Err(NarrationError::BookNotFound(_))
        ));
    }
}
