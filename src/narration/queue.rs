//! Supervised background chunk generation.
//!
//! Each submitted chunk runs as a tokio task whose progress is published on a
//! `watch` channel. Callers get a [`GenerationTicket`] they can poll or await;
//! dropping the ticket does not stop the job. Jobs for the same chunk are
//! deduplicated while in flight. A semaphore bounds how many background jobs
//! synthesize at once; on-demand jobs from [`GenerationQueue::submit_now`]
//! bypass it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::NarrationChunkStore;
use super::{ChunkKey, NarrationChunkRecord};
use crate::error::NarrationError;

#[derive(Debug, Clone)]
pub enum JobState {
    Queued,
    Running,
    Done(NarrationChunkRecord),
    Failed(Arc<NarrationError>),
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done(_) => "done",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed(_))
    }
}

pub struct GenerationTicket {
    key: ChunkKey,
    rx: watch::Receiver<JobState>,
}

impl GenerationTicket {
    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    pub fn status(&self) -> JobState {
        self.rx.borrow().clone()
    }

    /// Wait for the job to finish.
    pub async fn wait(mut self) -> Result<NarrationChunkRecord, Arc<NarrationError>> {
        let finished = match self.rx.wait_for(JobState::is_finished).await {
            Ok(state) => state.clone(),
            // Sender dropped without a final state: the task panicked or was aborted.
            Err(_) => JobState::Failed(Arc::new(NarrationError::Shutdown)),
        };
        match finished {
            JobState::Done(record) => Ok(record),
            JobState::Failed(e) => Err(e),
            JobState::Queued | JobState::Running => Err(Arc::new(NarrationError::Shutdown)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub book_id: String,
    pub voice_id: String,
    pub chunk_index: u32,
    pub state: &'static str,
    pub submitted_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobSnapshot {
    fn new(key: &ChunkKey, state: &JobState, submitted_at: &str) -> Self {
        Self {
            book_id: key.book_id.clone(),
            voice_id: key.voice_id.clone(),
            chunk_index: key.chunk_index,
            state: state.name(),
            submitted_at: submitted_at.to_string(),
            error: match state {
                JobState::Failed(e) => Some(e.to_string()),
                _ => None,
            },
        }
    }
}

/// Finished jobs kept for `jobs()` listings. Only snapshots are retained;
/// the chunk record itself lives on in the tickets that waited for it.
const FINISHED_HISTORY: usize = 64;

struct Job {
    id: u64,
    tx: watch::Sender<JobState>,
    submitted_at: String,
    /// Cancelled to let a queued job start without waiting for a permit.
    promote: CancellationToken,
}

#[derive(Default)]
struct JobTable {
    active: HashMap<ChunkKey, Job>,
    finished: VecDeque<JobSnapshot>,
    next_id: u64,
}

impl JobTable {
    fn record_finished(&mut self, snapshot: JobSnapshot) {
        if self.finished.len() == FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back(snapshot);
    }
}

fn lock(jobs: &Mutex<JobTable>) -> MutexGuard<'_, JobTable> {
    jobs.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct GenerationQueue {
    store: Arc<NarrationChunkStore>,
    permits: Arc<Semaphore>,
    jobs: Arc<Mutex<JobTable>>,
    shutdown: CancellationToken,
}

impl GenerationQueue {
    pub fn new(store: Arc<NarrationChunkStore>, max_concurrent: usize) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            jobs: Arc::new(Mutex::new(JobTable::default())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<NarrationChunkStore> {
        &self.store
    }

    /// Queue a chunk for background generation, or join the job already in
    /// flight for it. Starts once a concurrency permit is free.
    pub fn submit(&self, book_id: &str, voice_id: &str, chunk_index: u32) -> GenerationTicket {
        self.enqueue(book_id, voice_id, chunk_index, false)
    }

    /// Generate a chunk a reader is waiting on. Runs at once without taking a
    /// permit, so queued prefetch work never delays it. A queued job for the
    /// same chunk is joined and started immediately.
    pub fn submit_now(&self, book_id: &str, voice_id: &str, chunk_index: u32) -> GenerationTicket {
        self.enqueue(book_id, voice_id, chunk_index, true)
    }

    fn enqueue(
        &self,
        book_id: &str,
        voice_id: &str,
        chunk_index: u32,
        urgent: bool,
    ) -> GenerationTicket {
        let key = ChunkKey {
            book_id: book_id.to_string(),
            voice_id: voice_id.to_string(),
            chunk_index,
        };

        let mut jobs = lock(&self.jobs);
        if let Some(job) = jobs.active.get(&key) {
            if urgent && !job.promote.is_cancelled() {
                debug!("Promoting queued generation of {key}");
                job.promote.cancel();
            }
            debug!("Joining in-flight generation of {key}");
            return GenerationTicket {
                key,
                rx: job.tx.subscribe(),
            };
        }

        let submitted_at = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        let (tx, rx) = watch::channel(JobState::Queued);
        if self.shutdown.is_cancelled() {
            let state = JobState::Failed(Arc::new(NarrationError::Shutdown));
            jobs.record_finished(JobSnapshot::new(&key, &state, &submitted_at));
            tx.send_replace(state);
            return GenerationTicket { key, rx };
        }

        jobs.next_id += 1;
        let id = jobs.next_id;
        let promote = CancellationToken::new();
        if urgent {
            promote.cancel();
        }
        self.spawn_job(id, key.clone(), tx.clone(), promote.clone());
        jobs.active.insert(
            key.clone(),
            Job {
                id,
                tx,
                submitted_at,
                promote,
            },
        );
        GenerationTicket { key, rx }
    }

    fn spawn_job(
        &self,
        id: u64,
        key: ChunkKey,
        tx: watch::Sender<JobState>,
        promote: CancellationToken,
    ) {
        let store = self.store.clone();
        let permits = self.permits.clone();
        let shutdown = self.shutdown.clone();
        let jobs = self.jobs.clone();

        tokio::spawn(async move {
            let finish = |state: JobState| {
                let mut jobs = lock(&jobs);
                let current = jobs.active.get(&key).is_some_and(|j| j.id == id);
                let submitted_at = if current {
                    jobs.active
                        .remove(&key)
                        .map(|j| j.submitted_at)
                        .unwrap_or_default()
                } else {
                    String::new()
                };
                jobs.record_finished(JobSnapshot::new(&key, &state, &submitted_at));
                // Sent under the lock so a finished ticket never sees the job still listed.
                tx.send_replace(state);
            };

            let _permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Dropping queued generation of {key}");
                    finish(JobState::Failed(Arc::new(NarrationError::Shutdown)));
                    return;
                }
                _ = promote.cancelled() => None,
                permit = permits.acquire_owned() => match permit {
                    Ok(p) => Some(p),
                    Err(_) => {
                        finish(JobState::Failed(Arc::new(NarrationError::Shutdown)));
                        return;
                    }
                },
            };

            tx.send_replace(JobState::Running);
            let state = match store
                .ensure_chunk(&key.book_id, &key.voice_id, key.chunk_index)
                .await
            {
                Ok(record) => JobState::Done(record),
                Err(e) => {
                    warn!("Background generation of {key} failed: {e}");
                    JobState::Failed(Arc::new(e))
                }
            };
            finish(state);
        });
    }

    /// Enqueue several chunks. With no indices, every unpopulated chunk is
    /// enqueued (initializing the book first if needed).
    pub async fn prefetch(
        &self,
        book_id: &str,
        voice_id: &str,
        chunk_indices: Option<Vec<u32>>,
    ) -> Result<Vec<GenerationTicket>, NarrationError> {
        let indices = match chunk_indices {
            Some(indices) => indices,
            None => self
                .store
                .ensure_initialized(book_id, voice_id)
                .await?
                .into_iter()
                .filter(|r| !r.is_populated())
                .map(|r| r.chunk_index)
                .collect(),
        };
        info!(
            "Prefetching {} chunk(s) of {book_id}/{voice_id}",
            indices.len()
        );
        Ok(indices
            .into_iter()
            .map(|i| self.submit(book_id, voice_id, i))
            .collect())
    }

    /// In-flight jobs ordered by key, then recently finished ones, oldest first.
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let jobs = lock(&self.jobs);
        let mut active: Vec<(&ChunkKey, &Job)> = jobs.active.iter().collect();
        active.sort_by(|a, b| a.0.cmp(b.0));
        active
            .into_iter()
            .map(|(key, job)| JobSnapshot::new(key, &job.tx.borrow(), &job.submitted_at))
            .chain(jobs.finished.iter().cloned())
            .collect()
    }

    /// Jobs queued or running right now.
    pub fn in_flight(&self) -> usize {
        lock(&self.jobs).active.len()
    }

    /// Forget the finished-job history. Returns how many entries were removed.
    pub fn clear_finished(&self) -> usize {
        let mut jobs = lock(&self.jobs);
        let removed = jobs.finished.len();
        jobs.finished.clear();
        removed
    }

    /// Stop starting new work. Queued jobs fail with `Shutdown`; running jobs finish.
    pub fn shutdown(&self) {
        info!("Generation queue shutting down");
        self.shutdown.cancel();
    }
}
