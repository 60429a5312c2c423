//! Reference-counted asset cache with shared in-flight loads.
//!
//! The cache owns every blob handle it issues. A handle is revoked when its
//! count drops to zero through [`AssetCache::release_asset`], or forcibly by
//! [`AssetCache::purge`] and [`AssetCache::clear`].
//!
//! Concurrent misses on one key share a single load running as its own tokio
//! task, so a caller that stops waiting never cancels the load for the others.
//! All count changes happen under the state lock with no await in between, and
//! a caller cancelled while waiting takes no reference.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AssetFetcher, AssetMetadata, AssetMetadataStore, BinaryStore, BlobFactory};
use crate::error::CacheError;

/// Attempts before giving up on a key whose entry keeps vanishing between
/// load completion and registration (concurrent purges).
const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAsset {
    /// A cache-owned blob handle. The caller holds one reference.
    Cached(String),
    /// The load failed; play from the remote URL instead. No reference is held.
    Remote(String),
}

impl ResolvedAsset {
    pub fn url(&self) -> &str {
        match self {
            Self::Cached(url) | Self::Remote(url) => url,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub object_key: String,
    pub blob_url: String,
    pub ref_count: u32,
}

type SharedLoad = Shared<BoxFuture<'static, Result<(), CacheError>>>;

struct PendingLoad {
    id: u64,
    load: SharedLoad,
    /// Callers currently awaiting `load`. A load that finishes with none left
    /// registers no handle.
    waiters: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    pending: HashMap<String, PendingLoad>,
    next_load_id: u64,
}

struct Backends {
    binaries: Arc<dyn BinaryStore>,
    metadata: Arc<dyn AssetMetadataStore>,
    fetcher: Arc<dyn AssetFetcher>,
    blobs: Arc<dyn BlobFactory>,
}

pub struct AssetCache {
    backends: Arc<Backends>,
    state: Arc<Mutex<CacheState>>,
    ttl: Option<Duration>,
}

fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Counts one caller as waiting on a pending load until dropped, whether the
/// wait completed, was cancelled, or the caller's future was dropped.
struct Waiter<'a> {
    state: &'a Mutex<CacheState>,
    key: &'a str,
    id: u64,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.state);
        if let Some(pending) = state.pending.get_mut(self.key) {
            if pending.id == self.id {
                pending.waiters = pending.waiters.saturating_sub(1);
            }
        }
    }
}

impl AssetCache {
    pub fn new(
        binaries: Arc<dyn BinaryStore>,
        metadata: Arc<dyn AssetMetadataStore>,
        fetcher: Arc<dyn AssetFetcher>,
        blobs: Arc<dyn BlobFactory>,
    ) -> Self {
        Self {
            backends: Arc::new(Backends {
                binaries,
                metadata,
                fetcher,
                blobs,
            }),
            state: Arc::new(Mutex::new(CacheState::default())),
            ttl: None,
        }
    }

    /// Expire binaries older than `ttl` regardless of `updated_at`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    /// Resolve `object_key` to a blob handle, fetching `fallback_url` on a miss.
    ///
    /// `updated_at_ms` newer than the stored fetch time purges the cached copy
    /// first. If the load fails, returns [`ResolvedAsset::Remote`] with the
    /// fallback URL. `cancel` only stops this caller's wait: it returns
    /// [`CacheError::Aborted`] and takes no reference.
    pub async fn get_asset(
        &self,
        object_key: &str,
        fallback_url: &str,
        updated_at_ms: Option<i64>,
        cancel: Option<&CancellationToken>,
    ) -> Result<ResolvedAsset, CacheError> {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(CacheError::Aborted);
        }

        self.invalidate_if_stale(object_key, updated_at_ms).await;

        for _ in 0..MAX_ATTEMPTS {
            let (id, load) = {
                let mut state = lock(&self.state);
                if let Some(entry) = state.entries.get_mut(object_key) {
                    entry.ref_count += 1;
                    debug!("Cache hit for {object_key} (refs={})", entry.ref_count);
                    return Ok(ResolvedAsset::Cached(entry.blob_url.clone()));
                }
                if !state.pending.contains_key(object_key) {
                    self.start_load(&mut state, object_key, fallback_url);
                } else {
                    debug!("Joining in-flight load of {object_key}");
                }
                match state.pending.get_mut(object_key) {
                    Some(pending) => {
                        pending.waiters += 1;
                        (pending.id, pending.load.clone())
                    }
                    None => continue,
                }
            };
            let _waiter = Waiter {
                state: &self.state,
                key: object_key,
                id,
            };

            let outcome = match cancel {
                Some(token) => tokio::select! {
                    outcome = load => outcome,
                    _ = token.cancelled() => {
                        debug!("Caller stopped waiting for {object_key}");
                        return Err(CacheError::Aborted);
                    }
                },
                None => load.await,
            };

            if let Err(e) = outcome {
                warn!("Asset load failed, using remote URL: {e}");
                return Ok(ResolvedAsset::Remote(fallback_url.to_string()));
            }

            let mut state = lock(&self.state);
            if let Some(entry) = state.entries.get_mut(object_key) {
                entry.ref_count += 1;
                return Ok(ResolvedAsset::Cached(entry.blob_url.clone()));
            }
            debug!("Entry for {object_key} was purged before registration, retrying");
        }

        warn!("Could not register {object_key} after {MAX_ATTEMPTS} attempts, using remote URL");
        Ok(ResolvedAsset::Remote(fallback_url.to_string()))
    }

    async fn invalidate_if_stale(&self, object_key: &str, updated_at_ms: Option<i64>) {
        let meta = match self.backends.metadata.get_metadata(object_key).await {
            Ok(Some(meta)) => meta,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to read cache metadata for {object_key}: {e}");
                return;
            }
        };

        let changed = updated_at_ms.is_some_and(|u| u > meta.cached_at_ms);
        let expired = self
            .ttl
            .is_some_and(|ttl| now_ms() - meta.cached_at_ms > ttl.as_millis() as i64);
        if changed || expired {
            info!(
                "Cached {object_key} is {}, purging",
                if changed { "stale" } else { "expired" }
            );
            if let Err(e) = self.purge(object_key).await {
                warn!("Failed to purge {object_key}: {e}");
            }
        }
    }

    /// Spawn the shared load for a key. Must be called with the state locked.
    fn start_load(&self, state: &mut CacheState, object_key: &str, fallback_url: &str) {
        state.next_load_id += 1;
        let id = state.next_load_id;

        let backends = self.backends.clone();
        let shared_state = self.state.clone();
        let key = object_key.to_string();
        let url = fallback_url.to_string();

        let handle = tokio::spawn(async move {
            let is_current = || {
                lock(&shared_state)
                    .pending
                    .get(&key)
                    .is_some_and(|p| p.id == id)
            };
            let result = load_bytes(&backends, &key, &url, is_current).await;
            let mut state = lock(&shared_state);
            let current = state.pending.get(&key).is_some_and(|p| p.id == id);
            let waiters = if current {
                state.pending.remove(&key).map(|p| p.waiters)
            } else {
                None
            };
            let bytes = match result {
                Ok(bytes) => bytes,
                Err(e) => return Err(e),
            };

            match waiters {
                None => {
                    debug!("Discarding load of {key} superseded by a purge");
                    return Ok(());
                }
                Some(0) => {
                    debug!("Nobody is waiting for {key} any more, not registering it");
                    return Ok(());
                }
                Some(_) => {}
            }
            if !state.entries.contains_key(&key) {
                let blob_url = backends.blobs.create(bytes);
                state.entries.insert(
                    key.clone(),
                    CacheEntry {
                        object_key: key,
                        blob_url,
                        ref_count: 0,
                    },
                );
            }
            Ok(())
        });

        let key = object_key.to_string();
        let load = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(CacheError::fetch(&key, format!("load task failed: {e}"))),
            }
        }
        .boxed()
        .shared();

        state.pending.insert(
            object_key.to_string(),
            PendingLoad {
                id,
                load,
                waiters: 0,
            },
        );
    }

    /// Drop one reference. The blob handle is revoked when the count reaches zero.
    /// Returns the remaining count, or `None` if the key has no entry.
    pub fn release_asset(&self, object_key: &str) -> Option<u32> {
        let mut state = lock(&self.state);
        let entry = state.entries.get_mut(object_key)?;
        entry.ref_count = entry.ref_count.saturating_sub(1);
        let remaining = entry.ref_count;
        if remaining == 0 {
            if let Some(entry) = state.entries.remove(object_key) {
                self.backends.blobs.revoke(&entry.blob_url);
                debug!("Revoked blob for {object_key}");
            }
        }
        Some(remaining)
    }

    /// Revoke the handle and delete the stored binary and metadata, regardless
    /// of outstanding references. An in-flight load for the key is detached.
    pub async fn purge(&self, object_key: &str) -> Result<(), CacheError> {
        {
            let mut state = lock(&self.state);
            state.pending.remove(object_key);
            if let Some(entry) = state.entries.remove(object_key) {
                self.backends.blobs.revoke(&entry.blob_url);
                if entry.ref_count > 0 {
                    debug!("Purging {object_key} with {} live reference(s)", entry.ref_count);
                }
            }
        }
        self.backends.binaries.delete(object_key).await?;
        self.backends.metadata.delete_metadata(object_key).await?;
        debug!("Purged {object_key}");
        Ok(())
    }

    /// Revoke every handle and empty both persistent stores.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let revoked = {
            let mut state = lock(&self.state);
            state.pending.clear();
            let entries: Vec<CacheEntry> = state.entries.drain().map(|(_, e)| e).collect();
            for entry in &entries {
                self.backends.blobs.revoke(&entry.blob_url);
            }
            entries.len()
        };
        self.backends.binaries.clear().await?;
        self.backends.metadata.clear_metadata().await?;
        info!("Cleared asset cache ({revoked} handles revoked)");
        Ok(())
    }

    pub fn ref_count(&self, object_key: &str) -> Option<u32> {
        lock(&self.state).entries.get(object_key).map(|e| e.ref_count)
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = lock(&self.state).entries.values().cloned().collect();
        entries.sort_by(|a, b| a.object_key.cmp(&b.object_key));
        entries
    }
}

/// Persistent store first, then the network. A fetched binary is written back
/// with its fetch time unless the load was detached by a purge meanwhile;
/// write-back failures only cost the next lookup.
async fn load_bytes(
    backends: &Backends,
    key: &str,
    url: &str,
    is_current: impl Fn() -> bool,
) -> Result<bytes::Bytes, CacheError> {
    match backends.binaries.lookup(key).await {
        Ok(Some(bytes)) => {
            debug!("Cache store hit for {key}");
            return Ok(bytes);
        }
        Ok(None) => debug!("Cache miss for {key}, fetching"),
        Err(e) => warn!("Cache store lookup failed for {key}: {e}"),
    }

    let bytes = backends.fetcher.fetch(url).await?;
    if !is_current() {
        debug!("Load of {key} was purged while fetching, not storing it");
        return Ok(bytes);
    }
    if let Err(e) = backends.binaries.put(key, bytes.clone()).await {
        warn!("Failed to store {key}: {e}");
    } else if let Err(e) = backends
        .metadata
        .put_metadata(AssetMetadata {
            object_key: key.to_string(),
            cached_at_ms: now_ms(),
        })
        .await
    {
        warn!("Failed to record fetch time for {key}: {e}");
    }
    Ok(bytes)
}
