//! narrator-client: command-line client for the narration server.
//!
//! Requests narration, exports audio through the local asset cache, and
//! inspects jobs and generation reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use narrator::assets::{
    object_key_from_url, AssetCache, DiskAssetStore, HttpFetcher, MemoryBlobStore, ResolvedAsset,
};
use narrator::config::Config;
use narrator::narration::store::PlaybackChunk;

#[derive(Parser, Debug)]
#[command(name = "narrator-client", about = "Client for the narrator-rs server")]
struct Args {
    /// Path to narrator.yaml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Server base URL (defaults to the configured server address)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resume narration of a book, or ensure a single chunk
    Narrate {
        book_id: String,
        #[arg(long)]
        voice: Option<String>,
        #[arg(long)]
        chunk: Option<u32>,
    },
    /// Generate every chunk and write audio plus timings to a directory
    Export {
        book_id: String,
        #[arg(long)]
        voice: Option<String>,
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
    /// Queue background generation for a book
    Prefetch {
        book_id: String,
        #[arg(long)]
        voice: Option<String>,
        /// Chunk indices to queue (default: every missing chunk)
        #[arg(long, value_delimiter = ',')]
        chunks: Option<Vec<u32>>,
    },
    /// List generation jobs
    Jobs,
    /// Print the generation report for a date (YYYY-MM-DD or "today")
    Report {
        #[arg(default_value = "today")]
        date: String,
    },
    /// Delete a book's narration for one voice
    Delete { book_id: String, voice: String },
    /// Empty the local asset cache
    CacheClear,
}

#[derive(Deserialize)]
struct ChunkList {
    chunks: Vec<PlaybackChunk>,
}

#[derive(Deserialize)]
struct SingleChunk {
    chunk: PlaybackChunk,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

struct ServerClient {
    base: String,
    http: Client,
}

impl ServerClient {
    fn new(base: &str) -> Result<Self, reqwest::Error> {
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http: Client::builder().timeout(Duration::from_secs(300)).build()?,
        })
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, Box<dyn std::error::Error>> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|b| b.error)
            .unwrap_or_else(|| "no details".into());
        Err(format!("server returned {status}: {message}").into())
    }

    async fn post(&self, path: &str, body: Value) -> Result<reqwest::Response, Box<dyn std::error::Error>> {
        let resp = self.http.post(format!("{}{path}", self.base)).json(&body).send().await?;
        Self::check(resp).await
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, Box<dyn std::error::Error>> {
        let resp = self.http.get(format!("{}{path}", self.base)).send().await?;
        Self::check(resp).await
    }

    async fn narrate_all(
        &self,
        book_id: &str,
        voice: Option<&str>,
    ) -> Result<Vec<PlaybackChunk>, Box<dyn std::error::Error>> {
        let resp = self
            .post("/narration", json!({ "book_id": book_id, "voice_id": voice }))
            .await?;
        Ok(resp.json::<ChunkList>().await?.chunks)
    }

    async fn narrate_chunk(
        &self,
        book_id: &str,
        voice: Option<&str>,
        index: u32,
    ) -> Result<PlaybackChunk, Box<dyn std::error::Error>> {
        let resp = self
            .post(
                "/narration",
                json!({ "book_id": book_id, "voice_id": voice, "chunk_index": index }),
            )
            .await?;
        Ok(resp.json::<SingleChunk>().await?.chunk)
    }
}

fn print_chunk(chunk: &PlaybackChunk) {
    let r = &chunk.record;
    let state = if r.is_populated() { "ready" } else { "pending" };
    println!(
        "{:>4}  words {:>6}-{:<6}  {:<7}  {} timings",
        r.chunk_index,
        r.start_word_index,
        r.end_word_index,
        state,
        r.timings.len()
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,hyper_util=info,reqwest=info")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref());
    let base = args.server.unwrap_or_else(|| config.server.base_url());
    let client = ServerClient::new(&base)?;

    match args.command {
        Command::Narrate { book_id, voice, chunk } => match chunk {
            None => {
                let chunks = client.narrate_all(&book_id, voice.as_deref()).await?;
                let ready = chunks.iter().filter(|c| c.record.is_populated()).count();
                println!("{book_id}: {} chunks, {ready} ready", chunks.len());
                chunks.iter().for_each(print_chunk);
            }
            Some(index) => {
                let chunk = client.narrate_chunk(&book_id, voice.as_deref(), index).await?;
                print_chunk(&chunk);
                if let Some(url) = &chunk.audio_url {
                    println!("{url}");
                }
            }
        },
        Command::Export { book_id, voice, out } => {
            export(&client, &config, &book_id, voice.as_deref(), &out).await?;
        }
        Command::Prefetch { book_id, voice, chunks } => {
            let resp = client
                .post(
                    "/narration/prefetch",
                    json!({ "book_id": book_id, "voice_id": voice, "chunk_indices": chunks }),
                )
                .await?;
            let body: Value = resp.json().await?;
            println!("queued {}", body["queued"].as_u64().unwrap_or(0));
        }
        Command::Jobs => {
            let jobs: Value = client.get("/narration/jobs").await?.json().await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        Command::Report { date } => {
            let report = client
                .get(&format!("/narration/report?date={date}"))
                .await?
                .text()
                .await?;
            println!("{report}");
        }
        Command::Delete { book_id, voice } => {
            let resp = client
                .http
                .delete(format!("{}/narration/{book_id}/{voice}", client.base))
                .send()
                .await?;
            let body: Value = ServerClient::check(resp).await?.json().await?;
            println!("deleted {} chunk(s)", body["deleted"].as_u64().unwrap_or(0));
        }
        Command::CacheClear => {
            let cache = open_cache(&config)?;
            cache.cache.clear().await?;
            println!("Cleared {}", config.cache.dir.display());
        }
    }

    Ok(())
}

struct LocalCache {
    cache: AssetCache,
    blobs: Arc<MemoryBlobStore>,
}

fn open_cache(config: &Config) -> Result<LocalCache, Box<dyn std::error::Error>> {
    let store = Arc::new(DiskAssetStore::new(&config.cache.dir));
    let blobs = Arc::new(MemoryBlobStore::default());
    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(120))?);
    let cache = AssetCache::new(store.clone(), store, fetcher, blobs.clone())
        .with_ttl(Duration::from_secs(config.cache.ttl_secs));
    Ok(LocalCache { cache, blobs })
}

/// Ensure every chunk, then copy audio out of the cache as `{index}.mp3`
/// with a `{index}.json` timings sidecar.
async fn export(
    client: &ServerClient,
    config: &Config,
    book_id: &str,
    voice: Option<&str>,
    out: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let local = open_cache(config)?;
    tokio::fs::create_dir_all(out).await?;

    let chunks = client.narrate_all(book_id, voice).await?;
    info!("Exporting {} chunks of {book_id} to {}", chunks.len(), out.display());

    let mut written = 0usize;
    for listed in chunks {
        let chunk = if listed.record.is_populated() && listed.audio_url.is_some() {
            listed
        } else {
            client
                .narrate_chunk(book_id, voice, listed.record.chunk_index)
                .await?
        };
        let record = &chunk.record;
        let Some(url) = chunk.audio_url.as_deref() else {
            warn!("Chunk {} has no audio URL, skipping", record.chunk_index);
            continue;
        };
        let key = if record.audio_storage_key.is_empty() {
            object_key_from_url(url).unwrap_or_else(|| url.to_string())
        } else {
            record.audio_storage_key.clone()
        };

        match local
            .cache
            .get_asset(&key, url, Some(record.updated_at_ms), None)
            .await?
        {
            ResolvedAsset::Cached(blob_url) => {
                let bytes = local.blobs.get(&blob_url);
                local.cache.release_asset(&key);
                let Some(bytes) = bytes else {
                    warn!("Blob for {key} vanished before export");
                    continue;
                };
                let ext = &config.narration.audio_extension;
                tokio::fs::write(out.join(format!("{}.{ext}", record.chunk_index)), &bytes).await?;
            }
            ResolvedAsset::Remote(_) => {
                warn!("Could not download chunk {}, skipping", record.chunk_index);
                continue;
            }
        }

        let timings = serde_json::to_vec_pretty(&record.timings)?;
        tokio::fs::write(out.join(format!("{}.json", record.chunk_index)), timings).await?;
        written += 1;
    }

    println!("Exported {written} chunk(s) to {}", out.display());
    Ok(())
}
