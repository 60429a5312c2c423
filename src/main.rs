//! narrator-rs: narration generation server.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use narrator::config::Config;
use narrator::narration::api::{self, NarrationApiState};
use narrator::narration::journal::GenerationJournal;
use narrator::narration::queue::GenerationQueue;
use narrator::narration::store::{DirectoryBookSource, NarrationChunkStore};
use narrator::storage::{ChunkRepository, JsonChunkRepository, LocalObjectStorage};
use narrator::synthesis::HttpSynthesizer;

#[derive(Parser, Debug)]
#[command(name = "narrator-rs", about = "Chunked book narration server")]
struct Args {
    /// Path to narrator.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Suppress noisy HTTP internals
    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,hyper_util=info,reqwest=info")
    } else {
        EnvFilter::new("info,hyper=warn,hyper_util=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("narrator-rs starting");

    let mut config = Config::load(args.config.as_deref());
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    info!(
        "Config loaded: voice={}, max_chunk_chars={}, synthesis={}",
        config.narration.voice_id, config.narration.max_chunk_chars, config.synthesis.host
    );

    let objects = Arc::new(LocalObjectStorage::new(
        &config.storage.root,
        &config.server.base_url(),
        &config.storage.signing_secret,
    ));

    let chunks: Arc<dyn ChunkRepository> = if config.storage.metadata_path.as_os_str().is_empty() {
        info!("Chunk records kept in memory only");
        Arc::new(JsonChunkRepository::in_memory())
    } else {
        Arc::new(JsonChunkRepository::open(&config.storage.metadata_path).await?)
    };

    let synthesizer = Arc::new(HttpSynthesizer::new(&config.synthesis)?);
    let books = Arc::new(DirectoryBookSource::new(&config.storage.books_dir));

    let journal = config.journal.enabled.then(|| {
        info!("Generation journal: {}", config.journal.dir.display());
        Arc::new(GenerationJournal::new(&config.journal.dir))
    });

    let mut store = NarrationChunkStore::new(
        books,
        synthesizer,
        objects.clone(),
        chunks,
        config.narration.clone(),
    );
    if let Some(journal) = &journal {
        store = store.with_journal(journal.clone());
    }

    let queue = Arc::new(GenerationQueue::new(
        Arc::new(store),
        config.narration.max_concurrent_generations,
    ));

    let state = NarrationApiState {
        queue: queue.clone(),
        objects,
        journal,
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let shutdown_queue = queue.clone();
    api::serve(state, &addr, async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
        shutdown_queue.shutdown();
    })
    .await?;

    info!("narrator-rs stopped");
    Ok(())
}
