//! Configuration management for narrator-rs.
//!
//! Loads config from YAML files in standard locations. Every section and
//! field is optional; missing values fall back to defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::text::ChunkStrategy;

fn home_path(rel: &str) -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(rel))
        .unwrap_or_else(|| PathBuf::from(rel))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NarrationConfig {
    pub voice_id: String,
    pub max_chunk_chars: usize,
    pub chunking: ChunkStrategy,
    pub default_word_duration_ms: u32,
    pub audio_extension: String,
    pub content_type: String,
    pub bucket: String,
    pub signed_url_ttl_secs: u64,
    pub max_concurrent_generations: usize,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            voice_id: "Kevin".into(),
            max_chunk_chars: 1500,
            chunking: ChunkStrategy::Greedy,
            default_word_duration_ms: 300,
            audio_extension: "mp3".into(),
            content_type: "audio/mpeg".into(),
            bucket: "book-assets".into(),
            signed_url_ttl_secs: 3600,
            max_concurrent_generations: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base URL used in signed object links. Derived from host/port when empty.
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8770,
            public_url: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        if self.public_url.is_empty() {
            format!("http://{}:{}", self.host, self.port)
        } else {
            self.public_url.trim_end_matches('/').to_string()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Object storage root; buckets are subdirectories.
    pub root: PathBuf,
    /// Chunk record store. Empty keeps records in memory only.
    pub metadata_path: PathBuf,
    /// Book texts, one `{book_id}.txt` per book.
    pub books_dir: PathBuf,
    pub signing_secret: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: home_path(".local/share/narrator/objects"),
            metadata_path: home_path(".local/share/narrator/chunks.json"),
            books_dir: home_path(".local/share/narrator/books"),
            signing_secret: "change-me".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub host: String,
    pub engine: String,
    pub sample_rate: String,
    pub timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:5002".into(),
            engine: "standard".into(),
            sample_rate: "22050".into(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: dirs::cache_dir()
                .map(|c| c.join("narrator/assets"))
                .unwrap_or_else(|| home_path(".cache/narrator/assets")),
            ttl_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: home_path(".narrator-history"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub narration: NarrationConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub synthesis: SynthesisConfig,
    pub cache: CacheConfig,
    pub journal: JournalConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./narrator.yaml
    /// 2. ~/.config/narrator/narrator.yaml
    /// 3. /etc/narrator/narrator.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("narrator.yaml")),
                dirs::home_dir().map(|h| h.join(".config/narrator/narrator.yaml")),
                Some(PathBuf::from("/etc/narrator/narrator.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}
