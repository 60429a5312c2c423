//! Speech synthesis engine interface.
//!
//! The engine is opaque: text in, audio bytes plus its own word marks out.
//! `HttpSynthesizer` talks to an engine that serves audio and newline-delimited
//! JSON speech marks from the same endpoint, selected by `output_format`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::SynthesisConfig;
use crate::error::{NarrationError, Result};

/// The engine's own timestamp for one of its word units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechMark {
    pub time: u32,
    pub value: String,
    #[serde(rename = "type", default = "default_mark_type")]
    pub mark_type: String,
}

fn default_mark_type() -> String {
    "word".to_string()
}

impl SpeechMark {
    pub fn word(time: u32, value: impl Into<String>) -> Self {
        Self {
            time,
            value: value.into(),
            mark_type: default_mark_type(),
        }
    }
}

pub struct SynthesisOutput {
    pub audio: Bytes,
    pub marks: Vec<SpeechMark>,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<SynthesisOutput>;
}

/// Parse newline-delimited JSON speech marks, keeping only word marks.
pub fn parse_speech_marks(ndjson: &str) -> Vec<SpeechMark> {
    ndjson
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<SpeechMark>(line) {
            Ok(mark) => Some(mark),
            Err(e) => {
                debug!("Skipping malformed speech mark line: {e}");
                None
            }
        })
        .filter(|mark| mark.mark_type == "word")
        .collect()
}

pub struct HttpSynthesizer {
    host: String,
    engine: String,
    sample_rate: String,
    client: Client,
}

impl HttpSynthesizer {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NarrationError::Synthesis(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            host: config.host.trim_end_matches('/').to_string(),
            engine: config.engine.clone(),
            sample_rate: config.sample_rate.clone(),
            client,
        })
    }

    async fn request(&self, text: &str, voice_id: &str, output_format: &str) -> Result<Bytes> {
        let mut body = json!({
            "text": text,
            "voice_id": voice_id,
            "engine": self.engine,
            "sample_rate": self.sample_rate,
            "output_format": output_format,
            "text_type": "text",
        });
        if output_format == "json" {
            body["speech_mark_types"] = json!(["word"]);
        }

        let url = format!("{}/v1/speech", self.host);
        let resp = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_connect() {
                NarrationError::Synthesis(format!("cannot connect to synthesis engine at {}", self.host))
            } else if e.is_timeout() {
                NarrationError::Synthesis("synthesis request timed out".to_string())
            } else {
                NarrationError::Synthesis(format!("synthesis request failed: {e}"))
            }
        })?;

        if !resp.status().is_success() {
            warn!("Synthesis engine returned status {} for {output_format}", resp.status());
            return Err(NarrationError::Synthesis(format!(
                "engine returned status {}",
                resp.status()
            )));
        }

        resp.bytes()
            .await
            .map_err(|e| NarrationError::Synthesis(format!("failed to read engine response: {e}")))
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<SynthesisOutput> {
        let t0 = Instant::now();

        let (audio, marks_raw) = tokio::try_join!(
            self.request(text, voice_id, "mp3"),
            self.request(text, voice_id, "json"),
        )?;

        if audio.is_empty() {
            return Err(NarrationError::Synthesis("engine returned empty audio".to_string()));
        }

        let marks = parse_speech_marks(&String::from_utf8_lossy(&marks_raw));
        info!(
            "Synthesized {} chars with voice {voice_id}: {} bytes, {} marks ({:.0}ms)",
            text.chars().count(),
            audio.len(),
            marks.len(),
            t0.elapsed().as_secs_f64() * 1000.0
        );

        Ok(SynthesisOutput { audio, marks })
    }
}
