//! Generation journal and reporting.
//!
//! Stores one record per chunk synthesis attempt in daily JSONL files at
//! `{dir}/{date}-narration.jsonl`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::aligner::AlignmentReport;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub timestamp: String,
    pub book_id: String,
    pub voice_id: String,
    pub chunk_index: u32,
    pub input_chars: usize,
    pub word_count: usize,
    pub audio_bytes: usize,
    pub synthesis_latency_ms: i64,
    pub total_latency_ms: i64,
    #[serde(default)]
    pub alignment: AlignmentReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerationRecord {
    pub fn now(book_id: &str, voice_id: &str, chunk_index: u32) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            book_id: book_id.to_string(),
            voice_id: voice_id.to_string(),
            chunk_index,
            input_chars: 0,
            word_count: 0,
            audio_bytes: 0,
            synthesis_latency_ms: 0,
            total_latency_ms: 0,
            alignment: AlignmentReport::default(),
            error: None,
        }
    }
}

pub struct GenerationJournal {
    dir: PathBuf,
}

impl GenerationJournal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{date}-narration.jsonl"))
    }

    /// Append a record to today's file. Failures are logged, never returned.
    pub fn save(&self, record: &GenerationRecord) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("Failed to create journal dir: {e}");
            return;
        }

        let date = Local::now().format("%Y-%m-%d").to_string();
        let path = self.file(&date);

        let mut file = match fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to open journal file: {e}");
                return;
            }
        };

        match serde_json::to_string(record) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!("Failed to write journal record: {e}");
                }
            }
            Err(e) => warn!("Failed to serialize journal record: {e}"),
        }
    }

    pub fn load(&self, date: &str) -> Vec<GenerationRecord> {
        let contents = match fs::read_to_string(self.file(date)) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!("Skipping malformed journal line: {e}");
                    None
                }
            })
            .collect()
    }

    /// Dates with journal files, newest first.
    pub fn list_dates(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let mut dates: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix("-narration.jsonl").map(str::to_string)
            })
            .collect();
        dates.sort_by(|a, b| b.cmp(a));
        dates
    }

    /// Markdown report for `date` (`YYYY-MM-DD` or `today`).
    pub fn report(&self, date: &str) -> String {
        let date = if date == "today" {
            Local::now().format("%Y-%m-%d").to_string()
        } else {
            date.to_string()
        };
        let records = self.load(&date);
        if records.is_empty() {
            return format!("# Narration Report - {date}\n\nNo chunks generated.");
        }

        let total = records.len();
        let failed = records.iter().filter(|r| r.error.is_some()).count();
        let ok: Vec<&GenerationRecord> = records.iter().filter(|r| r.error.is_none()).collect();
        let chars: usize = ok.iter().map(|r| r.input_chars).sum();
        let words: usize = ok.iter().map(|r| r.word_count).sum();
        let audio: usize = ok.iter().map(|r| r.audio_bytes).sum();
        let backfilled: usize = ok.iter().map(|r| r.alignment.backfilled).sum();
        let skipped: usize = ok.iter().map(|r| r.alignment.skipped_marks).sum();
        let avg_synth = if ok.is_empty() {
            0.0
        } else {
            ok.iter().map(|r| r.synthesis_latency_ms as f64).sum::<f64>() / ok.len() as f64
        };

        let mut per_book: BTreeMap<(&str, &str), usize> = BTreeMap::new();
        for r in &ok {
            *per_book.entry((r.book_id.as_str(), r.voice_id.as_str())).or_insert(0) += 1;
        }

        let mut report = format!(
            "# Narration Report - {date}\n\n\
            - Chunks attempted: {total}\n\
            - Failed: {failed}\n\
            - Characters synthesized: {chars}\n\
            - Words timed: {words}\n\
            - Audio: {:.1} KiB\n\
            - Avg synthesis latency: {avg_synth:.0}ms\n\
            - Backfilled words: {backfilled}\n\
            - Skipped marks: {skipped}\n\n\
            ## Books\n",
            audio as f64 / 1024.0
        );

        for ((book, voice), count) in &per_book {
            report.push_str(&format!("- {book} ({voice}): {count} chunks\n"));
        }

        let errors: Vec<&GenerationRecord> = records.iter().filter(|r| r.error.is_some()).collect();
        if !errors.is_empty() {
            report.push_str("\n## Failures\n");
            for r in errors {
                report.push_str(&format!(
                    "- {} {}/{}#{}: {}\n",
                    r.timestamp,
                    r.book_id,
                    r.voice_id,
                    r.chunk_index,
                    r.error.as_deref().unwrap_or_default()
                ));
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_and_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = GenerationJournal::new(dir.path().join("history"));

        let mut ok = GenerationRecord::now("moby", "Kevin", 0);
        ok.input_chars = 1200;
        ok.word_count = 210;
        ok.audio_bytes = 2048;
        ok.synthesis_latency_ms = 900;
        ok.alignment.backfilled = 2;
        journal.save(&ok);

        let mut failed = GenerationRecord::now("moby", "Kevin", 1);
        failed.error = Some("synthesis failed: engine returned status 500".into());
        journal.save(&failed);

        let dates = journal.list_dates();
        assert_eq!(dates.len(), 1);
        assert_eq!(journal.load(&dates[0]).len(), 2);

        let report = journal.report("today");
        assert!(report.contains("Chunks attempted: 2"));
        assert!(report.contains("Failed: 1"));
        assert!(report.contains("Backfilled words: 2"));
        assert!(report.contains("moby (Kevin): 1 chunks"));
        assert!(report.contains("moby/Kevin#1: synthesis failed"));
    }

    #[test]
    fn empty_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = GenerationJournal::new(dir.path());
        assert!(journal.report("2020-01-01").contains("No chunks generated."));
        assert!(journal.list_dates().is_empty());
    }
}
