//! Maps a synthesis engine's word marks onto canonical word indices.
//!
//! Two pointers walk the chunk's canonical word tokens and the engine's marks.
//! Both sides are compared on a normalized key (lowercase alphanumerics only),
//! so "cats" matches "cat's" and "hat." matches "hat". Each canonical word gets
//! exactly one timing, in increasing index order with non-decreasing starts.
//!
//! Per step, in order:
//! 1. exact key match: pair word and mark
//! 2. spelled-out hyphen word ("B-U-R-P" spoken as "B","U","R","P"): one timing
//!    spanning all part marks
//! 3. merged words (2 to 4 canonical words spoken as one mark): split the mark's
//!    span by normalized character length, `t0 + span * chars_before / total`
//! 4. prefix match either way: pair word and mark
//! 5. resync within [`MAX_LOOKAHEAD`]: skip extra marks, or give skipped
//!    canonical words a zero-length timing at the current mark; the shorter
//!    jump wins and ties skip marks
//! 6. otherwise pair word and mark as a substitution
//!
//! Words left over when marks run out are backfilled at the last mark time.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::WordTiming;
use crate::synthesis::SpeechMark;
use crate::text::Token;

pub const MAX_LOOKAHEAD: usize = 10;
const MAX_MERGED_WORDS: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentReport {
    pub exact: usize,
    pub fuzzy: usize,
    pub merged: usize,
    pub spelled: usize,
    pub substituted: usize,
    /// Canonical words the engine never voiced, given zero-length timings.
    pub unspoken: usize,
    pub skipped_marks: usize,
    /// Words timed at the last mark because the engine stopped early.
    pub backfilled: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alignment {
    pub timings: Vec<WordTiming>,
    pub report: AlignmentReport,
}

struct Word<'a> {
    index: u32,
    text: &'a str,
    key: String,
}

struct Mark {
    time: u32,
    key: String,
}

/// Comparison key: lowercase letters and digits only.
pub fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn keys_match(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && (a == b || a.starts_with(b) || b.starts_with(a))
}

struct Aligner<'a> {
    words: Vec<Word<'a>>,
    marks: Vec<Mark>,
    default_word_duration_ms: u32,
    timings: Vec<WordTiming>,
    report: AlignmentReport,
    last_start: u32,
}

impl Aligner<'_> {
    fn emit(&mut self, word_index: u32, start_ms: u32, end_ms: u32) {
        let start_ms = start_ms.max(self.last_start);
        let end_ms = end_ms.max(start_ms);
        self.last_start = start_ms;
        self.timings.push(WordTiming {
            word_index,
            start_ms,
            end_ms,
        });
    }

    /// End of mark `m`: the next mark's time, or a default duration for the last one.
    fn mark_end(&self, m: usize) -> u32 {
        match self.marks.get(m + 1) {
            Some(next) => next.time,
            None => self.marks[m].time.saturating_add(self.default_word_duration_ms),
        }
    }

    /// Number of marks spelling out the hyphen parts of word `w` starting at mark `m`.
    fn spelled_parts(&self, w: usize, m: usize) -> Option<usize> {
        let word = &self.words[w];
        if !word.text.contains('-') {
            return None;
        }
        let parts: Vec<String> = word
            .text
            .split('-')
            .map(normalize)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.len() < 2 || m + parts.len() > self.marks.len() {
            return None;
        }
        let all_match = parts
            .iter()
            .zip(&self.marks[m..])
            .all(|(part, mark)| *part == mark.key);
        all_match.then_some(parts.len())
    }

    /// Number of canonical words starting at `w` whose keys concatenate to mark `m`.
    fn merged_words(&self, w: usize, m: usize) -> Option<usize> {
        let target = &self.marks[m].key;
        let mut joined = self.words[w].key.clone();
        for n in 2..=MAX_MERGED_WORDS {
            let next = self.words.get(w + n - 1)?;
            joined.push_str(&next.key);
            if joined == *target {
                return Some(n);
            }
            if !target.starts_with(joined.as_str()) {
                return None;
            }
        }
        None
    }

    fn emit_merged(&mut self, w: usize, n: usize, m: usize) {
        let t0 = self.marks[m].time;
        let t1 = self.mark_end(m).max(t0);
        let span = u64::from(t1 - t0);
        let lens: Vec<u64> = self.words[w..w + n]
            .iter()
            .map(|word| word.key.chars().count() as u64)
            .collect();
        let total: u64 = lens.iter().sum::<u64>().max(1);

        let mut before = 0u64;
        for (k, len) in lens.iter().enumerate() {
            let start = t0 + (span * before / total) as u32;
            before += len;
            let end = t0 + (span * before / total) as u32;
            let index = self.words[w + k].index;
            self.emit(index, start, end);
        }
    }

    fn resync(&self, w: usize, m: usize) -> Option<Resync> {
        let word_key = &self.words[w].key;
        let mark_key = &self.marks[m].key;

        let skip_marks = (1..=MAX_LOOKAHEAD)
            .take_while(|k| m + k < self.marks.len())
            .find(|k| keys_match(word_key, &self.marks[m + k].key));
        let skip_words = (1..=MAX_LOOKAHEAD)
            .take_while(|k| w + k < self.words.len())
            .find(|k| keys_match(&self.words[w + k].key, mark_key));

        match (skip_marks, skip_words) {
            (Some(a), Some(b)) if a <= b => Some(Resync::SkipMarks(a)),
            (_, Some(b)) => Some(Resync::SkipWords(b)),
            (Some(a), None) => Some(Resync::SkipMarks(a)),
            (None, None) => None,
        }
    }

    fn run(mut self) -> Alignment {
        let (mut w, mut m) = (0usize, 0usize);

        while w < self.words.len() && m < self.marks.len() {
            let t = self.marks[m].time;
            let index = self.words[w].index;

            if self.words[w].key.is_empty() {
                self.emit(index, t, t);
                self.report.unspoken += 1;
                w += 1;
                continue;
            }

            if self.words[w].key == self.marks[m].key {
                let end = self.mark_end(m);
                self.emit(index, t, end);
                self.report.exact += 1;
                w += 1;
                m += 1;
                continue;
            }

            if let Some(parts) = self.spelled_parts(w, m) {
                let end = self.mark_end(m + parts - 1);
                self.emit(index, t, end);
                self.report.spelled += 1;
                w += 1;
                m += parts;
                continue;
            }

            if let Some(n) = self.merged_words(w, m) {
                self.emit_merged(w, n, m);
                self.report.merged += n;
                w += n;
                m += 1;
                continue;
            }

            if keys_match(&self.words[w].key, &self.marks[m].key) {
                let end = self.mark_end(m);
                self.emit(index, t, end);
                self.report.fuzzy += 1;
                w += 1;
                m += 1;
                continue;
            }

            match self.resync(w, m) {
                Some(Resync::SkipMarks(k)) => {
                    debug!("Skipping {k} unmatched speech mark(s) before word {index}");
                    self.report.skipped_marks += k;
                    m += k;
                }
                Some(Resync::SkipWords(k)) => {
                    for j in w..w + k {
                        let skipped = self.words[j].index;
                        self.emit(skipped, t, t);
                    }
                    self.report.unspoken += k;
                    w += k;
                }
                None => {
                    let end = self.mark_end(m);
                    self.emit(index, t, end);
                    self.report.substituted += 1;
                    w += 1;
                    m += 1;
                }
            }
        }

        if w < self.words.len() {
            let last = self.marks.last().map(|mk| mk.time).unwrap_or(0);
            let remaining = self.words.len() - w;
            warn!(
                "Speech marks ran out with {remaining} word(s) left (first index {}); backfilling at {last}ms",
                self.words[w].index
            );
            for j in w..self.words.len() {
                let index = self.words[j].index;
                self.emit(index, last, last);
            }
            self.report.backfilled += remaining;
        }

        if m < self.marks.len() {
            let leftover = self.marks.len() - m;
            debug!("Ignoring {leftover} trailing speech mark(s) after the last word");
            self.report.skipped_marks += leftover;
        }

        Alignment {
            timings: self.timings,
            report: self.report,
        }
    }
}

enum Resync {
    SkipMarks(usize),
    SkipWords(usize),
}

/// Align engine marks to the word tokens of one chunk.
///
/// `chunk_tokens` must be the chunk's slice of the canonical token sequence;
/// emitted `word_index` values are those tokens' canonical indices.
pub fn align(
    chunk_tokens: &[Token],
    marks: &[SpeechMark],
    default_word_duration_ms: u32,
) -> Alignment {
    let words: Vec<Word> = chunk_tokens
        .iter()
        .filter(|t| t.is_word())
        .map(|t| Word {
            index: t.index,
            text: &t.text,
            key: normalize(&t.text),
        })
        .collect();

    let mut report = AlignmentReport::default();
    let marks: Vec<Mark> = marks
        .iter()
        .filter_map(|mark| {
            let key = normalize(&mark.value);
            if key.is_empty() {
                report.skipped_marks += 1;
                None
            } else {
                Some(Mark {
                    time: mark.time,
                    key,
                })
            }
        })
        .collect();

    let alignment = Aligner {
        timings: Vec::with_capacity(words.len()),
        words,
        marks,
        default_word_duration_ms,
        report,
        last_start: 0,
    }
    .run();

    debug_assert!(
        check_coverage(chunk_tokens, &alignment.timings).is_ok(),
        "alignment coverage violated"
    );
    alignment
}

/// Verify that `timings` has exactly one entry per word token in
/// `chunk_tokens`, in order, with non-decreasing starts and `end >= start`.
pub fn check_coverage(chunk_tokens: &[Token], timings: &[WordTiming]) -> Result<(), String> {
    let expected: Vec<u32> = chunk_tokens
        .iter()
        .filter(|t| t.is_word())
        .map(|t| t.index)
        .collect();
    if expected.len() != timings.len() {
        return Err(format!(
            "{} timings for {} words",
            timings.len(),
            expected.len()
        ));
    }

    let mut prev_start = 0u32;
    for (want, timing) in expected.iter().zip(timings) {
        if timing.word_index != *want {
            return Err(format!(
                "expected word index {want}, got {}",
                timing.word_index
            ));
        }
        if timing.start_ms < prev_start {
            return Err(format!(
                "start of word {want} ({}ms) precedes previous start ({prev_start}ms)",
                timing.start_ms
            ));
        }
        if timing.end_ms < timing.start_ms {
            return Err(format!("word {want} ends before it starts"));
        }
        prev_start = timing.start_ms;
    }
    Ok(())
}
