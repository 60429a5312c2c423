//! Bounded chunking of the canonical token sequence for synthesis.
//!
//! Chunks are contiguous, non-overlapping, ordered token ranges. Boundaries
//! depend only on the tokens and the limit, so re-running against the same
//! text always reproduces the persisted placeholder ranges.

use serde::{Deserialize, Serialize};

use super::tokenizer::{self, Token, TokenKind};
use crate::error::NarrationError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub start_word_index: u32,
    pub end_word_index: u32,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    /// Close a chunk as soon as the next token would exceed the limit.
    #[default]
    Greedy,
    /// Like greedy, but when the limit is hit, close at the last sentence
    /// terminator inside the chunk if there is one.
    Sentence,
}

/// Greedy packing: accumulate tokens until the next one would push the
/// chunk past `max_chunk_chars`. A single oversized token becomes its own chunk.
pub fn chunk(tokens: &[Token], max_chunk_chars: usize) -> Vec<Chunk> {
    let spans = greedy_spans(tokens, max_chunk_chars);
    build_chunks(tokens, &spans)
}

pub fn chunk_with(tokens: &[Token], max_chunk_chars: usize, strategy: ChunkStrategy) -> Vec<Chunk> {
    match strategy {
        ChunkStrategy::Greedy => chunk(tokens, max_chunk_chars),
        ChunkStrategy::Sentence => chunk_at_sentences(tokens, max_chunk_chars),
    }
}

/// Sentence-preferring packing. Never exceeds the limit except for a single
/// oversized token, same as [`chunk`].
pub fn chunk_at_sentences(tokens: &[Token], max_chunk_chars: usize) -> Vec<Chunk> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut len = 0usize;
    // Position just after the most recent sentence terminator in the open chunk.
    let mut last_break: Option<usize> = None;

    let mut i = 0usize;
    while i < tokens.len() {
        let tok_len = tokens[i].char_len();
        if i > start && len + tok_len > max_chunk_chars {
            let end = match last_break {
                Some(b) if b > start && b <= i => b,
                _ => i,
            };
            spans.push((start, end - 1));
            start = end;
            len = tokens[start..i].iter().map(Token::char_len).sum();
            last_break = None;
            // Re-check the current token against the carried-over tail.
            continue;
        }

        len += tok_len;
        if is_sentence_end(tokens, i) {
            last_break = Some(i + 1);
        }
        i += 1;
    }

    if start < tokens.len() {
        spans.push((start, tokens.len() - 1));
    }

    build_chunks(tokens, &spans)
}

/// Check the chunk invariants against the token sequence they were cut from.
pub fn validate_chunks(chunks: &[Chunk], tokens: &[Token]) -> Result<(), NarrationError> {
    if tokens.is_empty() {
        return if chunks.is_empty() {
            Ok(())
        } else {
            Err(NarrationError::ChunkBounds("chunks produced for empty input".into()))
        };
    }

    let mut expected_start = 0u32;
    for (i, c) in chunks.iter().enumerate() {
        if c.index as usize != i {
            return Err(NarrationError::ChunkBounds(format!(
                "chunk at position {i} has index {}",
                c.index
            )));
        }
        if c.start_word_index != expected_start {
            return Err(NarrationError::ChunkBounds(format!(
                "chunk {i} starts at {} but previous ended at {}",
                c.start_word_index,
                expected_start as i64 - 1
            )));
        }
        if c.end_word_index < c.start_word_index {
            return Err(NarrationError::ChunkBounds(format!(
                "chunk {i} has inverted range {}..{}",
                c.start_word_index, c.end_word_index
            )));
        }
        let Some(slice) = tokenizer::slice(tokens, c.start_word_index, c.end_word_index) else {
            return Err(NarrationError::ChunkBounds(format!(
                "chunk {i} range {}..{} exceeds {} tokens",
                c.start_word_index,
                c.end_word_index,
                tokens.len()
            )));
        };
        if tokenizer::join(slice) != c.text {
            return Err(NarrationError::ChunkBounds(format!(
                "chunk {i} text does not match its token range"
            )));
        }
        expected_start = c.end_word_index + 1;
    }

    if expected_start as usize != tokens.len() {
        return Err(NarrationError::ChunkBounds(format!(
            "chunks cover {expected_start} of {} tokens",
            tokens.len()
        )));
    }
    Ok(())
}

fn greedy_spans(tokens: &[Token], max_chunk_chars: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut len = 0usize;

    for (i, tok) in tokens.iter().enumerate() {
        let tok_len = tok.char_len();
        if i > start && len + tok_len > max_chunk_chars {
            spans.push((start, i - 1));
            start = i;
            len = 0;
        }
        len += tok_len;
    }

    if start < tokens.len() {
        spans.push((start, tokens.len() - 1));
    }
    spans
}

fn build_chunks(tokens: &[Token], spans: &[(usize, usize)]) -> Vec<Chunk> {
    let chunks: Vec<Chunk> = spans
        .iter()
        .enumerate()
        .map(|(i, &(start, end))| Chunk {
            index: i as u32,
            start_word_index: tokens[start].index,
            end_word_index: tokens[end].index,
            text: tokenizer::join(&tokens[start..=end]),
        })
        .collect();

    debug_assert!(
        validate_chunks(&chunks, tokens).is_ok(),
        "chunk invariants violated"
    );
    chunks
}

/// A terminator run (`.`, `!`, `?`) ends at `i` and is followed by whitespace or end of text.
fn is_sentence_end(tokens: &[Token], i: usize) -> bool {
    let tok = &tokens[i];
    if tok.kind != TokenKind::Punct || !matches!(tok.text.as_str(), "." | "!" | "?") {
        return false;
    }
    match tokens.get(i + 1) {
        None => true,
        Some(next) => next.kind == TokenKind::Space,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::tokenizer::tokenize;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const SAMPLE: &str = "It was the best of times. It was the worst of times! \
        It was the age of wisdom, it was the age of foolishness? It was the epoch of belief.";

    fn assert_contiguous(chunks: &[Chunk], tokens: &[Token]) {
        validate_chunks(chunks, tokens).expect("chunk invariants hold");
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end_word_index + 1, pair[1].start_word_index);
        }
        if let Some(last) = chunks.last() {
            assert_eq!(last.end_word_index as usize, tokens.len() - 1);
        }
    }

    #[test]
    fn empty_tokens_give_no_chunks() {
        assert!(chunk(&[], 100).is_empty());
        assert!(chunk_at_sentences(&[], 100).is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let tokens = tokenize("Hello world.");
        let chunks = chunk(&tokens, 1500);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello world.");
        assert_eq!(chunks[0].start_word_index, 0);
        assert_eq!(chunks[0].end_word_index, 3);
    }

    #[test]
    fn greedy_respects_limit() {
        let tokens = tokenize(SAMPLE);
        let chunks = chunk(&tokens, 20);
        assert!(chunks.len() > 1);
        assert_contiguous(&chunks, &tokens);
        for c in &chunks {
            assert!(c.text.chars().count() <= 20, "chunk too long: {:?}", c.text);
        }
        let rebuilt: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rebuilt, SAMPLE);
    }

    #[test]
    fn greedy_packs_up_to_exact_limit() {
        // "aaaa" + " " + "bbbb" = 9 chars
        let tokens = tokenize("aaaa bbbb cc");
        let chunks = chunk(&tokens, 9);
        assert_eq!(chunks[0].text, "aaaa bbbb");
        assert_eq!(chunks[1].text, " cc");
    }

    #[test]
    fn oversized_token_becomes_its_own_chunk() {
        let tokens = tokenize("a supercalifragilistic b");
        let chunks = chunk(&tokens, 5);
        assert_contiguous(&chunks, &tokens);
        assert!(chunks.iter().any(|c| c.text == "supercalifragilistic"));
    }

    #[test]
    fn zero_limit_gives_one_token_per_chunk() {
        let tokens = tokenize("a b");
        let chunks = chunk(&tokens, 0);
        assert_eq!(chunks.len(), tokens.len());
        assert_contiguous(&chunks, &tokens);
    }

    #[test]
    fn sentence_strategy_breaks_after_terminators() {
        let tokens = tokenize(SAMPLE);
        let chunks = chunk_at_sentences(&tokens, 60);
        assert_contiguous(&chunks, &tokens);
        assert_eq!(
            chunks[0].text,
            "It was the best of times. It was the worst of times!"
        );
        assert_eq!(
            chunks[1].text,
            " It was the age of wisdom, it was the age of foolishness?"
        );
        for c in &chunks {
            assert!(c.text.chars().count() <= 60);
        }
    }

    #[test]
    fn sentence_strategy_falls_back_to_greedy_without_terminators() {
        let text = "one two three four five six seven eight nine ten";
        let tokens = tokenize(text);
        assert_eq!(chunk_at_sentences(&tokens, 12), chunk(&tokens, 12));
    }

    #[test]
    fn chunking_is_deterministic() {
        let tokens = tokenize(SAMPLE);
        for limit in [1, 7, 25, 80, 1500] {
            for strategy in [ChunkStrategy::Greedy, ChunkStrategy::Sentence] {
                let a = chunk_with(&tokens, limit, strategy);
                let b = chunk_with(&tokens, limit, strategy);
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn validate_detects_gaps() {
        let tokens = tokenize("a b c d");
        let mut chunks = chunk(&tokens, 3);
        chunks[1].start_word_index += 1;
        assert!(matches!(
            validate_chunks(&chunks, &tokens),
            Err(NarrationError::ChunkBounds(_))
        ));
    }

    #[test]
    fn contiguity_holds_for_random_texts_and_limits() {
        let vocab = ["the", "cat's", "mother-in-law", "sat", ".", "!", " ", "  ", "\n", ",", "a"];
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..300 {
            let n = rng.gen_range(0..80);
            let text: String = (0..n).map(|_| vocab[rng.gen_range(0..vocab.len())]).collect();
            let tokens = tokenize(&text);
            let limit = rng.gen_range(0..40);
            for strategy in [ChunkStrategy::Greedy, ChunkStrategy::Sentence] {
                let chunks = chunk_with(&tokens, limit, strategy);
                assert_contiguous(&chunks, &tokens);
                for c in &chunks {
                    let len = c.text.chars().count();
                    let single = c.start_word_index == c.end_word_index;
                    assert!(len <= limit || single, "chunk {len} > {limit}: {:?}", c.text);
                }
            }
        }
    }
}
