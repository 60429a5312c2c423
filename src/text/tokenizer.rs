//! Canonical tokenization.
//!
//! Splits text into words, whitespace runs, and single punctuation marks.
//! Token `index` is the position in the full sequence and is the word index
//! used by chunking, alignment, highlighting, and resume. Joining all tokens
//! reproduces the input byte-for-byte.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// 1. words, with inner apostrophes/hyphens ("don't", "mother-in-law")
/// 2. whitespace runs
/// 3. any other single character
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)([\p{L}\p{N}\p{M}]+(?:['\x{2019}\-][\p{L}\p{N}\p{M}]+)*)|(\s+)|(.)")
        .expect("token pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Word,
    Space,
    Punct,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    pub index: u32,
    pub text: String,
    pub kind: TokenKind,
}

impl Token {
    pub fn is_word(&self) -> bool {
        self.kind == TokenKind::Word
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Tokenize `text`. Empty input yields an empty sequence; there is no failure mode.
pub fn tokenize(text: &str) -> Vec<Token> {
    if text.is_empty() {
        return Vec::new();
    }

    TOKEN_RE
        .captures_iter(text)
        .enumerate()
        .map(|(i, caps)| {
            let kind = if caps.get(1).is_some() {
                TokenKind::Word
            } else if caps.get(2).is_some() {
                TokenKind::Space
            } else {
                TokenKind::Punct
            };
            Token {
                index: i as u32,
                text: caps[0].to_string(),
                kind,
            }
        })
        .collect()
}

/// Reconstruct the source text of a token slice.
pub fn join(tokens: &[Token]) -> String {
    tokens.iter().map(|t| t.text.as_str()).collect()
}

pub fn words(tokens: &[Token]) -> impl Iterator<Item = &Token> {
    tokens.iter().filter(|t| t.is_word())
}

/// Canonical tokens in `[start, end]`, sliced from the full sequence.
/// Returns `None` if the range is inverted or runs past the end.
pub fn slice(tokens: &[Token], start: u32, end: u32) -> Option<&[Token]> {
    let (start, end) = (start as usize, end as usize);
    if start > end || end >= tokens.len() {
        return None;
    }
    Some(&tokens[start..=end])
}

/// Word tokens whose canonical index falls in `[start, end]`.
pub fn word_tokens_in_range(tokens: &[Token], start: u32, end: u32) -> Vec<&Token> {
    slice(tokens, start, end)
        .map(|s| words(s).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn word_texts(text: &str) -> Vec<String> {
        words(&tokenize(text)).map(|t| t.text.clone()).collect()
    }

    #[test]
    fn empty_input_gives_no_tokens() {
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn basic_sentence() {
        assert_eq!(word_texts("Hello world."), vec!["Hello", "world"]);
    }

    #[test]
    fn contractions_stay_whole() {
        assert_eq!(
            word_texts("It's a beautiful day, isn't it?"),
            vec!["It's", "a", "beautiful", "day", "isn't", "it"]
        );
        assert_eq!(word_texts("She didn\u{2019}t"), vec!["She", "didn\u{2019}t"]);
    }

    #[test]
    fn hyphenated_words_stay_whole() {
        assert_eq!(
            word_texts("The mother-in-law is here."),
            vec!["The", "mother-in-law", "is", "here"]
        );
    }

    #[test]
    fn punctuation_runs_are_single_char_tokens() {
        let tokens = tokenize("Hello...   world!!!");
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(tokens.len(), 9);
        assert_eq!(kinds[0], TokenKind::Word);
        assert_eq!(&kinds[1..4], &[TokenKind::Punct; 3]);
        assert_eq!(kinds[4], TokenKind::Space);
        assert_eq!(tokens[4].text, "   ");
        assert_eq!(word_texts("Hello...   world!!!"), vec!["Hello", "world"]);
    }

    #[test]
    fn smart_quotes_are_punctuation() {
        assert_eq!(
            word_texts("She said, \u{201c}Hello!\u{201d}"),
            vec!["She", "said", "Hello"]
        );
    }

    #[test]
    fn cats_hat_scenario() {
        let tokens = tokenize("The cat's hat.");
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["The", " ", "cat's", " ", "hat", "."]);
        let word_indices: Vec<u32> = words(&tokens).map(|t| t.index).collect();
        assert_eq!(word_indices, vec![0, 2, 4]);
        assert!(!tokens[5].is_word());
    }

    #[test]
    fn indices_are_contiguous_and_stable() {
        let text = "One, two; three - four.\n\nFive?";
        let a = tokenize(text);
        let b = tokenize(text);
        assert_eq!(a, b);
        for (i, t) in a.iter().enumerate() {
            assert_eq!(t.index as usize, i);
        }
    }

    #[test]
    fn non_ascii_letters_are_word_chars() {
        assert_eq!(word_texts("café naïve Straße"), vec!["café", "naïve", "Straße"]);
    }

    #[test]
    fn round_trip_fixed_inputs() {
        for text in [
            "The cat's hat.",
            "  leading and trailing  ",
            "tabs\tand\r\nnewlines\n",
            "emoji 🐈‍⬛ in text",
            "under_score and -dash- and 'quote'",
            "a",
            " ",
        ] {
            assert_eq!(join(&tokenize(text)), text, "round trip failed for {text:?}");
        }
    }

    #[test]
    fn round_trip_random_inputs() {
        let alphabet: Vec<char> = "abcXYZ09 '\u{2019}-.,!?\t\n_é漢🙂\u{301}".chars().collect();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let len = rng.gen_range(0..60);
            let text: String = (0..len)
                .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
                .collect();
            let tokens = tokenize(&text);
            assert_eq!(join(&tokens), text);
            assert!(tokens.iter().all(|t| !t.text.is_empty()));
        }
    }

    #[test]
    fn slice_rejects_bad_ranges() {
        let tokens = tokenize("a b c");
        assert_eq!(slice(&tokens, 0, 4).map(|s| s.len()), Some(5));
        assert!(slice(&tokens, 3, 2).is_none());
        assert!(slice(&tokens, 0, 5).is_none());
        let ws: Vec<&str> = word_tokens_in_range(&tokens, 1, 4)
            .iter()
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(ws, vec!["b", "c"]);
    }
}
