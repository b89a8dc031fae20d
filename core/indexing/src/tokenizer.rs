use crate::error::BackendError;
use std::collections::BTreeSet;

pub const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "do", "for", "if", "in", "is", "it",
    "my", "of", "on", "or", "so", "to", "we", "was", "the", "that", "this", "with", "from",
    "have", "has", "had", "would", "there", "could", "should", "about", "after", "before",
    "while", "since", "where", "which", "into", "using", "also", "because", "these", "those",
    "been", "were", "will", "what", "when", "your", "their", "them", "then", "than", "very",
    "just",
];

/// Splits text into index terms.
pub trait Tokenizer: Send + Sync {
    fn name(&self) -> &str;

    /// Lowercased terms in document order, duplicates preserved.
    fn tokenize(&self, text: &str) -> Result<Vec<String>, BackendError>;
}

/// Unicode word tokenizer with stopword removal.
///
/// Latin/digit runs become whole-word terms. Runs of CJK ideographs, kana or
/// hangul have no word separators, so they are emitted as overlapping
/// bigrams (a lone character is emitted as is).
#[derive(Debug, Clone)]
pub struct WordTokenizer {
    min_len: usize,
}

impl Default for WordTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl WordTokenizer {
    pub fn new() -> Self {
        Self { min_len: 2 }
    }

    pub fn with_min_len(min_len: usize) -> Self {
        Self {
            min_len: min_len.max(1),
        }
    }

    pub fn words(&self, text: &str) -> Vec<String> {
        let mut terms = Vec::new();
        let mut word = String::new();
        let mut cjk_run: Vec<char> = Vec::new();

        for ch in text.chars().flat_map(char::to_lowercase) {
            if is_cjk(ch) {
                self.flush_word(&mut word, &mut terms);
                cjk_run.push(ch);
            } else if ch.is_alphanumeric() || ch == '_' {
                flush_cjk(&mut cjk_run, &mut terms);
                word.push(ch);
            } else {
                self.flush_word(&mut word, &mut terms);
                flush_cjk(&mut cjk_run, &mut terms);
            }
        }
        self.flush_word(&mut word, &mut terms);
        flush_cjk(&mut cjk_run, &mut terms);

        terms
    }

    fn flush_word(&self, word: &mut String, terms: &mut Vec<String>) {
        if word.is_empty() {
            return;
        }
        let token = std::mem::take(word);
        let token = token.trim_matches('_');
        if token.chars().count() < self.min_len {
            return;
        }
        if STOPWORDS.contains(&token) {
            return;
        }
        terms.push(token.to_string());
    }
}

impl Tokenizer for WordTokenizer {
    fn name(&self) -> &str {
        "word"
    }

    fn tokenize(&self, text: &str) -> Result<Vec<String>, BackendError> {
        Ok(self.words(text))
    }
}

/// A tokenizer that never works. Stands in for a missing segmentation
/// backend and drives the substring fallback.
#[derive(Debug, Clone, Default)]
pub struct NullTokenizer;

impl Tokenizer for NullTokenizer {
    fn name(&self) -> &str {
        "null"
    }

    fn tokenize(&self, _text: &str) -> Result<Vec<String>, BackendError> {
        Err(BackendError::unavailable("tokenizer", "no segmentation backend installed"))
    }
}

fn flush_cjk(run: &mut Vec<char>, terms: &mut Vec<String>) {
    match run.len() {
        0 => {}
        1 => terms.push(run[0].to_string()),
        _ => {
            for pair in run.windows(2) {
                terms.push(pair.iter().collect());
            }
        }
    }
    run.clear();
}

fn is_cjk(ch: char) -> bool {
    matches!(
        ch as u32,
        0x3040..=0x30FF      // hiragana, katakana
            | 0x3400..=0x4DBF // CJK extension A
            | 0x4E00..=0x9FFF // CJK unified ideographs
            | 0xAC00..=0xD7AF // hangul syllables
            | 0xF900..=0xFAFF // compatibility ideographs
    )
}

/// Whitespace terms used for overlap scoring when no tokenizer is usable.
pub fn fallback_terms(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(w))
        .map(|w| w.to_string())
        .collect()
}

/// Lowercase and collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_drop_stopwords_and_short_tokens() {
        let tokenizer = WordTokenizer::new();
        let terms = tokenizer.words("The user prefers TEA over coffee, a lot!");
        assert_eq!(terms, vec!["user", "prefers", "tea", "over", "coffee", "lot"]);
    }

    #[test]
    fn test_cjk_bigrams() {
        let tokenizer = WordTokenizer::new();
        let terms = tokenizer.words("我喜欢喝茶 green tea");
        assert_eq!(terms, vec!["我喜", "喜欢", "欢喝", "喝茶", "green", "tea"]);

        let single = tokenizer.words("茶");
        assert_eq!(single, vec!["茶"]);
    }

    #[test]
    fn test_null_tokenizer_is_unavailable() {
        let err = NullTokenizer.tokenize("anything").unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_fallback_terms_and_normalize() {
        let terms = fallback_terms("Rust, rust and   Tokio!");
        assert_eq!(terms.len(), 2);
        assert!(terms.contains("rust"));
        assert!(terms.contains("tokio"));

        assert_eq!(normalize("  Hello   World "), "hello world");
    }
}
