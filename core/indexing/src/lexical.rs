use crate::tokenizer::{fallback_terms, normalize, Tokenizer};
use chrono::{DateTime, Utc};
use recall_schemas::MemoryId;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bonus added when the whole normalized content equals the query.
const EXACT_MATCH_BONUS: f32 = 1.0;

/// Record attributes used to break score ties.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankHints {
    pub importance: f32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexicalHit {
    pub id: MemoryId,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexicalMode {
    Tokenized,
    /// No usable tokenizer; search is a case-insensitive substring scan.
    Substring,
}

#[derive(Debug, Clone)]
struct IndexedDoc {
    normalized: String,
    /// Cached tokenization of the content, rebuilt whenever it is re-indexed.
    terms: BTreeSet<String>,
    tokenized: bool,
    hints: RankHints,
}

/// Inverted index over record content.
pub struct LexicalIndex {
    tokenizer: Option<Arc<dyn Tokenizer>>,
    docs: HashMap<MemoryId, IndexedDoc>,
    postings: HashMap<String, BTreeSet<MemoryId>>,
    tokenizer_failures: usize,
}

impl LexicalIndex {
    pub fn new(tokenizer: Option<Arc<dyn Tokenizer>>) -> Self {
        Self {
            tokenizer,
            docs: HashMap::new(),
            postings: HashMap::new(),
            tokenizer_failures: 0,
        }
    }

    pub fn mode(&self) -> LexicalMode {
        match self.tokenizer {
            Some(_) if self.tokenizer_failures == 0 => LexicalMode::Tokenized,
            _ => LexicalMode::Substring,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn contains(&self, id: &MemoryId) -> bool {
        self.docs.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &MemoryId> {
        self.docs.keys()
    }

    /// Terms the index would store for `text`. Falls back to whitespace
    /// terms when the tokenizer is missing or fails.
    pub fn terms_for(&self, text: &str) -> BTreeSet<String> {
        self.tokenize(text).0
    }

    fn tokenize(&self, text: &str) -> (BTreeSet<String>, bool) {
        match &self.tokenizer {
            Some(tokenizer) => match tokenizer.tokenize(text) {
                Ok(tokens) => (tokens.into_iter().collect(), true),
                Err(e) => {
                    debug!("Tokenizer {} failed, using fallback terms: {}", tokenizer.name(), e);
                    (fallback_terms(text), false)
                }
            },
            None => (fallback_terms(text), false),
        }
    }

    /// Index or re-index a document. Any previous entry for `id` is replaced.
    pub fn index(&mut self, id: &MemoryId, text: &str, hints: RankHints) {
        self.remove(id);

        let (terms, tokenized) = self.tokenize(text);
        if self.tokenizer.is_some() && !tokenized {
            self.tokenizer_failures += 1;
            warn!("Indexed {} without tokenizer; substring matching only", id);
        }
        for term in &terms {
            self.postings.entry(term.clone()).or_default().insert(id.clone());
        }

        self.docs.insert(
            id.clone(),
            IndexedDoc {
                normalized: normalize(text),
                terms,
                tokenized,
                hints,
            },
        );
    }

    pub fn update_hints(&mut self, id: &MemoryId, hints: RankHints) -> bool {
        match self.docs.get_mut(id) {
            Some(doc) => {
                doc.hints = hints;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &MemoryId) -> bool {
        let Some(doc) = self.docs.remove(id) else {
            return false;
        };
        for term in &doc.terms {
            if let Some(ids) = self.postings.get_mut(term) {
                ids.remove(id);
                if ids.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.docs.clear();
        self.postings.clear();
        self.tokenizer_failures = 0;
    }

    /// Keyword search.
    ///
    /// With a tokenizer the score is the fraction of distinct query terms a
    /// document contains, plus a bonus when the whole content equals the
    /// query. Without one (or when the query has no indexable terms) a
    /// document scores 1.0 if it contains the query as a substring.
    pub fn search(&self, query: &str, limit: usize) -> Vec<LexicalHit> {
        let normalized_query = normalize(query);
        if normalized_query.is_empty() || limit == 0 {
            return Vec::new();
        }

        let query_terms = match &self.tokenizer {
            Some(tokenizer) => match tokenizer.tokenize(query) {
                Ok(tokens) => tokens.into_iter().collect::<BTreeSet<_>>(),
                Err(e) => {
                    debug!("Query tokenization unavailable ({}), scanning substrings", e);
                    BTreeSet::new()
                }
            },
            None => BTreeSet::new(),
        };

        let mut scores: HashMap<&MemoryId, f32> = HashMap::new();

        if query_terms.is_empty() {
            for (id, doc) in &self.docs {
                if doc.normalized.contains(&normalized_query) {
                    scores.insert(id, 1.0);
                }
            }
        } else {
            let mut shared: HashMap<&MemoryId, usize> = HashMap::new();
            for term in &query_terms {
                if let Some(ids) = self.postings.get(term) {
                    for id in ids {
                        if self.docs.get(id).map(|d| d.tokenized).unwrap_or(false) {
                            *shared.entry(id).or_default() += 1;
                        }
                    }
                }
            }
            let total = query_terms.len() as f32;
            for (id, count) in shared {
                let mut score = count as f32 / total;
                if let Some(doc) = self.docs.get(id) {
                    if doc.normalized == normalized_query {
                        score += EXACT_MATCH_BONUS;
                    }
                }
                scores.insert(id, score);
            }
            // Documents indexed while the tokenizer was down only match by substring.
            for (id, doc) in self.docs.iter().filter(|(_, d)| !d.tokenized) {
                if doc.normalized.contains(&normalized_query) {
                    scores.entry(id).or_insert(1.0);
                }
            }
        }

        let mut hits: Vec<LexicalHit> = scores
            .into_iter()
            .map(|(id, score)| LexicalHit {
                id: id.clone(),
                score,
            })
            .collect();
        hits.sort_by(|a, b| self.compare_hits(a, b));
        hits.truncate(limit);

        debug!("Lexical search '{}' matched {} documents", query, hits.len());
        hits
    }

    fn compare_hits(&self, a: &LexicalHit, b: &LexicalHit) -> Ordering {
        b.score
            .total_cmp(&a.score)
            .then_with(|| self.compare_by_hints(&a.id, &b.id))
    }

    /// Importance desc, then creation time desc, then id asc.
    pub fn compare_by_hints(&self, a: &MemoryId, b: &MemoryId) -> Ordering {
        let hints_a = self.docs.get(a).map(|d| d.hints);
        let hints_b = self.docs.get(b).map(|d| d.hints);
        match (hints_a, hints_b) {
            (Some(ha), Some(hb)) => hb
                .importance
                .total_cmp(&ha.importance)
                .then_with(|| hb.created_at.cmp(&ha.created_at))
                .then_with(|| a.cmp(b)),
            _ => a.cmp(b),
        }
    }

    /// Jaccard similarity between two indexed documents.
    pub fn similarity(&self, a: &MemoryId, b: &MemoryId) -> Option<f32> {
        let doc_a = self.docs.get(a)?;
        let doc_b = self.docs.get(b)?;
        Some(jaccard(&doc_a.terms, &doc_b.terms))
    }

    /// Documents whose term overlap with `terms` reaches `threshold`,
    /// most similar first. Only documents sharing at least one term are
    /// scored.
    pub fn overlapping(
        &self,
        terms: &BTreeSet<String>,
        threshold: f32,
        exclude: Option<&MemoryId>,
    ) -> Vec<(MemoryId, f32)> {
        if terms.is_empty() {
            return Vec::new();
        }

        let mut shared: HashMap<&MemoryId, usize> = HashMap::new();
        for term in terms {
            if let Some(ids) = self.postings.get(term) {
                for id in ids {
                    *shared.entry(id).or_default() += 1;
                }
            }
        }

        let mut matches: Vec<(MemoryId, f32)> = shared
            .into_iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .filter_map(|(id, common)| {
                let doc = self.docs.get(id)?;
                let union = terms.len() + doc.terms.len() - common;
                let similarity = common as f32 / union as f32;
                (similarity >= threshold).then(|| (id.clone(), similarity))
            })
            .collect();

        matches.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        matches
    }

    /// Overlap of an indexed document with the other documents.
    pub fn overlapping_with(&self, id: &MemoryId, threshold: f32) -> Vec<(MemoryId, f32)> {
        match self.docs.get(id) {
            Some(doc) => self.overlapping(&doc.terms, threshold, Some(id)),
            None => Vec::new(),
        }
    }
}

pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }

    let intersection = a.intersection(b).count();
    let union = a.union(b).count();

    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::{NullTokenizer, WordTokenizer};
    use chrono::Duration;

    fn hints(importance: f32, minutes_ago: i64) -> RankHints {
        RankHints {
            importance,
            created_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    fn tokenized_index() -> LexicalIndex {
        LexicalIndex::new(Some(Arc::new(WordTokenizer::new())))
    }

    #[test]
    fn test_more_shared_terms_rank_higher() {
        let mut index = tokenized_index();
        index.index(&"mem_a".into(), "rust async runtime tokio", hints(0.5, 0));
        index.index(&"mem_b".into(), "rust compiler", hints(0.5, 0));
        index.index(&"mem_c".into(), "python scripts", hints(0.5, 0));

        let hits = index.search("rust async", 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, MemoryId::from("mem_a"));
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_exact_match_beats_partial() {
        let mut index = tokenized_index();
        index.index(&"mem_long".into(), "green tea and black tea daily", hints(0.9, 0));
        index.index(&"mem_exact".into(), "Green Tea", hints(0.1, 0));

        let hits = index.search("green tea", 10);
        assert_eq!(hits[0].id, MemoryId::from("mem_exact"));
        assert!(hits[0].score > 1.0);
    }

    #[test]
    fn test_ties_break_on_importance_then_recency() {
        let mut index = tokenized_index();
        index.index(&"mem_old".into(), "likes tea", hints(0.5, 10));
        index.index(&"mem_new".into(), "likes tea", hints(0.5, 1));
        index.index(&"mem_top".into(), "likes tea", hints(0.8, 30));

        let ids: Vec<_> = index.search("tea", 10).into_iter().map(|h| h.id.0).collect();
        assert_eq!(ids, vec!["mem_top", "mem_new", "mem_old"]);
    }

    #[test]
    fn test_substring_fallback_without_tokenizer() {
        let mut index = LexicalIndex::new(Some(Arc::new(NullTokenizer)));
        index.index(&"mem_a".into(), "User likes Tea", hints(0.5, 0));
        index.index(&"mem_b".into(), "Coffee person", hints(0.5, 0));
        assert_eq!(index.mode(), LexicalMode::Substring);

        let hits = index.search("likes tea", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 1.0);
        assert!(index.search("tea person", 10).is_empty());
    }

    #[test]
    fn test_remove_purges_postings() {
        let mut index = tokenized_index();
        let id = MemoryId::from("mem_a");
        index.index(&id, "unique marmalade", hints(0.5, 0));
        assert!(index.remove(&id));
        assert!(!index.remove(&id));
        assert!(index.search("marmalade", 10).is_empty());
        assert!(index.postings.is_empty());
    }

    #[test]
    fn test_reindex_replaces_terms() {
        let mut index = tokenized_index();
        let id = MemoryId::from("mem_a");
        index.index(&id, "old words", hints(0.5, 0));
        index.index(&id, "fresh content", hints(0.5, 0));
        assert!(index.search("old", 10).is_empty());
        assert_eq!(index.search("fresh", 10).len(), 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_overlapping_uses_jaccard() {
        let mut index = tokenized_index();
        index.index(&"mem_a".into(), "project deadline moved friday", hints(0.5, 0));
        index.index(&"mem_b".into(), "grocery list", hints(0.5, 0));

        let terms = index.terms_for("the project deadline moved to friday");
        let matches = index.overlapping(&terms, 0.5, None);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, MemoryId::from("mem_a"));
        assert!((matches[0].1 - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_overlap_without_tokenizer_uses_fallback_terms() {
        let mut index = LexicalIndex::new(None);
        index.index(&"mem_a".into(), "project deadline moved friday", hints(0.5, 0));
        index.index(&"mem_b".into(), "grocery list", hints(0.5, 0));
        assert!(index.overlapping_with(&"mem_a".into(), 0.1).is_empty());

        index.index(&"mem_c".into(), "deadline moved", hints(0.5, 0));
        let matches = index.overlapping_with(&"mem_a".into(), 0.5);
        assert_eq!(matches, vec![(MemoryId::from("mem_c"), 0.5)]);

        let hits = index.search("deadline moved", 10);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.score == 1.0));
    }

    #[test]
    fn test_overlap_skips_documents_without_shared_terms() {
        let mut index = tokenized_index();
        for i in 0..2000 {
            index.index(&MemoryId(format!("mem_{:04}", i)), &format!("filler note number{}", i), hints(0.5, 0));
        }
        index.index(&"mem_target".into(), "quarterly budget review", hints(0.5, 0));

        let terms = index.terms_for("budget review quarterly meeting");
        let matches = index.overlapping(&terms, 0.5, None);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, MemoryId::from("mem_target"));
        assert!((matches[0].1 - 0.75).abs() < 1e-6);
    }
}
