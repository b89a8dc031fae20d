use crate::config::SearchConfig;
use crate::graph::Neighbor;
use recall_indexing::{LexicalHit, VectorHit};
use recall_schemas::{AssociatedMemory, MemoryId, MemoryRecord, SearchHit, SearchQuery};
use std::collections::HashMap;
use tracing::debug;

/// A record's combined relevance before filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub id: MemoryId,
    pub score: f32,
    pub lexical_score: Option<f32>,
    pub vector_score: Option<f32>,
}

/// Combine the lexical and vector branches into one score per record.
///
/// Lexical scores are divided by the best lexical score of the query and
/// cosine similarities are mapped from [-1, 1] onto [0, 1]; the two are then
/// mixed with the configured weights. When the vector branch is absent
/// (`None`) the normalized lexical score is used on its own.
pub fn fuse_scores(
    lexical: &[LexicalHit],
    vector: Option<&[VectorHit]>,
    config: &SearchConfig,
) -> Vec<FusedCandidate> {
    let max_lexical = lexical
        .iter()
        .map(|hit| hit.score)
        .fold(0.0f32, f32::max);

    let mut fused: HashMap<MemoryId, FusedCandidate> = HashMap::new();

    for hit in lexical {
        let normalized = if max_lexical > 0.0 { hit.score / max_lexical } else { 0.0 };
        fused.insert(
            hit.id.clone(),
            FusedCandidate {
                id: hit.id.clone(),
                score: 0.0,
                lexical_score: Some(normalized),
                vector_score: None,
            },
        );
    }

    if let Some(vector_hits) = vector {
        for hit in vector_hits {
            if hit.similarity <= config.min_similarity {
                continue;
            }
            let entry = fused.entry(hit.id.clone()).or_insert_with(|| FusedCandidate {
                id: hit.id.clone(),
                score: 0.0,
                lexical_score: None,
                vector_score: None,
            });
            entry.vector_score = Some((hit.similarity + 1.0) / 2.0);
        }
    }

    let vector_active = vector.is_some();
    fused
        .into_values()
        .map(|mut candidate| {
            let lexical = candidate.lexical_score.unwrap_or(0.0);
            candidate.score = if vector_active {
                config.lexical_weight * lexical
                    + config.vector_weight * candidate.vector_score.unwrap_or(0.0)
            } else {
                lexical
            };
            candidate
        })
        .collect()
}

/// Apply the query's filters, order and truncate.
///
/// Equal scores are ordered by importance, then by recency, then by id.
pub fn rank(
    candidates: Vec<FusedCandidate>,
    records: &HashMap<MemoryId, MemoryRecord>,
    query: &SearchQuery,
) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let record = records.get(&candidate.id)?;
            if let Some(memory_type) = &query.memory_type {
                if &record.memory_type != memory_type {
                    return None;
                }
            }
            if let Some(min) = query.min_importance {
                if record.importance < min {
                    return None;
                }
            }
            Some(SearchHit {
                record: record.clone(),
                score: candidate.score,
                lexical_score: candidate.lexical_score,
                vector_score: candidate.vector_score,
            })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.record.importance.total_cmp(&a.record.importance))
            .then_with(|| b.record.created_at.cmp(&a.record.created_at))
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    hits.truncate(query.limit);

    debug!("Ranked {} hits for '{}'", hits.len(), query.query);
    hits
}

/// Resolve ranked graph neighbours to records, skipping ids that no longer
/// exist, and keep the first `max_results`.
pub fn resolve_associated(
    neighbors: Vec<Neighbor>,
    records: &HashMap<MemoryId, MemoryRecord>,
    max_results: usize,
) -> Vec<AssociatedMemory> {
    neighbors
        .into_iter()
        .filter_map(|neighbor| {
            let record = records.get(&neighbor.id)?;
            Some(AssociatedMemory {
                record: record.clone(),
                relation_type: neighbor.relation_type,
                direction: neighbor.direction,
                weight: neighbor.weight,
            })
        })
        .take(max_results)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_schemas::{MemoryType, RelationDirection, RelationType};

    fn lexical(id: &str, score: f32) -> LexicalHit {
        LexicalHit {
            id: id.into(),
            score,
        }
    }

    fn vector(id: &str, similarity: f32) -> VectorHit {
        VectorHit {
            id: id.into(),
            similarity,
        }
    }

    fn records(entries: &[(&str, f32, MemoryType)]) -> HashMap<MemoryId, MemoryRecord> {
        entries
            .iter()
            .map(|(id, importance, memory_type)| {
                let mut record = MemoryRecord::new(format!("content {}", id), *importance, memory_type.clone());
                record.id = MemoryId::from(*id);
                (record.id.clone(), record)
            })
            .collect()
    }

    #[test]
    fn test_lexical_only_when_vector_unavailable() {
        let fused = fuse_scores(&[lexical("a", 2.0), lexical("b", 1.0)], None, &SearchConfig::default());
        let by_id: HashMap<_, _> = fused.into_iter().map(|c| (c.id.0.clone(), c)).collect();
        assert_eq!(by_id["a"].score, 1.0);
        assert_eq!(by_id["b"].score, 0.5);
        assert!(by_id["a"].vector_score.is_none());
    }

    #[test]
    fn test_weighted_combination() {
        let config = SearchConfig::default();
        let fused = fuse_scores(
            &[lexical("a", 1.0)],
            Some(&[vector("a", 1.0), vector("b", 0.5), vector("c", -0.2)]),
            &config,
        );
        let by_id: HashMap<_, _> = fused.into_iter().map(|c| (c.id.0.clone(), c)).collect();

        assert!((by_id["a"].score - 1.0).abs() < 1e-6);
        assert!((by_id["b"].score - 0.375).abs() < 1e-6);
        assert!(!by_id.contains_key("c"));
    }

    #[test]
    fn test_rank_filters_before_truncating() {
        let records = records(&[
            ("a", 0.5, MemoryType::Fact),
            ("b", 0.5, MemoryType::Preference),
            ("c", 0.9, MemoryType::Preference),
        ]);
        let candidates = vec![
            FusedCandidate { id: "a".into(), score: 1.0, lexical_score: Some(1.0), vector_score: None },
            FusedCandidate { id: "b".into(), score: 0.5, lexical_score: Some(0.5), vector_score: None },
            FusedCandidate { id: "c".into(), score: 0.5, lexical_score: Some(0.5), vector_score: None },
            FusedCandidate { id: "gone".into(), score: 0.9, lexical_score: Some(0.9), vector_score: None },
        ];

        let query = SearchQuery::new("x", 1).memory_type(MemoryType::Preference);
        let hits = rank(candidates, &records, &query);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, MemoryId::from("c"));
    }

    #[test]
    fn test_resolve_associated_skips_missing() {
        let records = records(&[("a", 0.5, MemoryType::Fact)]);
        let neighbors = vec![
            Neighbor {
                id: "a".into(),
                relation_type: RelationType::RelatedTo,
                direction: RelationDirection::Undirected,
                weight: 0.5,
            },
            Neighbor {
                id: "ghost".into(),
                relation_type: RelationType::RelatedTo,
                direction: RelationDirection::Undirected,
                weight: 0.9,
            },
        ];
        let resolved = resolve_associated(neighbors.clone(), &records, 10);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].record.id, MemoryId::from("a"));

        // The missing record ranks first but does not use up the limit.
        let resolved = resolve_associated(neighbors, &records, 1);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].record.id, MemoryId::from("a"));
    }
}
