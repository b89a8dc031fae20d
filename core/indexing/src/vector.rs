use crate::error::IndexError;
use recall_schemas::MemoryId;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: MemoryId,
    /// Cosine similarity in [-1, 1].
    pub similarity: f32,
}

/// Exact nearest-neighbour index over fixed-length embeddings.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    entries: HashMap<MemoryId, Vec<f32>>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Result<Self, IndexError> {
        if dimension == 0 {
            return Err(IndexError::ZeroDimension);
        }
        Ok(Self {
            dimension,
            entries: HashMap::new(),
        })
    }

    /// Build a complete index off to the side. The caller swaps it in once
    /// every entry has been accepted.
    pub fn rebuild<I>(dimension: usize, entries: I) -> Result<Self, IndexError>
    where
        I: IntoIterator<Item = (MemoryId, Vec<f32>)>,
    {
        let mut index = Self::new(dimension)?;
        for (id, embedding) in entries {
            index.upsert(id, embedding)?;
        }
        debug!("Rebuilt vector index with {} entries", index.len());
        Ok(index)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MemoryId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &MemoryId) -> Option<&[f32]> {
        self.entries.get(id).map(Vec::as_slice)
    }

    pub fn ids(&self) -> impl Iterator<Item = &MemoryId> {
        self.entries.keys()
    }

    pub fn validate(&self, id: &MemoryId, embedding: &[f32]) -> Result<(), IndexError> {
        if embedding.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::NonFinite(id.to_string()));
        }
        Ok(())
    }

    pub fn upsert(&mut self, id: MemoryId, embedding: Vec<f32>) -> Result<(), IndexError> {
        self.validate(&id, &embedding)?;
        self.entries.insert(id, embedding);
        Ok(())
    }

    pub fn remove(&mut self, id: &MemoryId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Most similar entries first; equal similarities are ordered by id.
    pub fn query(&self, embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>, IndexError> {
        if embedding.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<VectorHit> = self
            .entries
            .iter()
            .map(|(id, stored)| VectorHit {
                id: id.clone(),
                similarity: cosine_similarity(embedding, stored),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Cosine similarity, 0.0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        let d = vec![-1.0, 0.0, 0.0];

        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.001);
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 0.001);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[test]
    fn test_query_orders_by_similarity_then_id() {
        let mut index = VectorIndex::new(2).unwrap();
        index.upsert("mem_b".into(), vec![1.0, 0.0]).unwrap();
        index.upsert("mem_a".into(), vec![2.0, 0.0]).unwrap();
        index.upsert("mem_c".into(), vec![0.0, 1.0]).unwrap();

        let hits = index.query(&[1.0, 0.0], 10).unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.0.as_str()).collect();
        assert_eq!(ids, vec!["mem_a", "mem_b", "mem_c"]);
        assert_eq!(index.query(&[1.0, 0.0], 1).unwrap().len(), 1);
    }

    #[test]
    fn test_dimension_validation() {
        let mut index = VectorIndex::new(3).unwrap();
        let err = index.upsert("mem_a".into(), vec![1.0]).unwrap_err();
        assert_eq!(err, IndexError::DimensionMismatch { expected: 3, actual: 1 });

        let err = index.upsert("mem_a".into(), vec![f32::NAN, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, IndexError::NonFinite(_)));
        assert!(index.is_empty());

        assert!(VectorIndex::new(0).is_err());
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let entries = vec![
            (MemoryId::from("mem_a"), vec![1.0, 0.0]),
            (MemoryId::from("mem_b"), vec![0.0, 1.0]),
        ];
        let first = VectorIndex::rebuild(2, entries.clone()).unwrap();
        let second = VectorIndex::rebuild(2, entries).unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(
            first.query(&[1.0, 1.0], 2).unwrap(),
            second.query(&[1.0, 1.0], 2).unwrap()
        );
    }

    #[test]
    fn test_remove() {
        let mut index = VectorIndex::new(2).unwrap();
        index.upsert("mem_a".into(), vec![1.0, 0.0]).unwrap();
        assert!(index.remove(&"mem_a".into()));
        assert!(!index.contains(&"mem_a".into()));
        assert!(!index.remove(&"mem_a".into()));
    }
}
