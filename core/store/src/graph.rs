use crate::error::{MemoryError, Result};
use chrono::Utc;
use recall_schemas::{AssociationEdge, GraphStats, MemoryId, RelationDirection, RelationType};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::debug;

pub const MAX_PATH_DEPTH: usize = 3;
pub const MAX_PATHS: usize = 3;

/// Identity of an edge. Symmetric relations are keyed with the smaller id
/// as source, so `(a, b)` and `(b, a)` collapse to one edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey {
    pub source: MemoryId,
    pub target: MemoryId,
    pub relation_type: RelationType,
}

impl EdgeKey {
    pub fn new(source: &MemoryId, target: &MemoryId, relation_type: RelationType) -> Self {
        let (source, target) = if relation_type.is_symmetric() && target < source {
            (target, source)
        } else {
            (source, target)
        };
        Self {
            source: source.clone(),
            target: target.clone(),
            relation_type,
        }
    }

    pub fn of(edge: &AssociationEdge) -> Self {
        Self::new(&edge.source_id, &edge.target_id, edge.relation_type)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: MemoryId,
    pub relation_type: RelationType,
    pub direction: RelationDirection,
    pub weight: f32,
}

/// Edge differences between two graph states.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeDiff {
    pub removed: Vec<EdgeKey>,
    pub upserted: Vec<AssociationEdge>,
}

/// Typed, weighted association edges between records.
#[derive(Debug, Clone, Default)]
pub struct AssociationGraph {
    edges: BTreeMap<EdgeKey, AssociationEdge>,
    adjacency: HashMap<MemoryId, BTreeSet<EdgeKey>>,
}

pub fn validate_link(source: &MemoryId, target: &MemoryId, weight: f32) -> Result<()> {
    if source == target {
        return Err(MemoryError::InvalidArgument(format!(
            "cannot associate {} with itself",
            source
        )));
    }
    if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
        return Err(MemoryError::InvalidArgument(format!(
            "association weight must be within [0, 1], got {}",
            weight
        )));
    }
    Ok(())
}

impl AssociationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_edges(edges: impl IntoIterator<Item = AssociationEdge>) -> Self {
        let mut graph = Self::new();
        for edge in edges {
            graph.insert(edge);
        }
        graph
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edges(&self) -> impl Iterator<Item = &AssociationEdge> {
        self.edges.values()
    }

    pub fn get(&self, key: &EdgeKey) -> Option<&AssociationEdge> {
        self.edges.get(key)
    }

    pub fn contains_node(&self, id: &MemoryId) -> bool {
        self.adjacency.contains_key(id)
    }

    /// True when any relation connects the two records, in either direction.
    pub fn are_linked(&self, a: &MemoryId, b: &MemoryId) -> bool {
        self.adjacency
            .get(a)
            .map(|keys| keys.iter().any(|k| &k.source == b || &k.target == b))
            .unwrap_or(false)
    }

    pub fn edges_of(&self, id: &MemoryId) -> Vec<&AssociationEdge> {
        self.adjacency
            .get(id)
            .map(|keys| keys.iter().filter_map(|k| self.edges.get(k)).collect())
            .unwrap_or_default()
    }

    /// Insert an already validated edge, replacing any edge with the same key.
    pub fn insert(&mut self, edge: AssociationEdge) {
        let key = EdgeKey::of(&edge);
        let edge = AssociationEdge {
            source_id: key.source.clone(),
            target_id: key.target.clone(),
            ..edge
        };
        self.adjacency
            .entry(key.source.clone())
            .or_default()
            .insert(key.clone());
        self.adjacency
            .entry(key.target.clone())
            .or_default()
            .insert(key.clone());
        self.edges.insert(key, edge);
    }

    /// Create or re-weight an association. Returns the stored edge and
    /// whether it is new. Re-linking keeps the original creation time.
    pub fn link(
        &mut self,
        source: &MemoryId,
        target: &MemoryId,
        relation_type: RelationType,
        weight: f32,
    ) -> Result<(AssociationEdge, bool)> {
        validate_link(source, target, weight)?;
        let key = EdgeKey::new(source, target, relation_type);

        if let Some(existing) = self.edges.get_mut(&key) {
            existing.weight = weight;
            debug!("Updated {} edge {} -> {} to {:.2}", relation_type, key.source, key.target, weight);
            return Ok((existing.clone(), false));
        }

        let edge = AssociationEdge {
            source_id: key.source.clone(),
            target_id: key.target.clone(),
            relation_type,
            weight,
            created_at: Utc::now(),
        };
        self.insert(edge.clone());
        Ok((edge, true))
    }

    pub fn unlink(
        &mut self,
        source: &MemoryId,
        target: &MemoryId,
        relation_type: RelationType,
    ) -> Option<AssociationEdge> {
        let key = EdgeKey::new(source, target, relation_type);
        self.remove_key(&key)
    }

    fn remove_key(&mut self, key: &EdgeKey) -> Option<AssociationEdge> {
        let edge = self.edges.remove(key)?;
        for endpoint in [&key.source, &key.target] {
            if let Some(keys) = self.adjacency.get_mut(endpoint) {
                keys.remove(key);
                if keys.is_empty() {
                    self.adjacency.remove(endpoint);
                }
            }
        }
        Some(edge)
    }

    /// Remove every edge touching `id`.
    pub fn purge(&mut self, id: &MemoryId) -> Vec<AssociationEdge> {
        let keys: Vec<EdgeKey> = self
            .adjacency
            .get(id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.iter().filter_map(|key| self.remove_key(key)).collect()
    }

    /// Fold `absorbed` nodes into `canonical`. Their edges are re-pointed at
    /// the canonical node; edges that would become self-loops are dropped and
    /// collisions keep the heavier weight.
    pub fn merge_nodes(&mut self, canonical: &MemoryId, absorbed: &[MemoryId]) {
        for old in absorbed {
            if old == canonical {
                continue;
            }
            for edge in self.purge(old) {
                let source = if &edge.source_id == old { canonical } else { &edge.source_id };
                let target = if &edge.target_id == old { canonical } else { &edge.target_id };
                if source == target {
                    continue;
                }
                let key = EdgeKey::new(source, target, edge.relation_type);
                let (weight, created_at) = match self.edges.get(&key) {
                    Some(existing) => (existing.weight.max(edge.weight), existing.created_at),
                    None => (edge.weight, edge.created_at),
                };
                self.insert(AssociationEdge {
                    source_id: source.clone(),
                    target_id: target.clone(),
                    relation_type: edge.relation_type,
                    weight,
                    created_at,
                });
            }
        }
    }

    /// Neighbours ranked by edge weight, then by the neighbour's importance.
    pub fn neighbors<F>(&self, id: &MemoryId, max: usize, importance: F) -> Vec<Neighbor>
    where
        F: Fn(&MemoryId) -> f32,
    {
        let mut neighbors: Vec<Neighbor> = self
            .edges_of(id)
            .into_iter()
            .filter_map(|edge| {
                let other = edge.other_end(id)?.clone();
                let direction = if edge.relation_type.is_symmetric() {
                    RelationDirection::Undirected
                } else if &edge.source_id == id {
                    RelationDirection::Outgoing
                } else {
                    RelationDirection::Incoming
                };
                Some(Neighbor {
                    id: other,
                    relation_type: edge.relation_type,
                    direction,
                    weight: edge.weight,
                })
            })
            .collect();

        neighbors.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| importance(&b.id).total_cmp(&importance(&a.id)))
                .then_with(|| a.id.cmp(&b.id))
                .then_with(|| a.relation_type.cmp(&b.relation_type))
        });
        neighbors.truncate(max);
        neighbors
    }

    fn adjacent_ids(&self, id: &MemoryId) -> BTreeSet<&MemoryId> {
        self.edges_of(id)
            .into_iter()
            .filter_map(|edge| edge.other_end(id))
            .collect()
    }

    /// Simple paths between two records, ignoring direction. Shortest paths
    /// come first; at most `max_paths` paths of at most `max_depth` hops.
    pub fn find_paths(
        &self,
        from: &MemoryId,
        to: &MemoryId,
        max_depth: usize,
        max_paths: usize,
    ) -> Vec<Vec<MemoryId>> {
        if from == to || !self.contains_node(from) || !self.contains_node(to) {
            return Vec::new();
        }

        let mut paths: Vec<Vec<MemoryId>> = Vec::new();
        let mut stack = vec![from.clone()];
        self.walk(to, max_depth, &mut stack, &mut paths);

        paths.sort_by(|a, b| match a.len().cmp(&b.len()) {
            Ordering::Equal => a.cmp(b),
            other => other,
        });
        paths.truncate(max_paths);
        paths
    }

    fn walk(
        &self,
        goal: &MemoryId,
        max_depth: usize,
        stack: &mut Vec<MemoryId>,
        paths: &mut Vec<Vec<MemoryId>>,
    ) {
        let Some(current) = stack.last().cloned() else {
            return;
        };
        if stack.len() > max_depth {
            return;
        }
        for next in self.adjacent_ids(&current) {
            if stack.contains(next) {
                continue;
            }
            if next == goal {
                let mut path = stack.clone();
                path.push(next.clone());
                paths.push(path);
                continue;
            }
            stack.push(next.clone());
            self.walk(goal, max_depth, stack, paths);
            stack.pop();
        }
    }

    /// Connected components of linked records, largest first.
    pub fn clusters(&self) -> Vec<Vec<MemoryId>> {
        let mut seen: BTreeSet<&MemoryId> = BTreeSet::new();
        let mut clusters = Vec::new();

        let mut nodes: Vec<&MemoryId> = self.adjacency.keys().collect();
        nodes.sort();

        for start in nodes {
            if !seen.insert(start) {
                continue;
            }
            let mut component = vec![start.clone()];
            let mut queue = VecDeque::from([start]);
            while let Some(node) = queue.pop_front() {
                for next in self.adjacent_ids(node) {
                    if seen.insert(next) {
                        component.push(next.clone());
                        queue.push_back(next);
                    }
                }
            }
            component.sort();
            clusters.push(component);
        }

        clusters.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        clusters
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            nodes: self.node_count(),
            edges: self.edge_count(),
            clusters: self.clusters().len(),
        }
    }

    /// Edges whose endpoints fail `is_live`.
    pub fn dangling<F>(&self, is_live: F) -> Vec<EdgeKey>
    where
        F: Fn(&MemoryId) -> bool,
    {
        self.edges
            .keys()
            .filter(|key| !is_live(&key.source) || !is_live(&key.target))
            .cloned()
            .collect()
    }

    /// What must change to turn `self` into `next`.
    pub fn diff(&self, next: &AssociationGraph) -> EdgeDiff {
        let removed = self
            .edges
            .keys()
            .filter(|key| !next.edges.contains_key(*key))
            .cloned()
            .collect();
        let upserted = next
            .edges
            .iter()
            .filter(|(key, edge)| self.edges.get(*key) != Some(*edge))
            .map(|(_, edge)| edge.clone())
            .collect();
        EdgeDiff { removed, upserted }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> MemoryId {
        MemoryId::from(s)
    }

    #[test]
    fn test_link_is_idempotent_and_updates_weight() {
        let mut graph = AssociationGraph::new();
        let (_, created) = graph.link(&id("a"), &id("b"), RelationType::RelatedTo, 0.4).unwrap();
        assert!(created);
        let (edge, created) = graph.link(&id("b"), &id("a"), RelationType::RelatedTo, 0.9).unwrap();
        assert!(!created);
        assert_eq!(edge.weight, 0.9);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_directed_relations_keep_both_directions() {
        let mut graph = AssociationGraph::new();
        graph.link(&id("a"), &id("b"), RelationType::Precedes, 0.5).unwrap();
        graph.link(&id("b"), &id("a"), RelationType::Precedes, 0.5).unwrap();
        assert_eq!(graph.edge_count(), 2);

        let neighbors = graph.neighbors(&id("a"), 10, |_| 0.5);
        let directions: BTreeSet<_> = neighbors.iter().map(|n| format!("{:?}", n.direction)).collect();
        assert!(directions.contains("Outgoing"));
        assert!(directions.contains("Incoming"));
    }

    #[test]
    fn test_rejects_self_loops_and_bad_weights() {
        let mut graph = AssociationGraph::new();
        let err = graph.link(&id("a"), &id("a"), RelationType::RelatedTo, 0.5).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));
        assert!(graph.link(&id("a"), &id("b"), RelationType::RelatedTo, 1.5).is_err());
        assert!(graph.link(&id("a"), &id("b"), RelationType::RelatedTo, f32::NAN).is_err());
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_neighbors_rank_by_weight_then_importance() {
        let mut graph = AssociationGraph::new();
        graph.link(&id("hub"), &id("low"), RelationType::RelatedTo, 0.5).unwrap();
        graph.link(&id("hub"), &id("high"), RelationType::RelatedTo, 0.5).unwrap();
        graph.link(&id("hub"), &id("heavy"), RelationType::RelatedTo, 0.9).unwrap();

        let importance = |m: &MemoryId| if m.0 == "high" { 0.9 } else { 0.1 };
        let ids: Vec<_> = graph
            .neighbors(&id("hub"), 10, importance)
            .into_iter()
            .map(|n| n.id.0)
            .collect();
        assert_eq!(ids, vec!["heavy", "high", "low"]);

        assert_eq!(graph.neighbors(&id("hub"), 1, importance).len(), 1);
    }

    #[test]
    fn test_purge_removes_all_edges() {
        let mut graph = AssociationGraph::new();
        graph.link(&id("a"), &id("b"), RelationType::RelatedTo, 0.5).unwrap();
        graph.link(&id("c"), &id("a"), RelationType::CausedBy, 0.5).unwrap();
        graph.link(&id("b"), &id("c"), RelationType::RelatedTo, 0.5).unwrap();

        let removed = graph.purge(&id("a"));
        assert_eq!(removed.len(), 2);
        assert!(!graph.contains_node(&id("a")));
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.dangling(|m| m.0 != "a").is_empty());
    }

    #[test]
    fn test_find_paths_and_clusters() {
        let mut graph = AssociationGraph::new();
        graph.link(&id("a"), &id("b"), RelationType::RelatedTo, 0.5).unwrap();
        graph.link(&id("b"), &id("c"), RelationType::RelatedTo, 0.5).unwrap();
        graph.link(&id("a"), &id("c"), RelationType::RelatedTo, 0.5).unwrap();
        graph.link(&id("x"), &id("y"), RelationType::RelatedTo, 0.5).unwrap();

        let paths = graph.find_paths(&id("a"), &id("c"), MAX_PATH_DEPTH, MAX_PATHS);
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0], vec![id("a"), id("c")]);
        assert_eq!(paths[1], vec![id("a"), id("b"), id("c")]);
        assert!(graph.find_paths(&id("a"), &id("x"), 3, 3).is_empty());

        let clusters = graph.clusters();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0], vec![id("a"), id("b"), id("c")]);

        let stats = graph.stats();
        assert_eq!(stats.nodes, 5);
        assert_eq!(stats.edges, 4);
        assert_eq!(stats.clusters, 2);
    }

    #[test]
    fn test_merge_nodes_rewires_edges() {
        let mut graph = AssociationGraph::new();
        graph.link(&id("dup"), &id("other"), RelationType::CausedBy, 0.4).unwrap();
        graph.link(&id("keep"), &id("other"), RelationType::CausedBy, 0.7).unwrap();
        graph.link(&id("keep"), &id("dup"), RelationType::SimilarTo, 0.9).unwrap();
        graph.link(&id("third"), &id("dup"), RelationType::RelatedTo, 0.3).unwrap();

        let before = graph.clone();
        graph.merge_nodes(&id("keep"), &[id("dup")]);

        assert!(!graph.contains_node(&id("dup")));
        let caused = graph
            .get(&EdgeKey::new(&id("keep"), &id("other"), RelationType::CausedBy))
            .unwrap();
        assert_eq!(caused.weight, 0.7);
        assert!(graph.are_linked(&id("keep"), &id("third")));
        assert_eq!(graph.edge_count(), 2);

        let diff = before.diff(&graph);
        assert_eq!(diff.removed.len(), 3);
        assert_eq!(diff.upserted.len(), 1);
    }
}
