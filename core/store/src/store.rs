use crate::codec::{self, validate_content, validate_importance};
use crate::config::MemoryConfig;
use crate::database::{CachedVector, ChangeSet, Database, EXTERNAL_VECTOR_MODEL};
use crate::error::{MemoryError, Result};
use crate::graph::{validate_link, AssociationGraph, EdgeKey, MAX_PATHS, MAX_PATH_DEPTH};
use crate::heuristic::{ExtractorConfig, MemoryExtractor};
use crate::organizer::{OrganizeContext, Organizer};
use crate::reasoning::{LlmReasoner, ReasoningProvider};
use crate::retrieval::{fuse_scores, rank, resolve_associated};
use chrono::{DateTime, Utc};
use recall_indexing::{
    embedder_from_env, normalize, BackendError, EmbeddingBackend, LexicalIndex, LexicalMode,
    RankHints, Tokenizer, VectorIndex, WordTokenizer,
};
use recall_schemas::{
    ApplySummary, AssociatedMemory, AssociationEdge, ComponentState, ComponentStatus,
    ExportFormat, ImportReport, MemoryFilter, MemoryId, MemoryPatch, MemoryRecord, MemoryStats,
    NewMemory, OrganizationProposal, OrganizeTask, ProposalId, ProposalOperation, RecordError,
    RelationType, SearchHit, SearchQuery, DEFAULT_IMPORTANCE,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Weight of an explicit association when the caller gives none.
pub const DEFAULT_LINK_WEIGHT: f32 = 1.0;

/// Optional collaborators. Each one that is `None` degrades the store
/// instead of failing it.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub tokenizer: Option<Arc<dyn Tokenizer>>,
    pub embedder: Option<Arc<dyn EmbeddingBackend>>,
    pub reasoner: Option<Arc<dyn ReasoningProvider>>,
}

impl Collaborators {
    /// Word tokenizer only: no embeddings, no reasoning service.
    pub fn local() -> Self {
        Self {
            tokenizer: Some(Arc::new(WordTokenizer::new())),
            embedder: None,
            reasoner: None,
        }
    }

    pub fn from_env() -> Self {
        let reasoner = LlmReasoner::from_env_optional()
            .map(|reasoner| Arc::new(reasoner) as Arc<dyn ReasoningProvider>);
        Self {
            tokenizer: Some(Arc::new(WordTokenizer::new())),
            embedder: embedder_from_env(),
            reasoner,
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: Option<Arc<dyn Tokenizer>>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingBackend>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_reasoner(mut self, reasoner: Arc<dyn ReasoningProvider>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub records: usize,
    pub edges: usize,
    pub vectors: usize,
    pub dropped_edges: usize,
}

/// A proposal waiting for approval, with the `updated_at` of every record
/// it touches at the time it was made.
struct PendingProposal {
    proposal: OrganizationProposal,
    versions: HashMap<MemoryId, DateTime<Utc>>,
}

/// Next state computed by `apply_organization` before anything is written.
struct ApplyPlan {
    changes: ChangeSet,
    updated: Vec<MemoryRecord>,
    absorbed: Vec<MemoryId>,
    graph: AssociationGraph,
    summary: ApplySummary,
}

/// The memory engine: SQLite is the source of truth, the lexical index,
/// vector index and association graph are kept in step with it.
///
/// Every write goes through one `ChangeSet` transaction first; the
/// in-memory structures are only touched after it commits. Async methods
/// take `&mut self` so the futures stay `Send` (the connection is not
/// `Sync`) and nothing can interleave with them.
pub struct MemoryStore {
    config: MemoryConfig,
    db: Database,
    records: HashMap<MemoryId, MemoryRecord>,
    lexical: LexicalIndex,
    vectors: Option<VectorIndex>,
    graph: AssociationGraph,
    embedder: Option<Arc<dyn EmbeddingBackend>>,
    organizer: Organizer,
    extractor: MemoryExtractor,
    proposals: HashMap<ProposalId, PendingProposal>,
    consistent: bool,
}

impl MemoryStore {
    pub fn open(config: MemoryConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let db = Database::open(&config.db_path)?;
        Self::from_database(config, db, collaborators)
    }

    pub fn open_in_memory(config: MemoryConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let db = Database::open_in_memory()?;
        Self::from_database(config, db, collaborators)
    }

    fn from_database(config: MemoryConfig, db: Database, collaborators: Collaborators) -> Result<Self> {
        db.check_integrity()?;

        let vectors = match &collaborators.embedder {
            Some(embedder) => Some(VectorIndex::new(embedder.dimension())?),
            None => None,
        };

        let mut store = Self {
            organizer: Organizer::new(collaborators.reasoner, config.organizer.clone())?,
            extractor: MemoryExtractor::new(ExtractorConfig::default())?,
            lexical: LexicalIndex::new(collaborators.tokenizer),
            embedder: collaborators.embedder,
            config,
            db,
            records: HashMap::new(),
            vectors,
            graph: AssociationGraph::new(),
            proposals: HashMap::new(),
            consistent: true,
        };
        let loaded = store.load_state(false)?;

        info!(
            "Memory store ready: {} records, {} edges, {} vectors",
            loaded.records, loaded.edges, loaded.vectors
        );
        Ok(store)
    }

    /// Rebuild every in-memory structure from the database. Dangling edges
    /// are `Corrupt` unless `drop_dangling` is set, in which case they are
    /// deleted.
    fn load_state(&mut self, drop_dangling: bool) -> Result<RepairReport> {
        let records: HashMap<MemoryId, MemoryRecord> = self
            .db
            .load_records()?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let mut graph = AssociationGraph::from_edges(self.db.load_edges()?);
        let cached = self.db.load_vectors()?;

        let dangling = graph.dangling(|id| records.contains_key(id));
        if !dangling.is_empty() {
            if !drop_dangling {
                return Err(MemoryError::Corrupt(format!(
                    "{} edges reference missing records",
                    dangling.len()
                )));
            }
            self.db.apply(&ChangeSet {
                delete_edges: dangling.clone(),
                ..Default::default()
            })?;
            for key in &dangling {
                graph.unlink(&key.source, &key.target, key.relation_type);
            }
            warn!("Dropped {} dangling edges", dangling.len());
        }

        let vectors = match &self.embedder {
            Some(embedder) => Some(VectorIndex::rebuild(
                embedder.dimension(),
                cached
                    .into_iter()
                    .filter(|v| records.contains_key(&v.memory_id))
                    .filter(|v| usable_vector(embedder.as_ref(), &v.model, &v.embedding))
                    .map(|v| (v.memory_id, v.embedding)),
            )?),
            None => None,
        };

        self.lexical.clear();
        for record in records.values() {
            self.lexical.index(&record.id, &record.content, hints(record));
        }

        let report = RepairReport {
            records: records.len(),
            edges: graph.edge_count(),
            vectors: vectors.as_ref().map(VectorIndex::len).unwrap_or(0),
            dropped_edges: dangling.len(),
        };
        self.records = records;
        self.graph = graph;
        self.vectors = vectors;
        self.consistent = true;
        Ok(report)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_consistent(&self) -> bool {
        self.consistent
    }

    fn ensure_consistent(&self) -> Result<()> {
        if self.consistent {
            Ok(())
        } else {
            Err(MemoryError::Corrupt(
                "indexes are out of step with storage; run repair".into(),
            ))
        }
    }

    // ------------------------------------------------------------------
    // Record store
    // ------------------------------------------------------------------

    /// Store a complete record. The id must be new.
    pub async fn put(&mut self, mut record: MemoryRecord) -> Result<MemoryId> {
        self.ensure_consistent()?;
        validate_record(&record)?;
        if self.records.contains_key(&record.id) {
            return Err(MemoryError::Conflict(format!("memory {} already exists", record.id)));
        }

        let vector = vector_for(self.embedder.clone(), &mut record).await;
        let links = self.auto_link_edges(&record.id, &record.content);

        self.db.apply(&ChangeSet {
            upsert_records: vec![record.clone()],
            upsert_edges: links.clone(),
            upsert_vectors: vector.iter().cloned().collect(),
            ..Default::default()
        })?;

        let id = record.id.clone();
        self.install(record, vector.as_ref());
        for edge in &links {
            self.graph.insert(edge.clone());
        }
        info!("Added memory {} ({} auto-links)", id, links.len());

        self.enforce_capacity(std::slice::from_ref(&id))?;
        Ok(id)
    }

    /// Create a record from content. Without an explicit type the keyword
    /// classifier picks one.
    pub async fn add(&mut self, new: NewMemory) -> Result<MemoryId> {
        validate_content(&new.content)?;
        let importance = new.importance.unwrap_or(DEFAULT_IMPORTANCE);
        validate_importance(importance)?;

        let memory_type = match new.memory_type {
            Some(memory_type) => memory_type,
            None => self.extractor.classifier().classify(&new.content).memory_type,
        };

        let record = MemoryRecord::new(new.content.trim(), importance, memory_type)
            .with_tags(clean_tags(new.tags))
            .with_metadata(new.metadata);
        self.put(record).await
    }

    pub fn get(&self, id: &MemoryId) -> Result<MemoryRecord> {
        self.records
            .get(id)
            .cloned()
            .ok_or_else(|| MemoryError::not_found("memory", id))
    }

    /// Newest first.
    pub fn list(&self, filter: &MemoryFilter) -> Vec<MemoryRecord> {
        let mut records: Vec<MemoryRecord> = self
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        records
    }

    pub async fn update(&mut self, id: &MemoryId, patch: MemoryPatch) -> Result<MemoryRecord> {
        self.ensure_consistent()?;
        let current = self.get(id)?;

        let mut next = current.clone();
        if let Some(content) = patch.content {
            validate_content(&content)?;
            next.content = content;
        }
        if let Some(importance) = patch.importance {
            validate_importance(importance)?;
            next.importance = importance;
        }
        if let Some(memory_type) = patch.memory_type {
            next.memory_type = memory_type;
        }
        if let Some(tags) = patch.tags {
            next.tags = clean_tags(tags);
        }
        if let Some(metadata) = patch.metadata {
            next.metadata = metadata;
        }
        if next == current {
            return Ok(current);
        }
        next.updated_at = touch(current.updated_at);

        let content_changed = next.content != current.content;
        let mut vector = None;
        if content_changed {
            next.embedding = None;
            vector = vector_for(self.embedder.clone(), &mut next).await;
        }

        self.db.apply(&ChangeSet {
            upsert_records: vec![next.clone()],
            upsert_vectors: vector.iter().cloned().collect(),
            ..Default::default()
        })?;

        if content_changed {
            if let Some(index) = &mut self.vectors {
                index.remove(id);
            }
            self.install(next.clone(), vector.as_ref());
        } else {
            self.lexical.update_hints(id, hints(&next));
            self.records.insert(id.clone(), next.clone());
        }

        debug!("Updated memory {}", id);
        Ok(next)
    }

    pub fn delete(&mut self, id: &MemoryId) -> Result<()> {
        self.ensure_consistent()?;
        if !self.records.contains_key(id) {
            return Err(MemoryError::not_found("memory", id));
        }
        self.delete_many(std::slice::from_ref(id))?;
        info!("Deleted memory {}", id);
        Ok(())
    }

    /// Delete the least important records beyond capacity, oldest first
    /// among equals.
    pub fn prune(&mut self) -> Result<Vec<MemoryId>> {
        self.ensure_consistent()?;
        self.enforce_capacity(&[])
    }

    fn enforce_capacity(&mut self, keep: &[MemoryId]) -> Result<Vec<MemoryId>> {
        let max = self.config.max_memories;
        if max == 0 || self.records.len() <= max {
            return Ok(Vec::new());
        }
        let excess = self.records.len() - max;

        // Records in `keep` go last, so they are only evicted when
        // everything else is already gone.
        let keep: HashSet<&MemoryId> = keep.iter().collect();
        let mut candidates: Vec<&MemoryRecord> = self.records.values().collect();
        candidates.sort_by(|a, b| {
            keep.contains(&a.id)
                .cmp(&keep.contains(&b.id))
                .then_with(|| a.importance.total_cmp(&b.importance))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let victims: Vec<MemoryId> = candidates
            .into_iter()
            .take(excess)
            .map(|r| r.id.clone())
            .collect();

        self.delete_many(&victims)?;
        info!("Pruned {} memories over capacity {}", victims.len(), max);
        Ok(victims)
    }

    fn delete_many(&mut self, ids: &[MemoryId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        // Edges and cached vectors follow through ON DELETE CASCADE.
        self.db.apply(&ChangeSet {
            delete_records: ids.to_vec(),
            ..Default::default()
        })?;
        for id in ids {
            self.forget(id);
        }
        self.verify_purged(ids)
    }

    fn install(&mut self, record: MemoryRecord, vector: Option<&CachedVector>) {
        self.lexical.index(&record.id, &record.content, hints(&record));
        if let (Some(vector), Some(embedder), Some(index)) = (vector, &self.embedder, &mut self.vectors) {
            if usable_vector(embedder.as_ref(), &vector.model, &vector.embedding) {
                if let Err(e) = index.upsert(record.id.clone(), vector.embedding.clone()) {
                    warn!("Vector for {} not indexed: {}", record.id, e);
                }
            }
        }
        self.records.insert(record.id.clone(), record);
    }

    fn forget(&mut self, id: &MemoryId) {
        self.records.remove(id);
        self.lexical.remove(id);
        if let Some(index) = &mut self.vectors {
            index.remove(id);
        }
        self.graph.purge(id);
    }

    /// Flag the store inconsistent if anything still references `ids`.
    fn verify_purged(&mut self, ids: &[MemoryId]) -> Result<()> {
        let remaining: Vec<String> = ids
            .iter()
            .filter(|id| {
                self.records.contains_key(*id)
                    || self.lexical.contains(id)
                    || self.graph.contains_node(id)
                    || self.vectors.as_ref().map(|v| v.contains(id)).unwrap_or(false)
            })
            .map(|id| id.to_string())
            .collect();
        if remaining.is_empty() {
            return Ok(());
        }

        self.consistent = false;
        error!("Deleted memories still referenced: {}", remaining.join(", "));
        Err(MemoryError::Corrupt(format!(
            "deleted memories still referenced: {}",
            remaining.join(", ")
        )))
    }

    // ------------------------------------------------------------------
    // Association graph
    // ------------------------------------------------------------------

    /// Auto-link edges for `id`: a `similar_to` edge (by default) to each
    /// record whose term overlap reaches the threshold. `put` commits them
    /// with the record. Edges that already exist with the same weight are
    /// left out.
    fn auto_link_edges(&self, id: &MemoryId, content: &str) -> Vec<AssociationEdge> {
        let policy = &self.config.auto_link;
        if !policy.enabled {
            return Vec::new();
        }

        let terms = self.lexical.terms_for(content);
        let now = Utc::now();
        self.lexical
            .overlapping(&terms, policy.threshold, Some(id))
            .into_iter()
            .filter(|(other, _)| self.records.contains_key(other))
            .take(policy.max_links)
            .filter_map(|(other, similarity)| {
                let key = EdgeKey::new(id, &other, policy.relation_type);
                let weight = similarity.clamp(0.0, 1.0);
                match self.graph.get(&key) {
                    Some(existing) if existing.weight == weight => None,
                    Some(existing) => Some(AssociationEdge {
                        weight,
                        ..existing.clone()
                    }),
                    None => Some(AssociationEdge {
                        source_id: key.source,
                        target_id: key.target,
                        relation_type: policy.relation_type,
                        weight,
                        created_at: now,
                    }),
                }
            })
            .collect()
    }

    /// Link two records. Re-associating the same pair and relation updates
    /// the weight.
    pub fn associate(
        &mut self,
        source: &MemoryId,
        target: &MemoryId,
        relation_type: RelationType,
        weight: Option<f32>,
    ) -> Result<AssociationEdge> {
        self.ensure_consistent()?;
        let weight = weight.unwrap_or(DEFAULT_LINK_WEIGHT);
        validate_link(source, target, weight)?;
        for id in [source, target] {
            if !self.records.contains_key(id) {
                return Err(MemoryError::not_found("memory", id));
            }
        }

        let key = EdgeKey::new(source, target, relation_type);
        let edge = match self.graph.get(&key) {
            Some(existing) => AssociationEdge {
                weight,
                ..existing.clone()
            },
            None => AssociationEdge {
                source_id: key.source.clone(),
                target_id: key.target.clone(),
                relation_type,
                weight,
                created_at: Utc::now(),
            },
        };

        self.db.apply(&ChangeSet {
            upsert_edges: vec![edge.clone()],
            ..Default::default()
        })?;
        self.graph.insert(edge.clone());

        info!("Associated {} -[{}]-> {} ({:.2})", source, relation_type, target, weight);
        Ok(edge)
    }

    pub fn unlink(
        &mut self,
        source: &MemoryId,
        target: &MemoryId,
        relation_type: RelationType,
    ) -> Result<AssociationEdge> {
        self.ensure_consistent()?;
        let key = EdgeKey::new(source, target, relation_type);
        let Some(edge) = self.graph.get(&key).cloned() else {
            return Err(MemoryError::NotFound(format!(
                "association {} -[{}]-> {}",
                source, relation_type, target
            )));
        };

        self.db.apply(&ChangeSet {
            delete_edges: vec![key],
            ..Default::default()
        })?;
        self.graph.unlink(source, target, relation_type);

        info!("Unlinked {} -[{}]-> {}", source, relation_type, target);
        Ok(edge)
    }

    /// Neighbours of `id` as full records, strongest links first.
    pub fn get_associated(&self, id: &MemoryId, max_results: usize) -> Result<Vec<AssociatedMemory>> {
        if !self.records.contains_key(id) {
            return Err(MemoryError::not_found("memory", id));
        }
        let neighbors = self.graph.neighbors(id, usize::MAX, |n| {
            self.records.get(n).map(|r| r.importance).unwrap_or(0.0)
        });
        Ok(resolve_associated(neighbors, &self.records, max_results))
    }

    pub fn find_paths(&self, from: &MemoryId, to: &MemoryId) -> Result<Vec<Vec<MemoryId>>> {
        for id in [from, to] {
            if !self.records.contains_key(id) {
                return Err(MemoryError::not_found("memory", id));
            }
        }
        Ok(self.graph.find_paths(from, to, MAX_PATH_DEPTH, MAX_PATHS))
    }

    pub fn clusters(&self) -> Vec<Vec<MemoryId>> {
        self.graph.clusters()
    }

    /// Run the auto-link policy over every record. Returns the number of
    /// edges created or re-weighted; a second run returns 0.
    pub fn relink_all(&mut self) -> Result<usize> {
        self.ensure_consistent()?;

        let mut ids: Vec<&MemoryId> = self.records.keys().collect();
        ids.sort();
        let mut next = self.graph.clone();
        for id in ids {
            let content = &self.records[id].content;
            for edge in self.auto_link_edges(id, content) {
                next.insert(edge);
            }
        }

        let diff = self.graph.diff(&next);
        if diff.upserted.is_empty() {
            return Ok(0);
        }
        self.db.apply(&ChangeSet {
            upsert_edges: diff.upserted.clone(),
            ..Default::default()
        })?;
        self.graph = next;

        info!("Relinked {} associations", diff.upserted.len());
        Ok(diff.upserted.len())
    }

    // ------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------

    /// Hybrid search. The query is embedded when a vector index is active;
    /// if that fails the search is lexical only.
    pub async fn search(&mut self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let embedding = match &self.vectors {
            Some(index) if !index.is_empty() => embed_text(self.embedder.clone(), &query.query).await,
            _ => None,
        };
        self.search_with_embedding(query, embedding.as_deref())
    }

    pub fn search_with_embedding(
        &self,
        query: &SearchQuery,
        embedding: Option<&[f32]>,
    ) -> Result<Vec<SearchHit>> {
        if query.query.trim().is_empty() {
            return Err(MemoryError::InvalidArgument("query must not be empty".into()));
        }
        if let Some(min) = query.min_importance {
            validate_importance(min)?;
        }
        if query.limit == 0 {
            return Ok(Vec::new());
        }

        // Everything that matches; filters run before truncation.
        let lexical = self.lexical.search(&query.query, self.lexical.len().max(1));
        let vector = match (&self.vectors, embedding) {
            (Some(index), Some(embedding)) if !index.is_empty() => Some(index.query(
                embedding,
                self.config.search.vector_candidates.max(query.limit),
            )?),
            _ => None,
        };

        let fused = fuse_scores(&lexical, vector.as_deref(), &self.config.search);
        Ok(rank(fused, &self.records, query))
    }

    // ------------------------------------------------------------------
    // Stats and maintenance
    // ------------------------------------------------------------------

    pub fn stats(&self) -> MemoryStats {
        let mut type_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut importance_sum = 0.0f32;
        for record in self.records.values() {
            *type_counts.entry(record.memory_type.as_str().to_string()).or_default() += 1;
            importance_sum += record.importance;
        }
        let total = self.records.len();

        MemoryStats {
            total,
            type_counts,
            average_importance: if total == 0 { 0.0 } else { importance_sum / total as f32 },
            graph: self.graph.stats(),
            components: self.component_status(),
            pending_proposals: self.proposals.len(),
            consistent: self.consistent,
        }
    }

    pub fn component_status(&self) -> ComponentStatus {
        let lexical_index = match self.lexical.mode() {
            LexicalMode::Tokenized => ComponentState::Active,
            LexicalMode::Substring => ComponentState::Degraded,
        };
        let (vector_index, vector_entries) = match &self.vectors {
            Some(index) if index.len() >= self.records.len() => (ComponentState::Active, index.len()),
            Some(index) => (ComponentState::Degraded, index.len()),
            None => (ComponentState::Unavailable, 0),
        };
        let reasoning = if self.organizer.has_reasoner() {
            ComponentState::Active
        } else {
            ComponentState::Unavailable
        };

        ComponentStatus {
            lexical_index,
            vector_index,
            reasoning,
            vector_entries,
        }
    }

    /// Re-derive indexes and graph from the database, drop dangling edges
    /// and clear the inconsistent flag.
    pub fn repair(&mut self) -> Result<RepairReport> {
        self.db.check_integrity()?;
        let report = self.load_state(true)?;
        info!(
            "Repaired store: {} records, {} edges, {} vectors, {} dangling edges dropped",
            report.records, report.edges, report.vectors, report.dropped_edges
        );
        Ok(report)
    }

    /// Rebuild the vector index from the records, embedding those without
    /// a usable cached vector. The new index replaces the old one only once
    /// every record is done; on timeout or failure nothing changes.
    pub async fn rebuild_vector_index(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.ensure_consistent()?;
        let Some(embedder) = self.embedder.clone() else {
            return Err(MemoryError::Unavailable("no embedding backend configured".into()));
        };
        let timeout = timeout.unwrap_or(Duration::from_secs(self.config.rebuild_timeout_secs));

        let cached: HashMap<MemoryId, CachedVector> = self
            .db
            .load_vectors()?
            .into_iter()
            .map(|v| (v.memory_id.clone(), v))
            .collect();

        let mut ids: Vec<&MemoryId> = self.records.keys().collect();
        ids.sort();
        let mut entries: Vec<(MemoryId, Vec<f32>)> = Vec::with_capacity(ids.len());
        let mut pending: Vec<(MemoryId, String)> = Vec::new();
        for id in ids {
            match cached.get(id) {
                Some(v) if usable_vector(embedder.as_ref(), &v.model, &v.embedding) => {
                    entries.push((id.clone(), v.embedding.clone()));
                }
                _ => pending.push((id.clone(), self.records[id].content.clone())),
            }
        }

        let embed_all = async {
            let mut computed = Vec::with_capacity(pending.len());
            for (id, content) in &pending {
                let embedding = embedder.embed(content).await?;
                computed.push(CachedVector {
                    memory_id: id.clone(),
                    model: embedder.name().to_string(),
                    embedding,
                });
            }
            Ok::<_, BackendError>(computed)
        };
        let computed = tokio::time::timeout(timeout, embed_all)
            .await
            .map_err(|_| {
                MemoryError::ExternalFailure(format!("vector rebuild timed out after {:?}", timeout))
            })??;

        entries.extend(computed.iter().map(|v| (v.memory_id.clone(), v.embedding.clone())));
        let index = VectorIndex::rebuild(embedder.dimension(), entries)?;

        self.db.apply(&ChangeSet {
            upsert_vectors: computed.clone(),
            ..Default::default()
        })?;
        for vector in computed.iter() {
            if let Some(record) = self.records.get_mut(&vector.memory_id) {
                record.embedding = Some(vector.embedding.clone());
            }
        }
        let indexed = index.len();
        self.vectors = Some(index);

        info!("Rebuilt vector index: {} entries ({} newly embedded)", indexed, computed.len());
        Ok(indexed)
    }

    // ------------------------------------------------------------------
    // Import / export
    // ------------------------------------------------------------------

    /// Records oldest first, edges in key order.
    pub fn export(&self, format: ExportFormat) -> Result<Vec<u8>> {
        let mut records: Vec<MemoryRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let edges: Vec<AssociationEdge> = self.graph.edges().cloned().collect();
        codec::export(&records, &edges, format)
    }

    /// Merge an export into the store. Records whose id already exists are
    /// skipped; malformed entries are reported and skipped. Everything
    /// accepted lands in one transaction. Over capacity, the least
    /// important records go, imported or not. Embeddings are not computed
    /// here; run `rebuild_vector_index` afterwards.
    pub fn import(&mut self, bytes: &[u8], format: ExportFormat) -> Result<ImportReport> {
        self.ensure_consistent()?;
        let decoded = codec::decode(bytes, format)?;
        let mut report = ImportReport {
            errors: decoded.errors,
            ..Default::default()
        };

        let mut accepted: Vec<MemoryRecord> = Vec::new();
        let mut incoming: BTreeSet<MemoryId> = BTreeSet::new();
        for (index, record) in decoded.records {
            if self.records.contains_key(&record.id) {
                report.skipped_existing.push(record.id);
                continue;
            }
            if !incoming.insert(record.id.clone()) {
                report.errors.push(RecordError {
                    index,
                    id: Some(record.id.0),
                    message: "duplicate id in import".into(),
                });
                continue;
            }
            accepted.push(record);
        }

        let vectors: Vec<CachedVector> = accepted
            .iter()
            .filter_map(|r| {
                r.embedding.as_ref().map(|embedding| CachedVector {
                    memory_id: r.id.clone(),
                    model: EXTERNAL_VECTOR_MODEL.to_string(),
                    embedding: embedding.clone(),
                })
            })
            .collect();

        let mut edges: BTreeMap<EdgeKey, AssociationEdge> = BTreeMap::new();
        for (index, edge) in decoded.edges {
            let label = format!("{}->{}", edge.source_id, edge.target_id);
            if let Err(e) = validate_link(&edge.source_id, &edge.target_id, edge.weight) {
                report.errors.push(RecordError {
                    index,
                    id: Some(label),
                    message: format!("edge: {}", e),
                });
                continue;
            }
            let live = |id: &MemoryId| self.records.contains_key(id) || incoming.contains(id);
            if !live(&edge.source_id) || !live(&edge.target_id) {
                report.errors.push(RecordError {
                    index,
                    id: Some(label),
                    message: "edge: references an unknown memory".into(),
                });
                continue;
            }
            let key = EdgeKey::of(&edge);
            edges.insert(
                key.clone(),
                AssociationEdge {
                    source_id: key.source,
                    target_id: key.target,
                    ..edge
                },
            );
        }
        let edges: Vec<AssociationEdge> = edges.into_values().collect();

        self.db.apply(&ChangeSet {
            upsert_records: accepted.clone(),
            upsert_edges: edges.clone(),
            upsert_vectors: vectors.clone(),
            ..Default::default()
        })?;

        let vectors: HashMap<MemoryId, CachedVector> =
            vectors.into_iter().map(|v| (v.memory_id.clone(), v)).collect();
        for record in accepted {
            report.imported.push(record.id.clone());
            let vector = vectors.get(&record.id);
            self.install(record, vector);
        }
        let edge_keys: Vec<EdgeKey> = edges.iter().map(EdgeKey::of).collect();
        for edge in edges {
            self.graph.insert(edge);
        }

        report.pruned = self.enforce_capacity(&[])?;
        report.imported.retain(|id| !report.pruned.contains(id));
        report.edges_imported = edge_keys.iter().filter(|key| self.graph.get(key).is_some()).count();

        info!(
            "Imported {} memories and {} edges ({} existing skipped, {} pruned, {} errors)",
            report.imported.len(),
            report.edges_imported,
            report.skipped_existing.len(),
            report.pruned.len(),
            report.errors.len()
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Extraction
    // ------------------------------------------------------------------

    /// Pull memorable sentences out of conversation text and add them.
    /// Sentences already stored verbatim are skipped.
    pub async fn ingest_text(&mut self, text: &str, last_user_message: Option<&str>) -> Result<Vec<MemoryId>> {
        self.ensure_consistent()?;
        let extracted = self.extractor.extract(text, last_user_message);

        let mut ids = Vec::new();
        for memory in extracted {
            let normalized = normalize(&memory.content);
            if self.records.values().any(|r| normalize(&r.content) == normalized) {
                debug!("Skipping known memory '{}'", memory.content);
                continue;
            }
            let new = NewMemory {
                content: memory.content,
                importance: Some(memory.importance),
                memory_type: Some(memory.memory_type),
                tags: memory.keywords,
                metadata: BTreeMap::from([("source".to_string(), "extraction".to_string())]),
            };
            ids.push(self.add(new).await?);
        }

        info!("Ingested {} memories from text", ids.len());
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Organization
    // ------------------------------------------------------------------

    /// Ask the organizer for a proposal and hold it for approval. Nothing
    /// is modified until `apply_organization`.
    pub async fn organize(
        &mut self,
        tasks: &[OrganizeTask],
        timeout: Option<Duration>,
    ) -> Result<OrganizationProposal> {
        self.ensure_consistent()?;
        let timeout = timeout.unwrap_or(Duration::from_secs(self.config.organizer.timeout_secs));

        let mut records: Vec<MemoryRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let proposal = self
            .organizer
            .propose(
                OrganizeContext {
                    records: &records,
                    lexical: &self.lexical,
                    vectors: self.vectors.as_ref(),
                    graph: &self.graph,
                },
                tasks,
                timeout,
            )
            .await?;

        let versions = referenced_ids(&proposal)
            .into_iter()
            .filter_map(|id| self.records.get(&id).map(|r| (id, r.updated_at)))
            .collect();
        self.proposals.insert(
            proposal.id.clone(),
            PendingProposal {
                proposal: proposal.clone(),
                versions,
            },
        );
        Ok(proposal)
    }

    pub fn proposal(&self, id: &ProposalId) -> Option<&OrganizationProposal> {
        self.proposals.get(id).map(|p| &p.proposal)
    }

    pub fn pending_proposals(&self) -> Vec<&OrganizationProposal> {
        let mut pending: Vec<&OrganizationProposal> = self.proposals.values().map(|p| &p.proposal).collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    pub fn discard_organization(&mut self, id: &ProposalId) -> Result<OrganizationProposal> {
        let pending = self
            .proposals
            .remove(id)
            .ok_or_else(|| MemoryError::not_found("proposal", id))?;
        info!("Discarded proposal {}", id);
        Ok(pending.proposal)
    }

    /// Apply every operation of a pending proposal in one transaction, or
    /// none of them. The proposal is consumed either way.
    pub fn apply_organization(&mut self, id: &ProposalId) -> Result<ApplySummary> {
        self.ensure_consistent()?;
        let pending = self
            .proposals
            .remove(id)
            .ok_or_else(|| MemoryError::not_found("proposal", id))?;

        let plan = match self.plan_application(&pending) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Rejected proposal {}: {}", id, e);
                return Err(e);
            }
        };

        self.db.apply(&plan.changes)?;

        for absorbed in &plan.absorbed {
            self.forget(absorbed);
        }
        for record in plan.updated {
            self.lexical.update_hints(&record.id, hints(&record));
            self.records.insert(record.id.clone(), record);
        }
        self.graph = plan.graph;
        self.verify_purged(&plan.absorbed)?;

        info!(
            "Applied proposal {}: {} merges, {} retyped, {} edges added",
            id, plan.summary.merged_groups, plan.summary.retyped, plan.summary.edges_added
        );
        Ok(plan.summary)
    }

    /// A record referenced by a proposal, unchanged since the proposal was
    /// made.
    fn proposal_record(&self, pending: &PendingProposal, id: &MemoryId) -> Result<&MemoryRecord> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| MemoryError::not_found("memory", id))?;
        match pending.versions.get(id) {
            Some(seen) if *seen == record.updated_at => Ok(record),
            _ => Err(MemoryError::Conflict(format!(
                "memory {} changed after proposal {} was made",
                id, pending.proposal.id
            ))),
        }
    }

    fn plan_application(&self, pending: &PendingProposal) -> Result<ApplyPlan> {
        let proposal = &pending.proposal;
        let now = Utc::now();
        let mut updated: BTreeMap<MemoryId, MemoryRecord> = BTreeMap::new();
        let mut absorbed: BTreeSet<MemoryId> = BTreeSet::new();
        let mut grouped: BTreeSet<MemoryId> = BTreeSet::new();
        let mut graph = self.graph.clone();
        let mut summary = ApplySummary::default();

        // Merges first so the other operations can be checked against the
        // records they absorb.
        for op in &proposal.operations {
            let ProposalOperation::Merge { canonical, absorbed: group } = op else {
                continue;
            };
            for member in std::iter::once(canonical).chain(group) {
                if !grouped.insert(member.clone()) {
                    return Err(MemoryError::Conflict(format!(
                        "memory {} appears in more than one merge",
                        member
                    )));
                }
            }

            let mut merged = self.proposal_record(pending, canonical)?.clone();
            for member in group {
                let other = self.proposal_record(pending, member)?;
                merged.importance = merged.importance.max(other.importance);
                for tag in &other.tags {
                    if !merged.tags.contains(tag) {
                        merged.tags.push(tag.clone());
                    }
                }
                for (key, value) in &other.metadata {
                    merged.metadata.entry(key.clone()).or_insert_with(|| value.clone());
                }
                absorbed.insert(member.clone());
            }
            merged.updated_at = touch(merged.updated_at).max(now);

            graph.merge_nodes(canonical, group);
            updated.insert(canonical.clone(), merged);
            summary.merged_groups += 1;
            summary.absorbed_records += group.len();
        }

        for op in &proposal.operations {
            match op {
                ProposalOperation::Merge { .. } => {}
                ProposalOperation::Retype { id, memory_type } => {
                    if absorbed.contains(id) {
                        return Err(MemoryError::Conflict(format!(
                            "cannot retype {}, it is merged away",
                            id
                        )));
                    }
                    let mut record = match updated.get(id) {
                        Some(record) => record.clone(),
                        None => self.proposal_record(pending, id)?.clone(),
                    };
                    if &record.memory_type != memory_type {
                        record.memory_type = memory_type.clone();
                        record.updated_at = touch(record.updated_at).max(now);
                        updated.insert(id.clone(), record);
                        summary.retyped += 1;
                    }
                }
                ProposalOperation::AddEdge {
                    source,
                    target,
                    relation_type,
                    weight,
                } => {
                    for id in [source, target] {
                        if absorbed.contains(id) {
                            return Err(MemoryError::Conflict(format!(
                                "cannot link {}, it is merged away",
                                id
                            )));
                        }
                        self.proposal_record(pending, id)?;
                    }
                    let (_, created) = graph.link(source, target, *relation_type, *weight)?;
                    if created {
                        summary.edges_added += 1;
                    }
                }
            }
        }

        let diff = self.graph.diff(&graph);
        let absorbed: Vec<MemoryId> = absorbed.into_iter().collect();
        let updated: Vec<MemoryRecord> = updated.into_values().collect();

        Ok(ApplyPlan {
            changes: ChangeSet {
                delete_edges: diff.removed,
                upsert_records: updated.clone(),
                upsert_edges: diff.upserted,
                upsert_vectors: Vec::new(),
                delete_records: absorbed.clone(),
            },
            updated,
            absorbed,
            graph,
            summary,
        })
    }
}

fn referenced_ids(proposal: &OrganizationProposal) -> BTreeSet<MemoryId> {
    let mut ids = BTreeSet::new();
    for op in &proposal.operations {
        match op {
            ProposalOperation::Merge { canonical, absorbed } => {
                ids.insert(canonical.clone());
                ids.extend(absorbed.iter().cloned());
            }
            ProposalOperation::Retype { id, .. } => {
                ids.insert(id.clone());
            }
            ProposalOperation::AddEdge { source, target, .. } => {
                ids.insert(source.clone());
                ids.insert(target.clone());
            }
        }
    }
    ids
}

fn hints(record: &MemoryRecord) -> RankHints {
    RankHints {
        importance: record.importance,
        created_at: record.created_at,
    }
}

fn validate_record(record: &MemoryRecord) -> Result<()> {
    if record.id.as_str().trim().is_empty() {
        return Err(MemoryError::InvalidArgument("id must not be empty".into()));
    }
    validate_content(&record.content)?;
    validate_importance(record.importance)?;
    if let Some(embedding) = &record.embedding {
        if embedding.is_empty() || embedding.iter().any(|v| !v.is_finite()) {
            return Err(MemoryError::InvalidArgument(format!(
                "embedding of {} must be a non-empty list of finite numbers",
                record.id
            )));
        }
    }
    Ok(())
}

/// Trimmed, non-empty, first occurrence wins.
fn clean_tags(tags: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !cleaned.iter().any(|t| t == tag) {
            cleaned.push(tag.to_string());
        }
    }
    cleaned
}

/// A timestamp strictly after `previous`.
fn touch(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + chrono::Duration::nanoseconds(1)
    }
}

/// Cached vectors are searchable when they come from the active backend, or
/// were supplied with the record, and have the backend's dimension.
fn usable_vector(embedder: &dyn EmbeddingBackend, model: &str, embedding: &[f32]) -> bool {
    (model == embedder.name() || model == EXTERNAL_VECTOR_MODEL) && embedding.len() == embedder.dimension()
}

async fn embed_text(embedder: Option<Arc<dyn EmbeddingBackend>>, text: &str) -> Option<Vec<f32>> {
    let embedder = embedder?;
    match embedder.embed(text).await {
        Ok(embedding) if embedding.len() == embedder.dimension() && embedding.iter().all(|v| v.is_finite()) => {
            Some(embedding)
        }
        Ok(embedding) => {
            warn!(
                "Embedding backend {} returned {} values, expected {}",
                embedder.name(),
                embedding.len(),
                embedder.dimension()
            );
            None
        }
        Err(e) => {
            warn!("Continuing without embedding: {}", e);
            None
        }
    }
}

/// The vector cache row for `record`: the caller's embedding if it brought
/// one, otherwise a fresh one from the backend (stored on the record too).
async fn vector_for(
    embedder: Option<Arc<dyn EmbeddingBackend>>,
    record: &mut MemoryRecord,
) -> Option<CachedVector> {
    if let Some(embedding) = &record.embedding {
        return Some(CachedVector {
            memory_id: record.id.clone(),
            model: EXTERNAL_VECTOR_MODEL.to_string(),
            embedding: embedding.clone(),
        });
    }

    let model = embedder.as_ref()?.name().to_string();
    let embedding = embed_text(embedder, &record.content).await?;
    record.embedding = Some(embedding.clone());
    Some(CachedVector {
        memory_id: record.id.clone(),
        model,
        embedding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_schemas::MemoryType;

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory(MemoryConfig::default(), Collaborators::local()).unwrap()
    }

    #[test]
    fn test_clean_tags() {
        let tags = clean_tags(vec![" a ".into(), "".into(), "b".into(), "a".into()]);
        assert_eq!(tags, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_touch_always_advances() {
        let future = Utc::now() + chrono::Duration::seconds(60);
        assert!(touch(future) > future);
    }

    #[tokio::test]
    async fn test_add_classifies_and_trims() {
        let mut store = store();
        let id = store.add(NewMemory::new("  User loves hiking  ")).await.unwrap();
        let record = store.get(&id).unwrap();
        assert_eq!(record.content, "User loves hiking");
        assert_eq!(record.memory_type, MemoryType::Preference);
        assert_eq!(record.importance, DEFAULT_IMPORTANCE);
    }

    #[tokio::test]
    async fn test_put_rejects_duplicate_id_and_bad_importance() {
        let mut store = store();
        let record = MemoryRecord::new("one", 0.5, MemoryType::Fact);
        store.put(record.clone()).await.unwrap();
        assert!(matches!(store.put(record).await, Err(MemoryError::Conflict(_))));

        let bad = MemoryRecord::new("two", 1.2, MemoryType::Fact);
        assert!(matches!(store.put(bad).await, Err(MemoryError::InvalidArgument(_))));
        let nan = MemoryRecord::new("three", f32::NAN, MemoryType::Fact);
        assert!(matches!(store.put(nan).await, Err(MemoryError::InvalidArgument(_))));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_reindexes_content() {
        let mut store = store();
        let id = store.add(NewMemory::new("Favourite colour is blue")).await.unwrap();
        let before = store.get(&id).unwrap();

        let patch = MemoryPatch {
            content: Some("Favourite colour is green".into()),
            ..Default::default()
        };
        let after = store.update(&id, patch).await.unwrap();
        assert!(after.updated_at > before.updated_at);
        assert_eq!(after.created_at, before.created_at);

        assert!(store.search_with_embedding(&SearchQuery::new("blue", 5), None).unwrap().is_empty());
        let hits = store.search_with_embedding(&SearchQuery::new("green", 5), None).unwrap();
        assert_eq!(hits[0].record.id, id);
    }

    #[tokio::test]
    async fn test_auto_link_on_add() {
        let mut store = store();
        let a = store.add(NewMemory::new("rust async runtime tokio")).await.unwrap();
        let b = store.add(NewMemory::new("tokio async runtime rust")).await.unwrap();
        store.add(NewMemory::new("baking sourdough bread")).await.unwrap();

        let associated = store.get_associated(&a, 10).unwrap();
        assert_eq!(associated.len(), 1);
        assert_eq!(associated[0].record.id, b);
        assert_eq!(associated[0].relation_type, RelationType::SimilarTo);
        assert_eq!(store.relink_all().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_capacity_prunes_least_important() {
        let config = MemoryConfig {
            max_memories: 2,
            ..MemoryConfig::default()
        };
        let mut store = MemoryStore::open_in_memory(config, Collaborators::local()).unwrap();
        let low = store.add(NewMemory::new("first note").importance(0.1)).await.unwrap();
        store.add(NewMemory::new("second note").importance(0.6)).await.unwrap();
        let newest = store.add(NewMemory::new("third note").importance(0.05)).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get(&low).unwrap_err().is_not_found());
        assert!(store.get(&newest).is_ok());
    }

    #[tokio::test]
    async fn test_stale_proposal_conflicts() {
        let mut store = store();
        let a = store
            .add(NewMemory::new("likes espresso in the morning").importance(0.9))
            .await
            .unwrap();
        store
            .add(NewMemory::new("Likes espresso in the morning").importance(0.2))
            .await
            .unwrap();

        let proposal = store.organize(&[OrganizeTask::FindDuplicates], None).await.unwrap();
        assert_eq!(proposal.operations.len(), 1);

        let patch = MemoryPatch {
            importance: Some(0.95),
            ..Default::default()
        };
        store.update(&a, patch).await.unwrap();

        let err = store.apply_organization(&proposal.id).unwrap_err();
        assert!(matches!(err, MemoryError::Conflict(_)));
        assert_eq!(store.len(), 2);
        assert!(store.proposal(&proposal.id).is_none());
    }
}
