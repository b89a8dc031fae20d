use crate::config::OrganizerConfig;
use crate::error::{MemoryError, Result};
use crate::graph::AssociationGraph;
use crate::heuristic::HeuristicClassifier;
use crate::reasoning::ReasoningProvider;
use chrono::Utc;
use recall_indexing::{LexicalIndex, VectorIndex};
use recall_schemas::{
    generate_proposal_id, MemoryId, MemoryRecord, MemoryType, OrganizationProposal,
    OrganizationReport, OrganizeTask, ProposalOperation, RelationType, TaskNote,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cap on heuristic association suggestions per record.
const MAX_SUGGESTIONS_PER_RECORD: usize = 8;
/// Nearest neighbours inspected per record when looking for semantic duplicates.
const SEMANTIC_NEIGHBORS: usize = 10;

/// Read-only view of the store handed to the organizer.
pub struct OrganizeContext<'a> {
    pub records: &'a [MemoryRecord],
    pub lexical: &'a LexicalIndex,
    pub vectors: Option<&'a VectorIndex>,
    pub graph: &'a AssociationGraph,
}

/// Operations suggested by the reasoning service, after validation.
#[derive(Debug, Default)]
struct ReasonedSuggestions {
    duplicate_groups: Vec<Vec<MemoryId>>,
    retypes: Vec<(MemoryId, MemoryType)>,
    associations: Vec<(MemoryId, MemoryId, RelationType, f32)>,
    rejected: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DuplicateEntry {
    #[serde(default)]
    canonical: Option<String>,
    #[serde(default, alias = "ids")]
    duplicates: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CategoryEntry {
    id: String,
    #[serde(alias = "type", alias = "category")]
    memory_type: String,
}

#[derive(Debug, Deserialize)]
struct AssociationEntry {
    source: String,
    target: String,
    #[serde(default = "default_relation", alias = "relation")]
    relation_type: String,
    #[serde(default = "default_weight", alias = "strength")]
    weight: f32,
}

fn default_relation() -> String {
    RelationType::RelatedTo.as_str().to_string()
}

fn default_weight() -> f32 {
    0.5
}

/// Time budget shared by every step of one proposal.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.started.elapsed())
    }

    fn check(&self) -> Result<()> {
        if self.started.elapsed() >= self.limit {
            Err(self.expired())
        } else {
            Ok(())
        }
    }

    fn expired(&self) -> MemoryError {
        MemoryError::ExternalFailure(format!("organization timed out after {:?}", self.limit))
    }
}

/// Builds organization proposals. Never mutates anything.
pub struct Organizer {
    reasoner: Option<Arc<dyn ReasoningProvider>>,
    classifier: HeuristicClassifier,
    config: OrganizerConfig,
}

impl Organizer {
    pub fn new(reasoner: Option<Arc<dyn ReasoningProvider>>, config: OrganizerConfig) -> Result<Self> {
        Ok(Self {
            reasoner,
            classifier: HeuristicClassifier::new()?,
            config,
        })
    }

    pub fn config(&self) -> &OrganizerConfig {
        &self.config
    }

    pub fn has_reasoner(&self) -> bool {
        self.reasoner.is_some()
    }

    pub fn classifier(&self) -> &HeuristicClassifier {
        &self.classifier
    }

    /// Produce a proposal for `tasks` over the given records.
    ///
    /// The whole proposal, reasoning service calls and local analysis
    /// alike, is bounded by `timeout`; running out of time is an
    /// `ExternalFailure`. Any other reasoning problem falls back to local
    /// heuristics and is noted in the report.
    pub async fn propose(
        &self,
        ctx: OrganizeContext<'_>,
        tasks: &[OrganizeTask],
        timeout: Duration,
    ) -> Result<OrganizationProposal> {
        let deadline = Deadline::new(timeout);
        let tasks: Vec<OrganizeTask> = tasks.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        if tasks.is_empty() {
            return Err(MemoryError::InvalidArgument("no organize tasks requested".into()));
        }

        let mut report = OrganizationReport::default();
        let mut active = Vec::new();
        for task in &tasks {
            let needed = match task {
                OrganizeTask::Categorize => 1,
                OrganizeTask::FindDuplicates | OrganizeTask::SuggestAssociations => 2,
            };
            if ctx.records.len() < needed {
                report.skipped_tasks.push(TaskNote {
                    task: *task,
                    reason: format!("needs at least {} records, have {}", needed, ctx.records.len()),
                });
            } else {
                active.push(*task);
            }
        }

        let reasoned = if active.is_empty() {
            None
        } else {
            self.consult_reasoner(&ctx, &active, deadline).await?
        };

        let known: HashMap<&MemoryId, &MemoryRecord> = ctx.records.iter().map(|r| (&r.id, r)).collect();
        let mut duplicate_groups: Vec<Vec<MemoryId>> = Vec::new();
        let mut retypes: Vec<(MemoryId, MemoryType)> = Vec::new();
        let mut associations: Vec<(MemoryId, MemoryId, RelationType, f32)> = Vec::new();

        if let Some(suggestions) = reasoned {
            report.reasoning_used = true;
            report.rejected_entries = suggestions.rejected;
            duplicate_groups = suggestions.duplicate_groups;
            if active.contains(&OrganizeTask::Categorize) {
                retypes = suggestions.retypes;
            }
            if active.contains(&OrganizeTask::SuggestAssociations) {
                associations = suggestions.associations;
            }
        } else {
            let reason = match &self.reasoner {
                Some(_) => "reasoning service unavailable, used local heuristics",
                None => "no reasoning service configured, used local heuristics",
            };
            for task in &active {
                if *task != OrganizeTask::FindDuplicates {
                    report.degraded_tasks.push(TaskNote {
                        task: *task,
                        reason: reason.to_string(),
                    });
                }
            }
            if active.contains(&OrganizeTask::Categorize) {
                retypes = self.heuristic_retypes(ctx.records, deadline)?;
            }
            if active.contains(&OrganizeTask::SuggestAssociations) {
                associations = self.heuristic_associations(&ctx, deadline)?;
            }
        }

        let mut operations = Vec::new();
        let mut absorbed: BTreeSet<MemoryId> = BTreeSet::new();

        if active.contains(&OrganizeTask::FindDuplicates) {
            duplicate_groups.extend(self.similar_pairs(&ctx, deadline)?);
            for group in group_duplicates(duplicate_groups) {
                let Some(canonical) = choose_canonical(&group, &known) else {
                    continue;
                };
                let rest: Vec<MemoryId> = group.into_iter().filter(|id| id != &canonical).collect();
                absorbed.extend(rest.iter().cloned());
                operations.push(ProposalOperation::Merge {
                    canonical,
                    absorbed: rest,
                });
            }
        }

        let mut retyped: BTreeMap<MemoryId, MemoryType> = BTreeMap::new();
        for (id, memory_type) in retypes {
            if absorbed.contains(&id) {
                continue;
            }
            if known.get(&id).map(|r| r.memory_type == memory_type).unwrap_or(true) {
                continue;
            }
            retyped.insert(id, memory_type);
        }
        operations.extend(
            retyped
                .into_iter()
                .map(|(id, memory_type)| ProposalOperation::Retype { id, memory_type }),
        );

        let mut seen_edges = BTreeSet::new();
        for (source, target, relation_type, weight) in associations {
            if absorbed.contains(&source) || absorbed.contains(&target) {
                continue;
            }
            let key = crate::graph::EdgeKey::new(&source, &target, relation_type);
            if !seen_edges.insert(key.clone()) {
                continue;
            }
            if ctx.graph.get(&key).map(|e| e.weight == weight).unwrap_or(false) {
                continue;
            }
            operations.push(ProposalOperation::AddEdge {
                source,
                target,
                relation_type,
                weight,
            });
        }

        deadline.check()?;
        let proposal = OrganizationProposal {
            id: generate_proposal_id(),
            created_at: Utc::now(),
            tasks,
            operations,
            report,
        };

        info!(
            "Proposal {} has {} operations (reasoning: {})",
            proposal.id,
            proposal.operations.len(),
            proposal.report.reasoning_used
        );
        Ok(proposal)
    }

    /// Ask the reasoning service about every batch. `Ok(None)` means the
    /// caller should fall back to heuristics.
    async fn consult_reasoner(
        &self,
        ctx: &OrganizeContext<'_>,
        tasks: &[OrganizeTask],
        deadline: Deadline,
    ) -> Result<Option<ReasonedSuggestions>> {
        let Some(reasoner) = &self.reasoner else {
            return Ok(None);
        };

        let known: BTreeSet<&MemoryId> = ctx.records.iter().map(|r| &r.id).collect();
        let model_hint = self.config.model_hint.as_deref();
        let batch_size = self.config.batch_size.max(1);

        let consult = async {
            if !reasoner.is_available().await {
                warn!("Reasoning service {} is unavailable", reasoner.name());
                return None;
            }

            let mut suggestions = ReasonedSuggestions::default();
            for batch in ctx.records.chunks(batch_size) {
                match reasoner.propose_organization(batch, tasks, model_hint).await {
                    Ok(text) => match extract_json(&text) {
                        Some(json) => parse_suggestions(json, &known, &mut suggestions),
                        None => {
                            warn!("Reasoning output was not JSON, ignoring proposal");
                            return None;
                        }
                    },
                    Err(e) => {
                        warn!("Reasoning service {} failed: {}", reasoner.name(), e);
                        return None;
                    }
                }
            }
            Some(suggestions)
        };

        match tokio::time::timeout(deadline.remaining(), consult).await {
            Ok(Some(suggestions)) => {
                debug!(
                    "Reasoner suggested {} groups, {} retypes, {} associations ({} rejected)",
                    suggestions.duplicate_groups.len(),
                    suggestions.retypes.len(),
                    suggestions.associations.len(),
                    suggestions.rejected.len()
                );
                Ok(Some(suggestions))
            }
            Ok(None) => Ok(None),
            Err(_) => Err(deadline.expired()),
        }
    }

    /// Keyword classification for records still typed `other`.
    fn heuristic_retypes(
        &self,
        records: &[MemoryRecord],
        deadline: Deadline,
    ) -> Result<Vec<(MemoryId, MemoryType)>> {
        let mut retypes = Vec::new();
        for record in records.iter().filter(|r| r.memory_type == MemoryType::Other) {
            deadline.check()?;
            let classification = self.classifier.classify(&record.content);
            if classification.memory_type != MemoryType::Other {
                retypes.push((record.id.clone(), classification.memory_type));
            }
        }
        Ok(retypes)
    }

    fn heuristic_associations(
        &self,
        ctx: &OrganizeContext<'_>,
        deadline: Deadline,
    ) -> Result<Vec<(MemoryId, MemoryId, RelationType, f32)>> {
        let mut suggestions = Vec::new();
        let mut seen: BTreeSet<(MemoryId, MemoryId)> = BTreeSet::new();

        for record in ctx.records {
            deadline.check()?;
            let candidates = ctx
                .lexical
                .overlapping_with(&record.id, self.config.association_threshold);
            let mut added = 0;
            for (other, similarity) in candidates {
                if added >= MAX_SUGGESTIONS_PER_RECORD {
                    break;
                }
                if similarity >= self.config.duplicate_threshold {
                    continue;
                }
                if ctx.graph.are_linked(&record.id, &other) {
                    continue;
                }
                let pair = if record.id < other {
                    (record.id.clone(), other.clone())
                } else {
                    (other.clone(), record.id.clone())
                };
                if !seen.insert(pair.clone()) {
                    continue;
                }
                suggestions.push((pair.0, pair.1, RelationType::RelatedTo, similarity));
                added += 1;
            }
        }
        Ok(suggestions)
    }

    /// Pairs of records similar enough to be duplicates.
    fn similar_pairs(&self, ctx: &OrganizeContext<'_>, deadline: Deadline) -> Result<Vec<Vec<MemoryId>>> {
        let in_scope: BTreeSet<&MemoryId> = ctx.records.iter().map(|r| &r.id).collect();
        let mut pairs = Vec::new();

        for record in ctx.records {
            deadline.check()?;
            for (other, _) in ctx
                .lexical
                .overlapping_with(&record.id, self.config.duplicate_threshold)
            {
                if in_scope.contains(&other) && record.id < other {
                    pairs.push(vec![record.id.clone(), other]);
                }
            }

            let Some(vectors) = ctx.vectors else {
                continue;
            };
            let Some(embedding) = vectors.get(&record.id) else {
                continue;
            };
            if let Ok(hits) = vectors.query(embedding, SEMANTIC_NEIGHBORS + 1) {
                for hit in hits {
                    if hit.similarity >= self.config.semantic_duplicate_threshold
                        && in_scope.contains(&hit.id)
                        && record.id < hit.id
                    {
                        pairs.push(vec![record.id.clone(), hit.id]);
                    }
                }
            }
        }
        Ok(pairs)
    }
}

/// Slice out the JSON object from free-form model output: code fences and
/// chatter around the outermost braces are ignored.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_suggestions(json: &str, known: &BTreeSet<&MemoryId>, out: &mut ReasonedSuggestions) {
    let value: Value = match serde_json::from_str(json) {
        Ok(value) => value,
        Err(e) => {
            out.rejected.push(format!("unparseable output: {}", e));
            return;
        }
    };

    let section = |name: &str| -> Vec<Value> {
        value
            .get(name)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    let is_known = |id: &str| known.contains(&MemoryId::from(id));

    for entry in section("duplicates") {
        match serde_json::from_value::<DuplicateEntry>(entry.clone()) {
            Ok(dup) => {
                let mut ids: BTreeSet<String> = dup.duplicates.into_iter().collect();
                if let Some(canonical) = dup.canonical {
                    ids.insert(canonical);
                }
                if ids.len() < 2 {
                    out.rejected.push(format!("duplicates: fewer than two ids in {}", entry));
                } else if let Some(unknown) = ids.iter().find(|id| !is_known(id)) {
                    out.rejected.push(format!("duplicates: unknown id {}", unknown));
                } else {
                    out.duplicate_groups.push(ids.into_iter().map(MemoryId).collect());
                }
            }
            Err(e) => out.rejected.push(format!("duplicates: {} in {}", e, entry)),
        }
    }

    for entry in section("categories") {
        match serde_json::from_value::<CategoryEntry>(entry.clone()) {
            Ok(cat) if !is_known(&cat.id) => {
                out.rejected.push(format!("categories: unknown id {}", cat.id));
            }
            Ok(cat) => match cat.memory_type.parse::<MemoryType>() {
                Ok(memory_type) => out.retypes.push((MemoryId(cat.id), memory_type)),
                Err(e) => out.rejected.push(format!("categories: {}", e)),
            },
            Err(e) => out.rejected.push(format!("categories: {} in {}", e, entry)),
        }
    }

    for entry in section("associations") {
        let assoc = match serde_json::from_value::<AssociationEntry>(entry.clone()) {
            Ok(assoc) => assoc,
            Err(e) => {
                out.rejected.push(format!("associations: {} in {}", e, entry));
                continue;
            }
        };
        if !is_known(&assoc.source) || !is_known(&assoc.target) {
            out.rejected.push(format!("associations: unknown id in {}", entry));
            continue;
        }
        if assoc.source == assoc.target {
            out.rejected.push(format!("associations: self-link on {}", assoc.source));
            continue;
        }
        if !assoc.weight.is_finite() || !(0.0..=1.0).contains(&assoc.weight) {
            out.rejected.push(format!("associations: weight {} out of range", assoc.weight));
            continue;
        }
        match assoc.relation_type.parse::<RelationType>() {
            Ok(relation_type) => out.associations.push((
                MemoryId(assoc.source),
                MemoryId(assoc.target),
                relation_type,
                assoc.weight,
            )),
            Err(e) => out.rejected.push(format!("associations: {}", e)),
        }
    }
}

/// Union-find over record ids.
struct DisjointSet {
    parent: HashMap<MemoryId, MemoryId>,
}

impl DisjointSet {
    fn new() -> Self {
        Self {
            parent: HashMap::new(),
        }
    }

    fn find(&mut self, id: &MemoryId) -> MemoryId {
        let parent = self.parent.entry(id.clone()).or_insert_with(|| id.clone()).clone();
        if &parent == id {
            return parent;
        }
        let root = self.find(&parent);
        self.parent.insert(id.clone(), root.clone());
        root
    }

    fn union(&mut self, a: &MemoryId, b: &MemoryId) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            let (low, high) = if root_a < root_b { (root_a, root_b) } else { (root_b, root_a) };
            self.parent.insert(high, low);
        }
    }
}

/// Merge overlapping groups into disjoint groups, sorted for stable output.
pub fn group_duplicates(groups: Vec<Vec<MemoryId>>) -> Vec<Vec<MemoryId>> {
    let mut set = DisjointSet::new();
    for group in &groups {
        for pair in group.windows(2) {
            set.union(&pair[0], &pair[1]);
        }
        if let Some(first) = group.first() {
            set.find(first);
        }
    }

    let ids: Vec<MemoryId> = set.parent.keys().cloned().collect();
    let mut merged: BTreeMap<MemoryId, BTreeSet<MemoryId>> = BTreeMap::new();
    for id in ids {
        let root = set.find(&id);
        merged.entry(root).or_default().insert(id);
    }

    merged
        .into_values()
        .filter(|members| members.len() > 1)
        .map(|members| members.into_iter().collect())
        .collect()
}

/// Highest importance wins, then the oldest record, then the smallest id.
/// `None` when no member of the group is a known record.
pub fn choose_canonical(
    group: &[MemoryId],
    records: &HashMap<&MemoryId, &MemoryRecord>,
) -> Option<MemoryId> {
    let mut best: Option<&MemoryRecord> = None;
    for id in group {
        let Some(record) = records.get(id).copied() else {
            continue;
        };
        best = match best {
            None => Some(record),
            Some(current) => {
                let better = record
                    .importance
                    .total_cmp(&current.importance)
                    .then_with(|| current.created_at.cmp(&record.created_at))
                    .then_with(|| current.id.cmp(&record.id))
                    .is_gt();
                Some(if better { record } else { current })
            }
        };
    }
    best.map(|r| r.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrganizerConfig;
    use async_trait::async_trait;
    use recall_indexing::{BackendError, RankHints, WordTokenizer};

    struct ScriptedReasoner {
        reply: std::result::Result<String, BackendError>,
        delay: Duration,
    }

    #[async_trait]
    impl ReasoningProvider for ScriptedReasoner {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn propose_organization(
            &self,
            _records: &[MemoryRecord],
            _tasks: &[OrganizeTask],
            _model_hint: Option<&str>,
        ) -> std::result::Result<String, BackendError> {
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }
    }

    fn record(id: &str, content: &str, importance: f32, memory_type: MemoryType) -> MemoryRecord {
        let mut record = MemoryRecord::new(content, importance, memory_type);
        record.id = MemoryId::from(id);
        record
    }

    fn index(records: &[MemoryRecord]) -> LexicalIndex {
        let mut lexical = LexicalIndex::new(Some(Arc::new(WordTokenizer::new())));
        for r in records {
            lexical.index(
                &r.id,
                &r.content,
                RankHints {
                    importance: r.importance,
                    created_at: r.created_at,
                },
            );
        }
        lexical
    }

    fn organizer(reply: Option<std::result::Result<String, BackendError>>) -> Organizer {
        let reasoner = reply.map(|reply| {
            Arc::new(ScriptedReasoner {
                reply,
                delay: Duration::from_millis(0),
            }) as Arc<dyn ReasoningProvider>
        });
        Organizer::new(reasoner, OrganizerConfig::default()).unwrap()
    }

    #[test]
    fn test_extract_json_tolerates_fences() {
        let text = "Sure! ```json\n{\"categories\": []}\n``` hope that helps";
        assert_eq!(extract_json(text), Some("{\"categories\": []}"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn test_group_duplicates_is_transitive() {
        let groups = group_duplicates(vec![
            vec!["a".into(), "b".into()],
            vec!["b".into(), "c".into()],
            vec!["x".into(), "y".into()],
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![MemoryId::from("a"), "b".into(), "c".into()]);
    }

    #[tokio::test]
    async fn test_heuristic_fallback_is_reported() {
        let records = vec![
            record("mem_1", "User likes green tea", 0.5, MemoryType::Other),
            record("mem_2", "Paris is the capital of France", 0.5, MemoryType::Fact),
        ];
        let lexical = index(&records);
        let graph = AssociationGraph::new();
        let ctx = OrganizeContext {
            records: &records,
            lexical: &lexical,
            vectors: None,
            graph: &graph,
        };

        let proposal = organizer(None)
            .propose(ctx, &[OrganizeTask::Categorize], Duration::from_secs(1))
            .await
            .unwrap();

        assert!(!proposal.report.reasoning_used);
        assert_eq!(proposal.report.degraded_tasks.len(), 1);
        assert_eq!(
            proposal.operations,
            vec![ProposalOperation::Retype {
                id: "mem_1".into(),
                memory_type: MemoryType::Preference
            }]
        );
    }

    #[tokio::test]
    async fn test_reasoner_output_is_validated() {
        let records = vec![
            record("mem_1", "alpha note", 0.5, MemoryType::Other),
            record("mem_2", "beta note", 0.5, MemoryType::Other),
        ];
        let lexical = index(&records);
        let graph = AssociationGraph::new();
        let reply = r#"```json
        {"categories": [{"id": "mem_1", "memory_type": "fact"}, {"id": "mem_404", "memory_type": "fact"}],
         "associations": [{"source": "mem_1", "target": "mem_2", "relation_type": "caused_by", "weight": 0.8},
                          {"source": "mem_1", "target": "mem_1", "weight": 0.3},
                          {"source": "mem_1", "target": "mem_2", "relation_type": "befriends"}]}
        ```"#;

        let proposal = organizer(Some(Ok(reply.to_string())))
            .propose(
                OrganizeContext {
                    records: &records,
                    lexical: &lexical,
                    vectors: None,
                    graph: &graph,
                },
                &[OrganizeTask::Categorize, OrganizeTask::SuggestAssociations],
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert!(proposal.report.reasoning_used);
        assert_eq!(proposal.report.rejected_entries.len(), 3);
        assert_eq!(proposal.operations.len(), 2);
        assert!(proposal.operations.contains(&ProposalOperation::AddEdge {
            source: "mem_1".into(),
            target: "mem_2".into(),
            relation_type: RelationType::CausedBy,
            weight: 0.8,
        }));
    }

    #[tokio::test]
    async fn test_malformed_reply_degrades() {
        let records = vec![
            record("mem_1", "User likes tea", 0.5, MemoryType::Other),
            record("mem_2", "other words", 0.5, MemoryType::Other),
        ];
        let lexical = index(&records);
        let graph = AssociationGraph::new();

        let proposal = organizer(Some(Ok("I cannot help with that".into())))
            .propose(
                OrganizeContext {
                    records: &records,
                    lexical: &lexical,
                    vectors: None,
                    graph: &graph,
                },
                &[OrganizeTask::Categorize],
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert!(!proposal.report.reasoning_used);
        assert_eq!(proposal.report.degraded_tasks[0].task, OrganizeTask::Categorize);
    }

    #[tokio::test]
    async fn test_timeout_is_external_failure() {
        let records = vec![record("mem_1", "slow", 0.5, MemoryType::Other)];
        let lexical = index(&records);
        let graph = AssociationGraph::new();
        let slow = Organizer::new(
            Some(Arc::new(ScriptedReasoner {
                reply: Ok("{}".into()),
                delay: Duration::from_secs(5),
            })),
            OrganizerConfig::default(),
        )
        .unwrap();

        let err = slow
            .propose(
                OrganizeContext {
                    records: &records,
                    lexical: &lexical,
                    vectors: None,
                    graph: &graph,
                },
                &[OrganizeTask::Categorize],
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::ExternalFailure(_)));
    }

    #[tokio::test]
    async fn test_duplicates_pick_highest_importance() {
        let records = vec![
            record("mem_a", "User likes tea", 0.4, MemoryType::Preference),
            record("mem_b", "user likes tea", 0.9, MemoryType::Preference),
            record("mem_c", "Completely different sentence", 0.5, MemoryType::Fact),
        ];
        let lexical = index(&records);
        let graph = AssociationGraph::new();

        let proposal = organizer(None)
            .propose(
                OrganizeContext {
                    records: &records,
                    lexical: &lexical,
                    vectors: None,
                    graph: &graph,
                },
                &[OrganizeTask::FindDuplicates],
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(
            proposal.operations,
            vec![ProposalOperation::Merge {
                canonical: "mem_b".into(),
                absorbed: vec!["mem_a".into()],
            }]
        );
        assert!(proposal.report.degraded_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_too_few_records_are_skipped() {
        let records = vec![record("mem_1", "only one", 0.5, MemoryType::Other)];
        let lexical = index(&records);
        let graph = AssociationGraph::new();

        let proposal = organizer(None)
            .propose(
                OrganizeContext {
                    records: &records,
                    lexical: &lexical,
                    vectors: None,
                    graph: &graph,
                },
                &[OrganizeTask::FindDuplicates, OrganizeTask::SuggestAssociations],
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(proposal.report.skipped_tasks.len(), 2);
        assert!(proposal.operations.is_empty());
    }

    #[tokio::test]
    async fn test_heuristic_work_honours_timeout() {
        let records: Vec<MemoryRecord> = (0..200)
            .map(|i| {
                let content = format!("shared topic note {}", i);
                record(&format!("mem_{:03}", i), &content, 0.5, MemoryType::Other)
            })
            .collect();
        let lexical = index(&records);
        let graph = AssociationGraph::new();

        let err = organizer(None)
            .propose(
                OrganizeContext {
                    records: &records,
                    lexical: &lexical,
                    vectors: None,
                    graph: &graph,
                },
                &[OrganizeTask::FindDuplicates, OrganizeTask::SuggestAssociations],
                Duration::ZERO,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::ExternalFailure(_)));
    }

    #[test]
    fn test_choose_canonical_needs_a_known_record() {
        let a = record("mem_a", "tea", 0.3, MemoryType::Preference);
        let b = record("mem_b", "tea", 0.7, MemoryType::Preference);
        let known: HashMap<&MemoryId, &MemoryRecord> = [(&a.id, &a), (&b.id, &b)].into_iter().collect();

        let group = vec![MemoryId::from("mem_a"), MemoryId::from("mem_b")];
        assert_eq!(choose_canonical(&group, &known), Some(MemoryId::from("mem_b")));
        assert_eq!(choose_canonical(&[MemoryId::from("mem_gone")], &known), None);
        assert_eq!(choose_canonical(&[], &known), None);
    }
}
