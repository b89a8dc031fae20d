use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// ULID and ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(pub String);

impl MemoryId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ProposalId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MemoryId {
    fn from(value: &str) -> Self {
        MemoryId(value.to_string())
    }
}

impl From<String> for MemoryId {
    fn from(value: String) -> Self {
        MemoryId(value)
    }
}

/// Returned when a textual enumeration value cannot be understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

// ============================================================================
// Memory Record Schema
// ============================================================================

/// Category of a memory. The built-in set is closed, everything else is kept
/// verbatim (lowercased) as a custom category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum MemoryType {
    Fact,
    Opinion,
    Preference,
    Event,
    #[default]
    Other,
    Custom(String),
}

impl MemoryType {
    pub const BUILTIN: [MemoryType; 5] = [
        MemoryType::Fact,
        MemoryType::Opinion,
        MemoryType::Preference,
        MemoryType::Event,
        MemoryType::Other,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            MemoryType::Fact => "fact",
            MemoryType::Opinion => "opinion",
            MemoryType::Preference => "preference",
            MemoryType::Event => "event",
            MemoryType::Other => "other",
            MemoryType::Custom(name) => name.as_str(),
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, MemoryType::Custom(_))
    }
}

impl FromStr for MemoryType {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_lowercase();
        let parsed = match normalized.as_str() {
            "" => {
                return Err(ParseEnumError {
                    kind: "memory type",
                    value: raw.to_string(),
                })
            }
            "fact" | "facts" | "事实" => MemoryType::Fact,
            "opinion" | "opinions" | "观点" => MemoryType::Opinion,
            "preference" | "preferences" | "偏好" | "用户偏好" => MemoryType::Preference,
            "event" | "events" | "事件" => MemoryType::Event,
            "other" | "unknown" | "其他" => MemoryType::Other,
            _ => MemoryType::Custom(normalized),
        };
        Ok(parsed)
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MemoryType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MemoryType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

pub const DEFAULT_IMPORTANCE: f32 = 0.5;

fn default_importance() -> f32 {
    DEFAULT_IMPORTANCE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub content: String,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default, alias = "type")]
    pub memory_type: MemoryType,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryRecord {
    /// Fresh record with a new id and both timestamps set to now.
    pub fn new(content: impl Into<String>, importance: f32, memory_type: MemoryType) -> Self {
        let now = Utc::now();
        Self {
            id: generate_memory_id(),
            content: content.into(),
            importance,
            memory_type,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            embedding: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Payload of `add`: everything except the id and timestamps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMemory {
    pub content: String,
    #[serde(default)]
    pub importance: Option<f32>,
    #[serde(default, alias = "type")]
    pub memory_type: Option<MemoryType>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NewMemory {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryPatch {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub importance: Option<f32>,
    #[serde(default, alias = "type")]
    pub memory_type: Option<MemoryType>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl MemoryPatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.importance.is_none()
            && self.memory_type.is_none()
            && self.tags.is_none()
            && self.metadata.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryFilter {
    #[serde(default, alias = "type")]
    pub memory_type: Option<MemoryType>,
    #[serde(default)]
    pub min_importance: Option<f32>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl MemoryFilter {
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if let Some(memory_type) = &self.memory_type {
            if &record.memory_type != memory_type {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if record.importance < min {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !record.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Association Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelationType {
    #[serde(rename = "related_to", alias = "relates_to")]
    RelatedTo,         // Generic semantic link
    #[serde(rename = "similar_to")]
    SimilarTo,         // Near-duplicate or overlapping content
    #[serde(rename = "contradicts")]
    Contradicts,       // This conflicts with that
    #[serde(rename = "caused_by")]
    CausedBy,          // This happened because of that
    #[serde(rename = "part_of")]
    PartOf,            // This is a component of that
    #[serde(rename = "precedes")]
    Precedes,          // This happened before that
    #[serde(rename = "supersedes")]
    Supersedes,        // This replaces that older memory
    #[serde(rename = "exemplifies")]
    Exemplifies,       // This is an example of that concept
}

impl RelationType {
    pub const ALL: [RelationType; 8] = [
        RelationType::RelatedTo,
        RelationType::SimilarTo,
        RelationType::Contradicts,
        RelationType::CausedBy,
        RelationType::PartOf,
        RelationType::Precedes,
        RelationType::Supersedes,
        RelationType::Exemplifies,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::RelatedTo => "related_to",
            RelationType::SimilarTo => "similar_to",
            RelationType::Contradicts => "contradicts",
            RelationType::CausedBy => "caused_by",
            RelationType::PartOf => "part_of",
            RelationType::Precedes => "precedes",
            RelationType::Supersedes => "supersedes",
            RelationType::Exemplifies => "exemplifies",
        }
    }

    /// Symmetric relations have no direction: `a related_to b` is the same
    /// edge as `b related_to a`.
    pub fn is_symmetric(&self) -> bool {
        matches!(
            self,
            RelationType::RelatedTo | RelationType::SimilarTo | RelationType::Contradicts
        )
    }
}

impl FromStr for RelationType {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "related_to" | "relates_to" | "related" => Ok(RelationType::RelatedTo),
            "similar_to" | "similar" => Ok(RelationType::SimilarTo),
            "contradicts" => Ok(RelationType::Contradicts),
            "caused_by" => Ok(RelationType::CausedBy),
            "part_of" => Ok(RelationType::PartOf),
            "precedes" => Ok(RelationType::Precedes),
            "supersedes" => Ok(RelationType::Supersedes),
            "exemplifies" => Ok(RelationType::Exemplifies),
            _ => Err(ParseEnumError {
                kind: "relation type",
                value: raw.to_string(),
            }),
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationEdge {
    pub source_id: MemoryId,
    pub target_id: MemoryId,
    pub relation_type: RelationType,
    pub weight: f32,
    pub created_at: DateTime<Utc>,
}

impl AssociationEdge {
    pub fn touches(&self, id: &MemoryId) -> bool {
        &self.source_id == id || &self.target_id == id
    }

    /// The endpoint opposite to `id`, if `id` is an endpoint at all.
    pub fn other_end(&self, id: &MemoryId) -> Option<&MemoryId> {
        if &self.source_id == id {
            Some(&self.target_id)
        } else if &self.target_id == id {
            Some(&self.source_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationDirection {
    #[serde(rename = "outgoing")]
    Outgoing,
    #[serde(rename = "incoming")]
    Incoming,
    #[serde(rename = "undirected")]
    Undirected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociatedMemory {
    pub record: MemoryRecord,
    pub relation_type: RelationType,
    pub direction: RelationDirection,
    pub weight: f32,
}

// ============================================================================
// Retrieval Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
    #[serde(default, alias = "type")]
    pub memory_type: Option<MemoryType>,
    #[serde(default)]
    pub min_importance: Option<f32>,
}

fn default_search_limit() -> usize {
    10
}

impl SearchQuery {
    pub fn new(query: impl Into<String>, limit: usize) -> Self {
        Self {
            query: query.into(),
            limit,
            memory_type: None,
            min_importance: None,
        }
    }

    pub fn memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    pub fn min_importance(mut self, min_importance: f32) -> Self {
        self.min_importance = Some(min_importance);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub record: MemoryRecord,
    pub score: f32,
    pub lexical_score: Option<f32>,
    pub vector_score: Option<f32>,
}

// ============================================================================
// Organization Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrganizeTask {
    #[serde(rename = "categorize")]
    Categorize,
    #[serde(rename = "find_duplicates")]
    FindDuplicates,
    #[serde(rename = "suggest_associations")]
    SuggestAssociations,
}

impl OrganizeTask {
    pub const ALL: [OrganizeTask; 3] = [
        OrganizeTask::Categorize,
        OrganizeTask::FindDuplicates,
        OrganizeTask::SuggestAssociations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizeTask::Categorize => "categorize",
            OrganizeTask::FindDuplicates => "find_duplicates",
            OrganizeTask::SuggestAssociations => "suggest_associations",
        }
    }
}

impl FromStr for OrganizeTask {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "categorize" | "classify" => Ok(OrganizeTask::Categorize),
            "find_duplicates" | "dedupe" | "duplicates" => Ok(OrganizeTask::FindDuplicates),
            "suggest_associations" | "associate" | "associations" => {
                Ok(OrganizeTask::SuggestAssociations)
            }
            _ => Err(ParseEnumError {
                kind: "organize task",
                value: raw.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProposalOperation {
    Merge {
        canonical: MemoryId,
        absorbed: Vec<MemoryId>,
    },
    Retype {
        id: MemoryId,
        memory_type: MemoryType,
    },
    AddEdge {
        source: MemoryId,
        target: MemoryId,
        relation_type: RelationType,
        weight: f32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNote {
    pub task: OrganizeTask,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizationReport {
    pub reasoning_used: bool,
    pub skipped_tasks: Vec<TaskNote>,
    pub degraded_tasks: Vec<TaskNote>,
    /// Entries from the reasoning output that were dropped as invalid.
    pub rejected_entries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationProposal {
    pub id: ProposalId,
    pub created_at: DateTime<Utc>,
    pub tasks: Vec<OrganizeTask>,
    pub operations: Vec<ProposalOperation>,
    pub report: OrganizationReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub merged_groups: usize,
    pub absorbed_records: usize,
    pub retyped: usize,
    pub edges_added: usize,
}

// ============================================================================
// Import / Export and Stats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "csv")]
    Csv,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(ParseEnumError {
                kind: "export format",
                value: raw.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    /// Position of the entry in the imported document.
    pub index: usize,
    pub id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: Vec<MemoryId>,
    pub skipped_existing: Vec<MemoryId>,
    pub edges_imported: usize,
    pub errors: Vec<RecordError>,
    /// Records deleted to stay within capacity, imported ones included.
    #[serde(default)]
    pub pruned: Vec<MemoryId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentState {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "degraded")]
    Degraded,
    #[serde(rename = "unavailable")]
    Unavailable,
}

impl ComponentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentState::Active => "active",
            ComponentState::Degraded => "degraded",
            ComponentState::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub lexical_index: ComponentState,
    pub vector_index: ComponentState,
    pub reasoning: ComponentState,
    pub vector_entries: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub clusters: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total: usize,
    pub type_counts: BTreeMap<String, usize>,
    pub average_importance: f32,
    pub graph: GraphStats,
    pub components: ComponentStatus,
    pub pending_proposals: usize,
    pub consistent: bool,
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn generate_memory_id() -> MemoryId {
    MemoryId(format!("mem_{}", ulid::Ulid::new()))
}

pub fn generate_proposal_id() -> ProposalId {
    ProposalId(format!("prop_{}", ulid::Ulid::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generation() {
        let memory_id = generate_memory_id();
        assert!(memory_id.0.starts_with("mem_"));
        assert_eq!(memory_id.0.len(), 30); // "mem_" + 26 chars

        let proposal_id = generate_proposal_id();
        assert!(proposal_id.0.starts_with("prop_"));
        assert_ne!(generate_memory_id(), memory_id);
    }

    #[test]
    fn test_memory_type_aliases() {
        assert_eq!("Fact".parse::<MemoryType>().unwrap(), MemoryType::Fact);
        assert_eq!("用户偏好".parse::<MemoryType>().unwrap(), MemoryType::Preference);
        assert_eq!("事件".parse::<MemoryType>().unwrap(), MemoryType::Event);
        assert_eq!(
            " Recipe ".parse::<MemoryType>().unwrap(),
            MemoryType::Custom("recipe".into())
        );
        assert!("   ".parse::<MemoryType>().is_err());
    }

    #[test]
    fn test_relation_symmetry() {
        assert!(RelationType::SimilarTo.is_symmetric());
        assert!(RelationType::Contradicts.is_symmetric());
        assert!(!RelationType::CausedBy.is_symmetric());
        assert_eq!("relates_to".parse::<RelationType>().unwrap(), RelationType::RelatedTo);
        assert_eq!("part-of".parse::<RelationType>().unwrap(), RelationType::PartOf);
        assert!("likes".parse::<RelationType>().is_err());

        for relation in RelationType::ALL {
            assert_eq!(relation.as_str().parse::<RelationType>().unwrap(), relation);
        }
    }

    #[test]
    fn test_record_serialization() {
        let record = MemoryRecord::new("Tea over coffee", 0.7, MemoryType::Preference)
            .with_tags(vec!["drinks".into()]);

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"memory_type\":\"preference\""));
        assert!(!json.contains("embedding"));

        let restored: MemoryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, record);
    }

    #[test]
    fn test_record_accepts_type_alias_and_defaults() {
        let json = r#"{
            "id": "mem_legacy",
            "content": "The meeting moved to Friday",
            "type": "事件",
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T10:00:00Z"
        }"#;

        let record: MemoryRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.memory_type, MemoryType::Event);
        assert_eq!(record.importance, DEFAULT_IMPORTANCE);
        assert!(record.tags.is_empty());
    }

    #[test]
    fn test_proposal_operation_tagging() {
        let op = ProposalOperation::AddEdge {
            source: "mem_a".into(),
            target: "mem_b".into(),
            relation_type: RelationType::CausedBy,
            weight: 0.4,
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "add_edge");
        assert_eq!(json["relation_type"], "caused_by");
    }

    #[test]
    fn test_filter_matches() {
        let record = MemoryRecord::new("x", 0.3, MemoryType::Fact).with_tags(vec!["a".into()]);
        let filter = MemoryFilter {
            memory_type: Some(MemoryType::Fact),
            min_importance: Some(0.2),
            tag: Some("a".into()),
            limit: None,
        };
        assert!(filter.matches(&record));

        let strict = MemoryFilter {
            min_importance: Some(0.5),
            ..Default::default()
        };
        assert!(!strict.matches(&record));
    }
}
