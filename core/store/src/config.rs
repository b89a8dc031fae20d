use crate::error::{MemoryError, Result};
use recall_schemas::RelationType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Weights and limits for hybrid retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub lexical_weight: f32,
    pub vector_weight: f32,
    /// How many nearest neighbours the vector branch contributes.
    pub vector_candidates: usize,
    /// Vector hits at or below this cosine similarity are ignored.
    pub min_similarity: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            lexical_weight: 0.5,
            vector_weight: 0.5,
            vector_candidates: 50,
            min_similarity: 0.0,
        }
    }
}

/// Automatic `similar_to` edges created when a record is added.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoLinkConfig {
    pub enabled: bool,
    pub threshold: f32,
    pub max_links: usize,
    pub relation_type: RelationType,
}

impl Default for AutoLinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.5,
            max_links: 8,
            relation_type: RelationType::SimilarTo,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizerConfig {
    /// Term overlap at or above which two records are duplicates.
    pub duplicate_threshold: f32,
    /// Cosine similarity at or above which two embedded records are duplicates.
    pub semantic_duplicate_threshold: f32,
    /// Minimum overlap for a heuristic association suggestion.
    pub association_threshold: f32,
    /// Records per reasoning call.
    pub batch_size: usize,
    pub timeout_secs: u64,
    pub model_hint: Option<String>,
}

impl Default for OrganizerConfig {
    fn default() -> Self {
        Self {
            duplicate_threshold: 0.8,
            semantic_duplicate_threshold: 0.95,
            association_threshold: 0.35,
            batch_size: 50,
            timeout_secs: 60,
            model_hint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub db_path: PathBuf,
    /// Capacity; the least important records are pruned beyond it.
    pub max_memories: usize,
    pub rebuild_timeout_secs: u64,
    pub search: SearchConfig,
    pub auto_link: AutoLinkConfig,
    pub organizer: OrganizerConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_memories: 5000,
            rebuild_timeout_secs: 120,
            search: SearchConfig::default(),
            auto_link: AutoLinkConfig::default(),
            organizer: OrganizerConfig::default(),
        }
    }
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".local/share/recall/memory.db")
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| MemoryError::InvalidArgument(format!("{}={}: {}", key, raw, e))),
        _ => Ok(None),
    }
}

impl MemoryConfig {
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = env_parse::<PathBuf>("RECALL_DB_PATH")? {
            config.db_path = path;
        }
        if let Some(max) = env_parse("RECALL_MAX_MEMORIES")? {
            config.max_memories = max;
        }
        if let Some(weight) = env_parse("RECALL_LEXICAL_WEIGHT")? {
            config.search.lexical_weight = weight;
        }
        if let Some(weight) = env_parse("RECALL_VECTOR_WEIGHT")? {
            config.search.vector_weight = weight;
        }
        if let Some(threshold) = env_parse("RECALL_AUTO_LINK_THRESHOLD")? {
            config.auto_link.threshold = threshold;
        }
        if let Some(enabled) = env_parse("RECALL_AUTO_LINK")? {
            config.auto_link.enabled = enabled;
        }
        if let Some(threshold) = env_parse("RECALL_DUPLICATE_THRESHOLD")? {
            config.organizer.duplicate_threshold = threshold;
        }
        if let Some(secs) = env_parse("RECALL_ORGANIZE_TIMEOUT_SECS")? {
            config.organizer.timeout_secs = secs;
        }
        if let Some(secs) = env_parse("RECALL_REBUILD_TIMEOUT_SECS")? {
            config.rebuild_timeout_secs = secs;
        }
        config.organizer.model_hint = std::env::var("RECALL_MODEL_HINT").ok();

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, value: f32| {
            if value.is_finite() && (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(MemoryError::InvalidArgument(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )))
            }
        };

        unit("search.lexical_weight", self.search.lexical_weight)?;
        unit("search.vector_weight", self.search.vector_weight)?;
        if self.search.lexical_weight + self.search.vector_weight <= 0.0 {
            return Err(MemoryError::InvalidArgument(
                "search weights must not both be zero".into(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.search.min_similarity) {
            return Err(MemoryError::InvalidArgument(format!(
                "search.min_similarity must be within [-1, 1], got {}",
                self.search.min_similarity
            )));
        }
        unit("auto_link.threshold", self.auto_link.threshold)?;
        unit("organizer.duplicate_threshold", self.organizer.duplicate_threshold)?;
        unit(
            "organizer.semantic_duplicate_threshold",
            self.organizer.semantic_duplicate_threshold,
        )?;
        unit("organizer.association_threshold", self.organizer.association_threshold)?;

        if self.organizer.batch_size == 0 {
            return Err(MemoryError::InvalidArgument(
                "organizer.batch_size must be positive".into(),
            ));
        }
        if self.max_memories == 0 {
            return Err(MemoryError::InvalidArgument(
                "max_memories must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MemoryConfig::with_db_path("/tmp/recall-test.db");
        assert!(config.validate().is_ok());
        assert_eq!(config.search.lexical_weight, 0.5);
        assert_eq!(config.search.vector_weight, 0.5);
        assert_eq!(config.max_memories, 5000);
        assert_eq!(config.auto_link.relation_type, RelationType::SimilarTo);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut config = MemoryConfig::with_db_path("/tmp/recall-test.db");
        config.search.vector_weight = 1.5;
        assert!(matches!(config.validate(), Err(MemoryError::InvalidArgument(_))));

        let mut config = MemoryConfig::with_db_path("/tmp/recall-test.db");
        config.search.lexical_weight = 0.0;
        config.search.vector_weight = 0.0;
        assert!(config.validate().is_err());

        let mut config = MemoryConfig::with_db_path("/tmp/recall-test.db");
        config.organizer.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MemoryConfig =
            serde_json::from_str(r#"{"max_memories": 10, "search": {"vector_weight": 0.2}}"#)
                .unwrap();
        assert_eq!(config.max_memories, 10);
        assert_eq!(config.search.vector_weight, 0.2);
        assert_eq!(config.search.lexical_weight, 0.5);
        assert_eq!(config.organizer.batch_size, 50);
    }
}
