pub mod codec;
pub mod config;
pub mod database;
pub mod error;
pub mod graph;
pub mod heuristic;
pub mod organizer;
pub mod reasoning;
pub mod retrieval;
pub mod store;

pub use codec::{DecodedImport, ExportDocument, FORMAT_VERSION};
pub use config::{AutoLinkConfig, MemoryConfig, OrganizerConfig, SearchConfig};
pub use database::{CachedVector, ChangeSet, Database, EXTERNAL_VECTOR_MODEL};
pub use error::{MemoryError, Result};
pub use graph::{AssociationGraph, EdgeKey, Neighbor, MAX_PATHS, MAX_PATH_DEPTH};
pub use heuristic::{Classification, ExtractedMemory, ExtractorConfig, HeuristicClassifier, MemoryExtractor};
pub use organizer::{OrganizeContext, Organizer};
pub use reasoning::{LlmBackend, LlmReasoner, ReasonerConfig, ReasoningProvider};
pub use store::{Collaborators, MemoryStore, RepairReport, DEFAULT_LINK_WEIGHT};
