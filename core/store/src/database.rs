use crate::error::{MemoryError, Result};
use crate::graph::EdgeKey;
use chrono::{DateTime, SecondsFormat, Utc};
use recall_schemas::{AssociationEdge, MemoryId, MemoryRecord, MemoryType, RelationType};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Model label for vectors that arrived with a record instead of being
/// computed by the active embedding backend.
pub const EXTERNAL_VECTOR_MODEL: &str = "external";

/// A vector cache row.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedVector {
    pub memory_id: MemoryId,
    pub model: String,
    pub embedding: Vec<f32>,
}

/// Writes that must land together. Applied in one transaction in the order
/// edge deletions, record upserts, edge upserts, vector upserts, record
/// deletions.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub delete_edges: Vec<EdgeKey>,
    pub upsert_records: Vec<MemoryRecord>,
    pub upsert_edges: Vec<AssociationEdge>,
    pub upsert_vectors: Vec<CachedVector>,
    pub delete_records: Vec<MemoryId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.delete_edges.is_empty()
            && self.upsert_records.is_empty()
            && self.upsert_edges.is_empty()
            && self.upsert_vectors.is_empty()
            && self.delete_records.is_empty()
    }
}

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database file and its schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Journal mode: {}", journal_mode);
        let db = Self { conn };
        db.init_schema()?;

        info!("Database initialized at {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS memory_records (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                importance REAL NOT NULL,
                memory_type TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // Symmetric relations are stored once with source_id < target_id.
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS memory_edges (
                source_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                relation_type TEXT NOT NULL,
                weight REAL NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (source_id, target_id, relation_type),
                FOREIGN KEY (source_id) REFERENCES memory_records(id) ON DELETE CASCADE,
                FOREIGN KEY (target_id) REFERENCES memory_records(id) ON DELETE CASCADE
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS vector_cache (
                memory_id TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                embedding TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (memory_id) REFERENCES memory_records(id) ON DELETE CASCADE
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memory_edges_target ON memory_edges(target_id)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memory_records_type ON memory_records(memory_type)",
            [],
        )?;

        Ok(())
    }

    /// SQLite page check plus dangling foreign keys.
    pub fn check_integrity(&self) -> Result<()> {
        let status: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if status != "ok" {
            return Err(MemoryError::Corrupt(format!("integrity check: {}", status)));
        }

        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let violations = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if !violations.is_empty() {
            return Err(MemoryError::Corrupt(format!(
                "{} dangling references in {}",
                violations.len(),
                violations.join(", ")
            )));
        }
        Ok(())
    }

    pub fn count_records(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM memory_records", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Every record, with cached embeddings attached. Rows that fail
    /// validation abort the load with `Corrupt`.
    pub fn load_records(&self) -> Result<Vec<MemoryRecord>> {
        let vectors: BTreeMap<MemoryId, Vec<f32>> = self
            .load_vectors()?
            .into_iter()
            .map(|v| (v.memory_id, v.embedding))
            .collect();

        let mut stmt = self.conn.prepare(
            "SELECT id, content, importance, memory_type, tags, metadata, created_at, updated_at
             FROM memory_records
             ORDER BY created_at, id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(RawRecord {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    importance: row.get(2)?,
                    memory_type: row.get(3)?,
                    tags: row.get(4)?,
                    metadata: row.get(5)?,
                    created_at: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for raw in rows {
            let mut record = raw.into_record()?;
            record.embedding = vectors.get(&record.id).cloned();
            records.push(record);
        }

        debug!("Loaded {} memory records", records.len());
        Ok(records)
    }

    pub fn get_record(&self, id: &MemoryId) -> Result<Option<MemoryRecord>> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, content, importance, memory_type, tags, metadata, created_at, updated_at
                 FROM memory_records WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok(RawRecord {
                        id: row.get(0)?,
                        content: row.get(1)?,
                        importance: row.get(2)?,
                        memory_type: row.get(3)?,
                        tags: row.get(4)?,
                        metadata: row.get(5)?,
                        created_at: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                },
            )
            .optional()?;

        match raw {
            Some(raw) => {
                let mut record = raw.into_record()?;
                record.embedding = self
                    .conn
                    .query_row(
                        "SELECT embedding FROM vector_cache WHERE memory_id = ?1",
                        params![id.0],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?
                    .map(|json| parse_embedding(&id.0, &json))
                    .transpose()?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn load_edges(&self) -> Result<Vec<AssociationEdge>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_id, target_id, relation_type, weight, created_at
             FROM memory_edges
             ORDER BY created_at, source_id, target_id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut edges = Vec::with_capacity(rows.len());
        for (source, target, relation, weight, created_at) in rows {
            let relation_type: RelationType = relation
                .parse()
                .map_err(|e| MemoryError::Corrupt(format!("edge {}->{}: {}", source, target, e)))?;
            let weight = weight as f32;
            if source == target || !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
                return Err(MemoryError::Corrupt(format!(
                    "edge {}->{} ({}) is invalid",
                    source, target, relation
                )));
            }
            edges.push(AssociationEdge {
                source_id: MemoryId(source),
                target_id: MemoryId(target),
                relation_type,
                weight,
                created_at: parse_timestamp("edge", &created_at)?,
            });
        }

        debug!("Loaded {} association edges", edges.len());
        Ok(edges)
    }

    pub fn load_vectors(&self) -> Result<Vec<CachedVector>> {
        let mut stmt = self.conn.prepare(
            "SELECT memory_id, model, dimension, embedding FROM vector_cache ORDER BY memory_id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, model, dimension, json)| {
                let embedding = parse_embedding(&id, &json)?;
                if embedding.len() as i64 != dimension {
                    return Err(MemoryError::Corrupt(format!(
                        "cached vector for {} has {} values, expected {}",
                        id,
                        embedding.len(),
                        dimension
                    )));
                }
                Ok(CachedVector {
                    memory_id: MemoryId(id),
                    model,
                    embedding,
                })
            })
            .collect()
    }

    /// Apply a change set atomically. Nothing is written if any statement
    /// fails.
    pub fn apply(&mut self, changes: &ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;

        for key in &changes.delete_edges {
            tx.execute(
                "DELETE FROM memory_edges
                 WHERE source_id = ?1 AND target_id = ?2 AND relation_type = ?3",
                params![key.source.0, key.target.0, key.relation_type.as_str()],
            )?;
        }

        for record in &changes.upsert_records {
            tx.execute(
                "INSERT INTO memory_records
                    (id, content, importance, memory_type, tags, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    content = excluded.content,
                    importance = excluded.importance,
                    memory_type = excluded.memory_type,
                    tags = excluded.tags,
                    metadata = excluded.metadata,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at",
                params![
                    record.id.0,
                    record.content,
                    record.importance as f64,
                    record.memory_type.as_str(),
                    serde_json::to_string(&record.tags)?,
                    serde_json::to_string(&record.metadata)?,
                    format_timestamp(&record.created_at),
                    format_timestamp(&record.updated_at),
                ],
            )?;

            if record.embedding.is_none() {
                tx.execute(
                    "DELETE FROM vector_cache WHERE memory_id = ?1",
                    params![record.id.0],
                )?;
            }
        }

        for edge in &changes.upsert_edges {
            tx.execute(
                "INSERT INTO memory_edges (source_id, target_id, relation_type, weight, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(source_id, target_id, relation_type) DO UPDATE SET
                    weight = excluded.weight",
                params![
                    edge.source_id.0,
                    edge.target_id.0,
                    edge.relation_type.as_str(),
                    edge.weight as f64,
                    format_timestamp(&edge.created_at),
                ],
            )?;
        }

        let now = format_timestamp(&Utc::now());
        for vector in &changes.upsert_vectors {
            tx.execute(
                "INSERT INTO vector_cache (memory_id, model, dimension, embedding, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(memory_id) DO UPDATE SET
                    model = excluded.model,
                    dimension = excluded.dimension,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at",
                params![
                    vector.memory_id.0,
                    vector.model,
                    vector.embedding.len() as i64,
                    serde_json::to_string(&vector.embedding)?,
                    now,
                ],
            )?;
        }

        for id in &changes.delete_records {
            let deleted = tx.execute("DELETE FROM memory_records WHERE id = ?1", params![id.0])?;
            if deleted == 0 {
                return Err(MemoryError::not_found("memory", id));
            }
        }

        tx.commit()?;
        debug!(
            "Committed change set: {} records, {} edges, {} vectors, {} deletions",
            changes.upsert_records.len(),
            changes.upsert_edges.len(),
            changes.upsert_vectors.len(),
            changes.delete_records.len() + changes.delete_edges.len()
        );
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

struct RawRecord {
    id: String,
    content: String,
    importance: f64,
    memory_type: String,
    tags: String,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl RawRecord {
    fn into_record(self) -> Result<MemoryRecord> {
        let corrupt = |what: &str, detail: String| {
            MemoryError::Corrupt(format!("record {} has invalid {}: {}", self.id, what, detail))
        };

        if self.content.trim().is_empty() {
            return Err(corrupt("content", "empty".into()));
        }
        let importance = self.importance as f32;
        if !importance.is_finite() || !(0.0..=1.0).contains(&importance) {
            return Err(corrupt("importance", self.importance.to_string()));
        }
        let memory_type: MemoryType = self
            .memory_type
            .parse()
            .map_err(|e: recall_schemas::ParseEnumError| corrupt("memory_type", e.to_string()))?;
        let tags: Vec<String> =
            serde_json::from_str(&self.tags).map_err(|e| corrupt("tags", e.to_string()))?;
        let metadata: BTreeMap<String, String> = serde_json::from_str(&self.metadata)
            .map_err(|e| corrupt("metadata", e.to_string()))?;
        let created_at = parse_timestamp(&self.id, &self.created_at)?;
        let updated_at = parse_timestamp(&self.id, &self.updated_at)?;

        Ok(MemoryRecord {
            id: MemoryId(self.id),
            content: self.content,
            importance,
            memory_type,
            tags,
            metadata,
            created_at,
            updated_at,
            embedding: None,
        })
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(owner: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MemoryError::Corrupt(format!("{} has invalid timestamp '{}': {}", owner, raw, e)))
}

fn parse_embedding(owner: &str, json: &str) -> Result<Vec<f32>> {
    let embedding: Vec<f32> = serde_json::from_str(json)
        .map_err(|e| MemoryError::Corrupt(format!("cached vector for {}: {}", owner, e)))?;
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(MemoryError::Corrupt(format!(
            "cached vector for {} contains non-finite values",
            owner
        )));
    }
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn edge(source: &MemoryId, target: &MemoryId, relation_type: RelationType) -> AssociationEdge {
        AssociationEdge {
            source_id: source.clone(),
            target_id: target.clone(),
            relation_type,
            weight: 0.6,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_round_trip() {
        let temp_db = NamedTempFile::new().unwrap();
        let mut db = Database::open(temp_db.path()).unwrap();

        let mut record = MemoryRecord::new("User prefers tea", 0.7, MemoryType::Preference)
            .with_tags(vec!["drinks".into()]);
        record.metadata.insert("source".into(), "chat".into());
        record.embedding = Some(vec![0.25, -0.5, 1.0]);

        db.apply(&ChangeSet {
            upsert_records: vec![record.clone()],
            upsert_vectors: vec![CachedVector {
                memory_id: record.id.clone(),
                model: EXTERNAL_VECTOR_MODEL.into(),
                embedding: vec![0.25, -0.5, 1.0],
            }],
            ..Default::default()
        })
        .unwrap();

        let loaded = db.get_record(&record.id).unwrap().unwrap();
        assert_eq!(loaded, record);

        let reopened = Database::open(temp_db.path()).unwrap();
        assert_eq!(reopened.load_records().unwrap(), vec![record]);
    }

    #[test]
    fn test_delete_cascades_to_edges_and_vectors() {
        let mut db = Database::open_in_memory().unwrap();
        let a = MemoryRecord::new("alpha", 0.5, MemoryType::Fact);
        let b = MemoryRecord::new("beta", 0.5, MemoryType::Fact);

        db.apply(&ChangeSet {
            upsert_records: vec![a.clone(), b.clone()],
            upsert_edges: vec![edge(&a.id, &b.id, RelationType::CausedBy)],
            upsert_vectors: vec![CachedVector {
                memory_id: a.id.clone(),
                model: "hashing".into(),
                embedding: vec![1.0, 0.0],
            }],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(db.load_edges().unwrap().len(), 1);

        db.apply(&ChangeSet {
            delete_records: vec![a.id.clone()],
            ..Default::default()
        })
        .unwrap();

        assert!(db.load_edges().unwrap().is_empty());
        assert!(db.load_vectors().unwrap().is_empty());
        assert_eq!(db.count_records().unwrap(), 1);
    }

    #[test]
    fn test_failed_change_set_rolls_back() {
        let mut db = Database::open_in_memory().unwrap();
        let a = MemoryRecord::new("alpha", 0.5, MemoryType::Fact);

        let result = db.apply(&ChangeSet {
            upsert_records: vec![a.clone()],
            delete_records: vec![MemoryId::from("mem_missing")],
            ..Default::default()
        });

        assert!(matches!(result, Err(MemoryError::NotFound(_))));
        assert_eq!(db.count_records().unwrap(), 0);
    }

    #[test]
    fn test_edge_upsert_updates_weight() {
        let mut db = Database::open_in_memory().unwrap();
        let a = MemoryRecord::new("alpha", 0.5, MemoryType::Fact);
        let b = MemoryRecord::new("beta", 0.5, MemoryType::Fact);
        let mut e = edge(&a.id, &b.id, RelationType::PartOf);

        db.apply(&ChangeSet {
            upsert_records: vec![a, b],
            upsert_edges: vec![e.clone()],
            ..Default::default()
        })
        .unwrap();

        e.weight = 0.9;
        db.apply(&ChangeSet {
            upsert_edges: vec![e],
            ..Default::default()
        })
        .unwrap();

        let edges = db.load_edges().unwrap();
        assert_eq!(edges.len(), 1);
        assert!((edges[0].weight - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_rows_are_corrupt() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute(
                "INSERT INTO memory_records (id, content, importance, memory_type, tags, metadata, created_at, updated_at)
                 VALUES ('mem_bad', 'text', 3.5, 'fact', '[]', '{}', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
                [],
            )
            .unwrap();

        assert!(matches!(db.load_records(), Err(MemoryError::Corrupt(_))));
    }

    #[test]
    fn test_integrity_check_passes_on_fresh_db() {
        let db = Database::open_in_memory().unwrap();
        db.check_integrity().unwrap();
    }

    #[test]
    fn test_file_database_uses_wal() {
        let temp_db = NamedTempFile::new().unwrap();
        let db = Database::open(temp_db.path()).unwrap();
        let mode: String = db
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
