use crate::error::{MemoryError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use recall_schemas::{
    generate_memory_id, AssociationEdge, ExportFormat, MemoryId, MemoryRecord, MemoryType,
    RecordError, DEFAULT_IMPORTANCE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

pub const FORMAT_VERSION: u32 = 1;

/// Tabular columns. Embeddings, metadata and edges have no column and are
/// dropped on this path. Tags are written as a JSON array in one cell.
const CSV_HEADERS: [&str; 7] = [
    "id",
    "content",
    "memory_type",
    "importance",
    "tags",
    "created_at",
    "updated_at",
];

/// Lossless JSON export document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub records: Vec<MemoryRecord>,
    #[serde(default)]
    pub edges: Vec<AssociationEdge>,
}

/// Output of decoding an import. Entries are validated one by one; the
/// failures are collected instead of aborting the batch.
#[derive(Debug, Default)]
pub struct DecodedImport {
    /// Accepted records with their position in the source document.
    pub records: Vec<(usize, MemoryRecord)>,
    pub edges: Vec<(usize, AssociationEdge)>,
    pub errors: Vec<RecordError>,
}

pub fn export(records: &[MemoryRecord], edges: &[AssociationEdge], format: ExportFormat) -> Result<Vec<u8>> {
    let bytes = match format {
        ExportFormat::Json => export_json(records, edges)?,
        ExportFormat::Csv => export_csv(records)?,
    };
    info!("Exported {} records as {} ({} bytes)", records.len(), format.as_str(), bytes.len());
    Ok(bytes)
}

fn export_json(records: &[MemoryRecord], edges: &[AssociationEdge]) -> Result<Vec<u8>> {
    let document = ExportDocument {
        version: FORMAT_VERSION,
        exported_at: Utc::now(),
        records: records.to_vec(),
        edges: edges.to_vec(),
    };
    Ok(serde_json::to_vec_pretty(&document)?)
}

fn export_csv(records: &[MemoryRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADERS)?;

    for record in records {
        let importance = record.importance.to_string();
        let tags = if record.tags.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&record.tags)?
        };
        let created_at = record.created_at.to_rfc3339();
        let updated_at = record.updated_at.to_rfc3339();
        writer.write_record([
            record.id.as_str(),
            record.content.as_str(),
            record.memory_type.as_str(),
            importance.as_str(),
            tags.as_str(),
            created_at.as_str(),
            updated_at.as_str(),
        ])?;
    }

    writer
        .into_inner()
        .map_err(|e| MemoryError::Io(e.into_error()))
}

pub fn decode(bytes: &[u8], format: ExportFormat) -> Result<DecodedImport> {
    let decoded = match format {
        ExportFormat::Json => decode_json(bytes)?,
        ExportFormat::Csv => decode_csv(bytes)?,
    };
    debug!(
        "Decoded {} records, {} edges, {} errors",
        decoded.records.len(),
        decoded.edges.len(),
        decoded.errors.len()
    );
    Ok(decoded)
}

/// Checks shared by the import path and direct writes.
pub fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(MemoryError::InvalidArgument("content must not be empty".into()));
    }
    Ok(())
}

pub fn validate_importance(importance: f32) -> Result<()> {
    if !importance.is_finite() || !(0.0..=1.0).contains(&importance) {
        return Err(MemoryError::InvalidArgument(format!(
            "importance must be within [0, 1], got {}",
            importance
        )));
    }
    Ok(())
}

/// Accepts the export document, a bare array of records, or a map of
/// `id -> record`.
fn decode_json(bytes: &[u8]) -> Result<DecodedImport> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| MemoryError::InvalidArgument(format!("import is not valid JSON: {}", e)))?;

    let mut decoded = DecodedImport::default();
    let (entries, edges): (Vec<(Option<String>, Value)>, Vec<Value>) = match value {
        Value::Object(mut map) if map.contains_key("records") => {
            let records = match map.remove("records") {
                Some(Value::Array(items)) => items.into_iter().map(|v| (None, v)).collect(),
                _ => {
                    return Err(MemoryError::InvalidArgument(
                        "\"records\" must be an array".into(),
                    ))
                }
            };
            let edges = match map.remove("edges") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            (records, edges)
        }
        Value::Object(map) => (map.into_iter().map(|(k, v)| (Some(k), v)).collect(), Vec::new()),
        Value::Array(items) => (items.into_iter().map(|v| (None, v)).collect(), Vec::new()),
        _ => {
            return Err(MemoryError::InvalidArgument(
                "import must be an object or an array".into(),
            ))
        }
    };

    for (index, (key, entry)) in entries.into_iter().enumerate() {
        let key_id = key.clone();
        match serde_json::from_value::<ImportedRecord>(entry) {
            Ok(raw) => match raw.into_record(key) {
                Ok(record) => decoded.records.push((index, record)),
                Err((id, message)) => decoded.errors.push(RecordError { index, id, message }),
            },
            Err(e) => decoded.errors.push(RecordError {
                index,
                id: key_id,
                message: e.to_string(),
            }),
        }
    }

    for (index, entry) in edges.into_iter().enumerate() {
        match serde_json::from_value::<AssociationEdge>(entry) {
            Ok(edge) => decoded.edges.push((index, edge)),
            Err(e) => decoded.errors.push(RecordError {
                index,
                id: None,
                message: format!("edge: {}", e),
            }),
        }
    }

    Ok(decoded)
}

fn decode_csv(bytes: &[u8]) -> Result<DecodedImport> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);

    // Header names are matched loosely so the title-case headers of older
    // exports ("Created At") line up with ours ("created_at").
    let columns: HashMap<String, usize> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, name)| (column_key(name), i))
        .collect();
    if !columns.contains_key("content") {
        return Err(MemoryError::InvalidArgument(
            "CSV import needs a content column".into(),
        ));
    }

    let mut decoded = DecodedImport::default();
    for (index, row) in reader.records().enumerate() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                decoded.errors.push(RecordError {
                    index,
                    id: None,
                    message: e.to_string(),
                });
                continue;
            }
        };
        let field = |name: &str| -> Option<String> {
            columns
                .get(name)
                .and_then(|i| row.get(*i))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let importance = match field("importance").map(|raw| raw.parse::<f32>()) {
            Some(Ok(value)) => Some(f64::from(value)),
            Some(Err(e)) => {
                decoded.errors.push(RecordError {
                    index,
                    id: field("id"),
                    message: format!("invalid importance: {}", e),
                });
                continue;
            }
            None => None,
        };

        let tags = match field("tags").map(|raw| split_tags(&raw)) {
            Some(Ok(tags)) => tags,
            Some(Err(message)) => {
                decoded.errors.push(RecordError {
                    index,
                    id: field("id"),
                    message,
                });
                continue;
            }
            None => Vec::new(),
        };

        let raw = ImportedRecord {
            id: field("id"),
            content: columns
                .get("content")
                .and_then(|i| row.get(*i))
                .unwrap_or_default()
                .to_string(),
            importance,
            memory_type: field("memory_type"),
            tags,
            metadata: BTreeMap::new(),
            created_at: field("created_at"),
            updated_at: field("updated_at"),
            embedding: None,
        };

        match raw.into_record(None) {
            Ok(record) => decoded.records.push((index, record)),
            Err((id, message)) => decoded.errors.push(RecordError { index, id, message }),
        }
    }

    Ok(decoded)
}

fn column_key(header: &str) -> String {
    let key = header.trim().to_lowercase().replace([' ', '-'], "_");
    match key.as_str() {
        "type" | "category" => "memory_type".to_string(),
        "timestamp" => "created_at".to_string(),
        _ => key,
    }
}

/// A JSON array as written by `export`, or a `;` or `,` separated list
/// from hand-made sheets.
fn split_tags(raw: &str) -> std::result::Result<Vec<String>, String> {
    if raw.starts_with('[') {
        return serde_json::from_str::<Vec<String>>(raw).map_err(|e| format!("invalid tags: {}", e));
    }
    let separator = if raw.contains(';') { ';' } else { ',' };
    Ok(raw
        .split(separator)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect())
}

#[derive(Debug, Deserialize)]
struct ImportedRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    importance: Option<f64>,
    #[serde(default, alias = "type", alias = "category")]
    memory_type: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
    #[serde(default, alias = "timestamp")]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

impl ImportedRecord {
    /// Validate into a record. Errors carry the id (when known) and a
    /// message for the per-record report.
    fn into_record(self, key: Option<String>) -> std::result::Result<MemoryRecord, (Option<String>, String)> {
        let id = self.id.filter(|id| !id.trim().is_empty()).or(key);
        let fail = |message: String| (id.clone(), message);

        validate_content(&self.content).map_err(|e| fail(e.to_string()))?;

        let importance = self.importance.map(|v| v as f32).unwrap_or(DEFAULT_IMPORTANCE);
        validate_importance(importance).map_err(|e| fail(e.to_string()))?;

        let memory_type = match self.memory_type.as_deref().map(str::trim) {
            None | Some("") => MemoryType::Other,
            Some(raw) => raw.parse().map_err(|e: recall_schemas::ParseEnumError| fail(e.to_string()))?,
        };

        let now = Utc::now();
        let created_at = match &self.created_at {
            Some(raw) => parse_timestamp(raw).ok_or_else(|| fail(format!("invalid created_at '{}'", raw)))?,
            None => now,
        };
        let updated_at = match &self.updated_at {
            Some(raw) => parse_timestamp(raw).ok_or_else(|| fail(format!("invalid updated_at '{}'", raw)))?,
            None => created_at,
        };

        if let Some(embedding) = &self.embedding {
            if embedding.is_empty() || embedding.iter().any(|v| !v.is_finite()) {
                return Err(fail("embedding must be a non-empty list of finite numbers".into()));
            }
        }

        let metadata = self
            .metadata
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();

        Ok(MemoryRecord {
            id: id.map(MemoryId).unwrap_or_else(generate_memory_id),
            content: self.content,
            importance,
            memory_type,
            tags: self.tags,
            metadata,
            created_at,
            updated_at,
            embedding: self.embedding,
        })
    }
}

/// RFC3339, or a naive ISO timestamp taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_schemas::RelationType;

    fn sample() -> Vec<MemoryRecord> {
        vec![
            MemoryRecord::new("User prefers tea, not coffee", 0.8, MemoryType::Preference)
                .with_tags(vec!["drinks".into(), "morning".into()]),
            MemoryRecord::new("Standup moved to 10:30", 0.4, MemoryType::Event),
        ]
    }

    #[test]
    fn test_json_export_is_lossless() {
        let mut records = sample();
        records[0].embedding = Some(vec![0.25, -0.5]);
        records[1].metadata.insert("source".into(), "calendar".into());
        let edges = vec![AssociationEdge {
            source_id: records[0].id.clone(),
            target_id: records[1].id.clone(),
            relation_type: RelationType::Precedes,
            weight: 0.6,
            created_at: Utc::now(),
        }];

        let bytes = export(&records, &edges, ExportFormat::Json).unwrap();
        let decoded = decode(&bytes, ExportFormat::Json).unwrap();

        assert!(decoded.errors.is_empty());
        let restored: Vec<MemoryRecord> = decoded.records.into_iter().map(|(_, r)| r).collect();
        assert_eq!(restored, records);
        assert_eq!(decoded.edges[0].1, edges[0]);
    }

    #[test]
    fn test_csv_keeps_core_fields() {
        let mut records = sample();
        records[0].embedding = Some(vec![1.0]);

        let bytes = export(&records, &[], ExportFormat::Csv).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("id,content,memory_type,importance,tags,created_at,updated_at"));

        let decoded = decode(&bytes, ExportFormat::Csv).unwrap();
        assert!(decoded.errors.is_empty());
        for ((_, restored), original) in decoded.records.iter().zip(&records) {
            assert_eq!(restored.id, original.id);
            assert_eq!(restored.content, original.content);
            assert_eq!(restored.importance, original.importance);
            assert_eq!(restored.memory_type, original.memory_type);
            assert_eq!(restored.tags, original.tags);
            assert!(restored.embedding.is_none());
        }
    }

    #[test]
    fn test_legacy_map_shape() {
        let legacy = r#"{
            "a1": {"id": "a1", "content": "喜欢喝绿茶", "type": "用户偏好", "importance": 0.7,
                   "tags": [], "created_at": "2024-03-01T08:15:30.123456", "access_count": 2},
            "b2": {"content": "Project kickoff", "type": "事件"}
        }"#;

        let decoded = decode(legacy.as_bytes(), ExportFormat::Json).unwrap();
        assert!(decoded.errors.is_empty());
        let by_id: HashMap<_, _> = decoded
            .records
            .into_iter()
            .map(|(_, r)| (r.id.0.clone(), r))
            .collect();
        assert_eq!(by_id["a1"].memory_type, MemoryType::Preference);
        assert_eq!(by_id["b2"].memory_type, MemoryType::Event);
        assert_eq!(by_id["b2"].importance, DEFAULT_IMPORTANCE);
    }

    #[test]
    fn test_legacy_csv_headers() {
        let legacy = "ID,Content,Type,Importance,Tags,Created At\n\
                      x1,Met Alice at the conference,事件,0.6,\"work,people\",2024-01-02T03:04:05\n";

        let decoded = decode(legacy.as_bytes(), ExportFormat::Csv).unwrap();
        assert!(decoded.errors.is_empty());
        let (_, record) = &decoded.records[0];
        assert_eq!(record.id, MemoryId::from("x1"));
        assert_eq!(record.memory_type, MemoryType::Event);
        assert_eq!(record.tags, vec!["work".to_string(), "people".to_string()]);
    }

    #[test]
    fn test_bad_entries_are_reported_individually() {
        let batch = r#"[
            {"content": "one"},
            {"content": "   "},
            {"content": "three", "importance": 1.5},
            {"content": "four", "created_at": "yesterday"},
            {"content": 5}
        ]"#;

        let decoded = decode(batch.as_bytes(), ExportFormat::Json).unwrap();
        assert_eq!(decoded.records.len(), 1);
        let failed: Vec<usize> = decoded.errors.iter().map(|e| e.index).collect();
        assert_eq!(failed, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_csv_tags_with_separators_survive() {
        let mut records = sample();
        records[0].tags = vec!["food, drink".into(), "a;b".into(), "[x]".into()];

        let bytes = export(&records, &[], ExportFormat::Csv).unwrap();
        let decoded = decode(&bytes, ExportFormat::Csv).unwrap();
        assert!(decoded.errors.is_empty());
        assert_eq!(decoded.records[0].1.tags, records[0].tags);
    }

    #[test]
    fn test_garbage_is_rejected_whole() {
        let err = decode(b"not json", ExportFormat::Json).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));
    }
}
