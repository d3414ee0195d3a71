//! Records, write operations and record extractors
//!
//! A [`Record`] is the normalized five-field document stored in a collection.
//! Extractors turn one raw JSON value (one line of a JSON-lines file) into a
//! record, or reject it by returning `None`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized CDS/ISIS document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Natural key; writes with an existing id overwrite the document
    pub id: String,
    pub title: String,
    pub content: String,
    pub year: String,
    /// DOI prefix or category
    pub prefix: String,
}

impl Record {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_year(mut self, year: impl Into<String>) -> Self {
        self.year = year.into();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// One upsert of a record into a collection, keyed by the record id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOperation {
    pub collection: String,
    pub document_id: String,
    pub document: Record,
}

impl WriteOperation {
    pub fn upsert(collection: &str, record: Record) -> Self {
        Self {
            collection: collection.to_string(),
            document_id: record.id.clone(),
            document: record,
        }
    }
}

/// Maps one parsed JSON line to a record
///
/// Returning `None` rejects the line. Implementations must not panic on
/// unexpected shapes; any structural surprise is a rejection.
pub trait RecordExtractor: Send + Sync {
    fn extract(&self, raw: &Value) -> Option<Record>;
}

impl<F> RecordExtractor for F
where
    F: Fn(&Value) -> Option<Record> + Send + Sync,
{
    fn extract(&self, raw: &Value) -> Option<Record> {
        self(raw)
    }
}

/// Extractor for DataCite JSON-lines dumps
///
/// ```json
/// {"id": "10.5281/zenodo.123",
///  "attributes": {"titles": [{"title": "..."}],
///                 "descriptions": [{"description": "..."}],
///                 "publicationYear": 2024, "prefix": "10.5281"}}
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct DataCiteExtractor;

impl RecordExtractor for DataCiteExtractor {
    fn extract(&self, raw: &Value) -> Option<Record> {
        let raw = raw.as_object()?;

        let id = match raw.get("id")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };

        let empty = serde_json::Map::new();
        let attrs = match raw.get("attributes") {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(attrs)) => attrs,
            Some(_) => return None,
        };

        let year = match attrs.get("publicationYear") {
            None | Some(Value::Null) => String::new(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => return None,
        };

        Some(Record {
            id,
            title: join_entries(attrs.get("titles"), "title")?,
            content: join_entries(attrs.get("descriptions"), "description")?,
            year,
            prefix: optional_str(attrs.get("prefix"))?,
        })
    }
}

/// Space-joins `key` across an array of objects; a missing array is empty
fn join_entries(entries: Option<&Value>, key: &str) -> Option<String> {
    let entries = match entries {
        None | Some(Value::Null) => return Some(String::new()),
        Some(Value::Array(entries)) => entries,
        Some(_) => return None,
    };

    let parts = entries
        .iter()
        .map(|entry| optional_str(entry.as_object()?.get(key)))
        .collect::<Option<Vec<_>>>()?;

    Some(parts.join(" "))
}

fn optional_str(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => Some(String::new()),
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => None,
    }
}
