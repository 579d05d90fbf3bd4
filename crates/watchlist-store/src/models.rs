//! Watchlist Data Models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::document::Document;
use crate::error::{StoreError, StoreResult};

pub const SYMBOL_FIELD: &str = "symbol";
pub const ADDED_AT_FIELD: &str = "added_at";
pub const METADATA_FIELD: &str = "metadata";

/// Fields written by the chat bot before `symbol`/`added_at` existed
const LEGACY_SYMBOL_FIELD: &str = "stock_code";
const LEGACY_NAME_FIELD: &str = "stock_name";
const LEGACY_CARRIED_FIELDS: [&str; 2] = ["user_id", "user_name"];

/// A scalar metadata value attached to a watched item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Integer(i) => Some(*i as f64),
            MetadataValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn from_json(key: &str, value: &serde_json::Value) -> StoreResult<Self> {
        match value {
            serde_json::Value::Bool(b) => Ok(MetadataValue::Bool(*b)),
            serde_json::Value::String(s) => Ok(MetadataValue::Text(s.clone())),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(MetadataValue::Integer)
                .or_else(|| n.as_f64().map(MetadataValue::Float))
                .ok_or_else(|| {
                    StoreError::InvalidItem(format!("metadata '{}' is not a finite number", key))
                }),
            _ => Err(StoreError::InvalidItem(format!(
                "metadata '{}' is not a scalar",
                key
            ))),
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{}", b),
            MetadataValue::Integer(i) => write!(f, "{}", i),
            MetadataValue::Float(v) => write!(f, "{}", v),
            MetadataValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Text(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Text(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Integer(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(f: f64) -> Self {
        MetadataValue::Float(f)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

/// Open mapping of display name, threshold price, owner and the like
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A symbol tracked in the watchlist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchedItem {
    /// Stock symbol, unique within the store
    pub symbol: String,
    /// When the symbol was first watched
    pub added_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
}

impl WatchedItem {
    /// Build a new item stamped with the current time. The symbol is trimmed and must not be empty.
    /// Non-finite floats are rejected because JSON cannot store them.
    pub fn new(symbol: &str, metadata: Metadata) -> StoreResult<Self> {
        let symbol = normalize_symbol(symbol)?;
        if let Some((key, _)) = metadata
            .iter()
            .find(|(_, v)| matches!(v, MetadataValue::Float(f) if !f.is_finite()))
        {
            return Err(StoreError::InvalidItem(format!(
                "metadata '{}' is not a finite number",
                key
            )));
        }
        Ok(Self {
            symbol,
            added_at: Utc::now(),
            metadata,
        })
    }

    /// Display name, if one was stored under `metadata.name`
    pub fn name(&self) -> Option<&str> {
        self.metadata.get("name").and_then(MetadataValue::as_str)
    }

    pub fn to_document(&self) -> StoreResult<Document> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(doc) => Ok(doc),
            _ => Err(StoreError::InvalidItem(format!(
                "{}: item did not encode as an object",
                self.symbol
            ))),
        }
    }

    /// Decode a stored document. Any shape problem is reported as `InvalidItem`.
    ///
    /// Documents without `symbol` but with the bot's `stock_code` field are
    /// read through [`WatchedItem::from_legacy_document`].
    pub fn from_document(doc: &Document) -> StoreResult<Self> {
        if !doc.contains_key(SYMBOL_FIELD) && doc.contains_key(LEGACY_SYMBOL_FIELD) {
            return Self::from_legacy_document(doc);
        }

        let symbol = match doc.get(SYMBOL_FIELD) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(_) => {
                return Err(StoreError::InvalidItem(
                    "'symbol' must be a non-empty string".to_string(),
                ))
            }
            None => return Err(StoreError::InvalidItem("missing 'symbol'".to_string())),
        };

        let added_at = doc
            .get(ADDED_AT_FIELD)
            .and_then(|v| v.as_str())
            .ok_or_else(|| StoreError::InvalidItem(format!("{}: missing 'added_at'", symbol)))
            .and_then(|raw| parse_added_at(&symbol, raw))?;

        let metadata = match doc.get(METADATA_FIELD) {
            None | Some(serde_json::Value::Null) => Metadata::new(),
            Some(serde_json::Value::Object(map)) => map
                .iter()
                .map(|(k, v)| MetadataValue::from_json(k, v).map(|value| (k.clone(), value)))
                .collect::<StoreResult<Metadata>>()?,
            Some(_) => {
                return Err(StoreError::InvalidItem(format!(
                    "{}: 'metadata' must be an object",
                    symbol
                )))
            }
        };

        Ok(Self {
            symbol,
            added_at,
            metadata,
        })
    }

    /// Decode a `{user_id, user_name, stock_code, stock_name}` row as written
    /// by the chat bot. `stock_name` becomes `metadata.name`, the user fields
    /// are carried into metadata, and a missing `added_at` reads as the Unix epoch.
    pub fn from_legacy_document(doc: &Document) -> StoreResult<Self> {
        let symbol = match doc.get(LEGACY_SYMBOL_FIELD) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            _ => {
                return Err(StoreError::InvalidItem(
                    "'stock_code' must be a non-empty string".to_string(),
                ))
            }
        };

        let added_at = match doc.get(ADDED_AT_FIELD).and_then(|v| v.as_str()) {
            Some(raw) => parse_added_at(&symbol, raw)?,
            None => DateTime::<Utc>::UNIX_EPOCH,
        };

        let mut metadata = Metadata::new();
        if let Some(name) = doc.get(LEGACY_NAME_FIELD).filter(|v| !v.is_null()) {
            metadata.insert("name".to_string(), MetadataValue::from_json(LEGACY_NAME_FIELD, name)?);
        }
        for field in LEGACY_CARRIED_FIELDS {
            if let Some(value) = doc.get(field).filter(|v| !v.is_null()) {
                metadata.insert(field.to_string(), MetadataValue::from_json(field, value)?);
            }
        }

        Ok(Self {
            symbol,
            added_at,
            metadata,
        })
    }
}

fn parse_added_at(symbol: &str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidItem(format!("{}: bad 'added_at' ({})", symbol, e)))
}

/// Trim a symbol and reject empty ones
pub fn normalize_symbol(symbol: &str) -> StoreResult<String> {
    let trimmed = symbol.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidItem("symbol must not be empty".to_string()));
    }
    Ok(trimmed.to_string())
}

/// Result of a `watch` call
#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome {
    Added(WatchedItem),
    /// The symbol was already on the list; nothing changed
    AlreadyWatched,
}

impl WatchOutcome {
    pub fn is_added(&self) -> bool {
        matches!(self, WatchOutcome::Added(_))
    }
}

/// How `list()` treats documents that fail to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListMode {
    /// Skip and count them
    #[default]
    Lenient,
    /// Abort the listing on the first one
    Strict,
}
