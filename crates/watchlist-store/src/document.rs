//! Document Store Contract
//!
//! The minimal surface the watchlist needs from a document database:
//! find, delete-many and count over a named collection, plus the inserts
//! used by `watch`. Backends live in `memory`, `sqlite` and (behind the
//! `mongodb` feature) `mongo`.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::fmt;

use crate::error::{StoreError, StoreResult};

/// A schema-flexible record
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Lazy stream of documents produced by `find`
pub type DocumentStream = BoxStream<'static, StoreResult<Document>>;

/// Fully-qualified collection: logical database plus collection name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    pub namespace: String,
    pub name: String,
}

impl CollectionRef {
    /// Both parts must be plain identifiers, since some backends splice them into table names.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> StoreResult<Self> {
        let namespace = namespace.into();
        let name = name.into();
        validate_identifier("namespace", &namespace)?;
        validate_identifier("collection", &name)?;
        Ok(Self { namespace, name })
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

fn validate_identifier(kind: &str, value: &str) -> StoreResult<()> {
    let valid = !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidConfig(format!(
            "{} '{}' must be 1-64 characters of [A-Za-z0-9_-]",
            kind, value
        )))
    }
}

/// Equality match on top-level fields. An empty filter matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    fields: Vec<(String, serde_json::Value)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::all().and_eq(field, value)
    }

    pub fn and_eq(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.push((field.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[(String, serde_json::Value)] {
        &self.fields
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.fields
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }
}

/// Storage collaborator behind `WatchlistStore`.
///
/// Implementations must be safe to share across tasks; the store holds one
/// behind an `Arc` and issues calls concurrently.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create the collection if missing, with a unique index on `key_field`
    /// covering documents whose `key_field` is a string
    async fn ensure_collection(&self, _collection: &CollectionRef, _key_field: &str) -> StoreResult<()> {
        Ok(())
    }

    /// Snapshot of every document in storage order. No I/O until polled.
    fn find(&self, collection: &CollectionRef) -> DocumentStream;

    /// Plain insert. Still bound by the unique index from `ensure_collection`;
    /// a clash is an error rather than a silent skip.
    async fn insert_one(&self, collection: &CollectionRef, doc: Document) -> StoreResult<()>;

    /// Insert unless a document with the same `key_field` value exists.
    /// Returns `false` when nothing was inserted. Must be atomic.
    async fn insert_unique(
        &self,
        collection: &CollectionRef,
        key_field: &str,
        doc: Document,
    ) -> StoreResult<bool>;

    async fn delete_many(&self, collection: &CollectionRef, filter: &Filter) -> StoreResult<u64>;

    async fn count_documents(&self, collection: &CollectionRef, filter: &Filter) -> StoreResult<u64>;

    async fn ping(&self) -> StoreResult<()>;

    async fn close(&self) {}

    fn backend_name(&self) -> &'static str;
}
