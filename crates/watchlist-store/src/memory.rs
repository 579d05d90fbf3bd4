//! In-process document store used by tests and dry runs.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::document::{CollectionRef, Document, DocumentStore, DocumentStream, Filter};
use crate::error::{StoreError, StoreResult};

type DocKey = (String, String);

struct StoredDoc {
    /// Unique key this document holds in `MemCollection::keys`, if any
    key: Option<DocKey>,
    doc: Document,
}

#[derive(Default)]
struct MemCollection {
    docs: DashMap<u64, StoredDoc>,
    /// (key field, key value) -> document id
    keys: DashMap<DocKey, u64>,
    /// Unique field registered by `ensure_collection`
    key_field: OnceLock<String>,
    next_id: AtomicU64,
}

impl MemCollection {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Claim `key` for a new document. Returns false if another document holds it.
    /// Lock order is always `keys` then `docs`.
    fn insert_keyed(&self, key: DocKey, doc: Document) -> bool {
        match self.keys.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let id = self.next_id();
                let key = Some(slot.key().clone());
                self.docs.insert(id, StoredDoc { key, doc });
                slot.insert(id);
                true
            }
        }
    }

    /// Remove one document and release its key under the same entry lock
    fn remove(&self, id: u64) -> bool {
        let key = match self.docs.get(&id) {
            Some(stored) => stored.key.clone(),
            None => return false,
        };

        match key.map(|key| self.keys.entry(key)) {
            Some(Entry::Occupied(slot)) if *slot.get() == id => {
                let removed = self.docs.remove(&id).is_some();
                slot.remove();
                removed
            }
            _ => self.docs.remove(&id).is_some(),
        }
    }

    fn snapshot(&self) -> Vec<Document> {
        let mut docs: Vec<(u64, Document)> = self
            .docs
            .iter()
            .map(|entry| (*entry.key(), entry.value().doc.clone()))
            .collect();
        docs.sort_by_key(|(id, _)| *id);
        docs.into_iter().map(|(_, doc)| doc).collect()
    }
}

struct Inner {
    collections: DashMap<CollectionRef, Arc<MemCollection>>,
    available: AtomicBool,
}

impl Inner {
    fn collection(&self, collection: &CollectionRef) -> Arc<MemCollection> {
        Arc::clone(&self.collections.entry(collection.clone()).or_default())
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::StorageUnavailable(
                "in-memory store is offline".to_string(),
            ))
        }
    }
}

/// Cloning yields another handle onto the same data.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    inner: Arc<Inner>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                collections: DashMap::new(),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate an outage: while offline every call fails with `StorageUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }
}

/// Only string values take part in uniqueness, as with a partial index
fn key_of(doc: &Document, key_field: &str) -> Option<DocKey> {
    match doc.get(key_field) {
        Some(serde_json::Value::String(s)) => Some((key_field.to_string(), s.clone())),
        _ => None,
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn ensure_collection(&self, collection: &CollectionRef, key_field: &str) -> StoreResult<()> {
        self.inner.check_available()?;
        let coll = self.inner.collection(collection);
        if coll.key_field.get_or_init(|| key_field.to_string()) != key_field {
            return Err(StoreError::InvalidConfig(format!(
                "{} is already keyed on another field",
                collection
            )));
        }
        Ok(())
    }

    fn find(&self, collection: &CollectionRef) -> DocumentStream {
        let inner = Arc::clone(&self.inner);
        let collection = collection.clone();

        stream::once(async move {
            inner.check_available()?;
            let docs = inner.collection(&collection).snapshot();
            Ok::<_, StoreError>(stream::iter(docs.into_iter().map(Ok::<Document, StoreError>)))
        })
        .try_flatten()
        .boxed()
    }

    async fn insert_one(&self, collection: &CollectionRef, doc: Document) -> StoreResult<()> {
        self.inner.check_available()?;
        let coll = self.inner.collection(collection);

        match coll.key_field.get().and_then(|field| key_of(&doc, field)) {
            Some(key) => {
                let value = key.1.clone();
                if !coll.insert_keyed(key, doc) {
                    return Err(StoreError::Backend(format!(
                        "duplicate key '{}' in {}",
                        value, collection
                    )));
                }
            }
            None => {
                let id = coll.next_id();
                coll.docs.insert(id, StoredDoc { key: None, doc });
            }
        }
        Ok(())
    }

    async fn insert_unique(
        &self,
        collection: &CollectionRef,
        key_field: &str,
        doc: Document,
    ) -> StoreResult<bool> {
        self.inner.check_available()?;
        let key = key_of(&doc, key_field).ok_or_else(|| {
            StoreError::InvalidItem(format!("document has no string '{}' key", key_field))
        })?;
        let coll = self.inner.collection(collection);
        Ok(coll.insert_keyed(key, doc))
    }

    async fn delete_many(&self, collection: &CollectionRef, filter: &Filter) -> StoreResult<u64> {
        self.inner.check_available()?;
        let coll = self.inner.collection(collection);

        let matching: Vec<u64> = coll
            .docs
            .iter()
            .filter(|entry| filter.matches(&entry.value().doc))
            .map(|entry| *entry.key())
            .collect();

        let removed = matching.into_iter().filter(|id| coll.remove(*id)).count();
        Ok(removed as u64)
    }

    async fn count_documents(&self, collection: &CollectionRef, filter: &Filter) -> StoreResult<u64> {
        self.inner.check_available()?;
        let coll = self.inner.collection(collection);
        let count = if filter.is_empty() {
            coll.docs.len()
        } else {
            coll.docs
                .iter()
                .filter(|entry| filter.matches(&entry.value().doc))
                .count()
        };
        Ok(count as u64)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.check_available()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
