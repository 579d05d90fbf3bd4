//! Watchlist Store
//!
//! List, count and bulk-clear over the `watchlist` collection, plus the
//! `watch`/`unwatch` producers. The store keeps no client-side cache or
//! lock: every call goes straight to the backend, so consistency is exactly
//! what the backend provides. A listing reads one `find` snapshot; a clear is
//! one `delete_many`. Nothing is retried here.

use futures_util::stream::{Stream, StreamExt};
use futures_util::ready;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::document::{CollectionRef, DocumentStore, DocumentStream, Filter};
use crate::error::{StoreError, StoreResult};
use crate::models::{normalize_symbol, ListMode, Metadata, WatchOutcome, WatchedItem, SYMBOL_FIELD};

pub const DEFAULT_NAMESPACE: &str = "linebot";
pub const DEFAULT_COLLECTION: &str = "watchlist";
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Options fixed when a store is opened
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Logical database the collection lives in
    pub namespace: String,
    pub collection: String,
    /// Upper bound on each operation; `None` waits indefinitely
    pub op_timeout: Option<Duration>,
    /// Default mode for listings created by `list()`
    pub list_mode: ListMode,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            op_timeout: Some(DEFAULT_OP_TIMEOUT),
            list_mode: ListMode::Lenient,
        }
    }
}

impl StoreOptions {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_timeout(mut self, op_timeout: Option<Duration>) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn with_list_mode(mut self, list_mode: ListMode) -> Self {
        self.list_mode = list_mode;
        self
    }
}

async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| StoreError::Timeout(limit))?,
        None => fut.await,
    }
}

/// Handle onto one watchlist collection. Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct WatchlistStore {
    backend: Arc<dyn DocumentStore>,
    collection: CollectionRef,
    options: StoreOptions,
}

impl WatchlistStore {
    /// Bind to `options.namespace`/`options.collection`, creating the collection if needed
    pub async fn open(backend: Arc<dyn DocumentStore>, options: StoreOptions) -> StoreResult<Self> {
        let collection = CollectionRef::new(&options.namespace, &options.collection)?;

        bounded(options.op_timeout, async {
            backend.ping().await?;
            backend.ensure_collection(&collection, SYMBOL_FIELD).await
        })
        .await?;

        tracing::info!(
            "Opened watchlist {} on {} backend",
            collection,
            backend.backend_name()
        );

        Ok(Self {
            backend,
            collection,
            options,
        })
    }

    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// Lazy, restartable listing of every item. No I/O until it is streamed.
    pub fn list(&self) -> Listing {
        Listing {
            backend: Arc::clone(&self.backend),
            collection: self.collection.clone(),
            mode: self.options.list_mode,
            op_timeout: self.options.op_timeout,
        }
    }

    /// Number of documents right now. May be stale by the time the caller acts on it.
    ///
    /// Malformed documents are counted too, although a lenient `list()` skips
    /// them, so this equals the listing's length only when `skipped` is 0.
    pub async fn count(&self) -> StoreResult<u64> {
        bounded(
            self.options.op_timeout,
            self.backend.count_documents(&self.collection, &Filter::all()),
        )
        .await
    }

    /// Delete every item and return how many were removed. Returns 0 on an empty store.
    pub async fn clear_all(&self) -> StoreResult<u64> {
        let removed = bounded(
            self.options.op_timeout,
            self.backend.delete_many(&self.collection, &Filter::all()),
        )
        .await?;

        tracing::info!("Cleared {} items from {}", removed, self.collection);
        Ok(removed)
    }

    /// Insert-only: a symbol already on the list is reported, not overwritten
    pub async fn watch(&self, symbol: &str, metadata: Metadata) -> StoreResult<WatchOutcome> {
        let item = WatchedItem::new(symbol, metadata)?;
        let doc = item.to_document()?;

        let inserted = bounded(
            self.options.op_timeout,
            self.backend.insert_unique(&self.collection, SYMBOL_FIELD, doc),
        )
        .await?;

        if inserted {
            tracing::debug!("Watching {}", item.symbol);
            Ok(WatchOutcome::Added(item))
        } else {
            tracing::debug!("{} is already watched", item.symbol);
            Ok(WatchOutcome::AlreadyWatched)
        }
    }

    /// Remove one symbol. Returns false if it was not being watched.
    pub async fn unwatch(&self, symbol: &str) -> StoreResult<bool> {
        let symbol = normalize_symbol(symbol)?;
        let removed = bounded(
            self.options.op_timeout,
            self.backend
                .delete_many(&self.collection, &Filter::eq(SYMBOL_FIELD, symbol.as_str())),
        )
        .await?;

        tracing::debug!("Unwatch {}: {} removed", symbol, removed);
        Ok(removed > 0)
    }

    pub async fn get(&self, symbol: &str) -> StoreResult<Option<WatchedItem>> {
        let symbol = normalize_symbol(symbol)?;
        let listing = self.list().lenient();

        bounded(self.options.op_timeout, async move {
            let mut stream = listing.stream();
            while let Some(item) = stream.next().await {
                let item = item?;
                if item.symbol == symbol {
                    return Ok(Some(item));
                }
            }
            Ok(None)
        })
        .await
    }

    /// Release the backend connection
    pub async fn close(self) {
        self.backend.close().await;
        tracing::debug!("Closed watchlist {}", self.collection);
    }
}

/// Everything a drained listing produced
#[derive(Debug, Clone, Default)]
pub struct ListOutcome {
    pub items: Vec<WatchedItem>,
    /// Documents skipped because they did not decode (lenient mode only)
    pub skipped: usize,
}

impl ListOutcome {
    pub fn symbols(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.symbol.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A restartable listing. Each `stream()` re-reads storage from scratch.
#[derive(Clone)]
pub struct Listing {
    backend: Arc<dyn DocumentStore>,
    collection: CollectionRef,
    mode: ListMode,
    op_timeout: Option<Duration>,
}

impl Listing {
    /// Fail on the first undecodable document
    pub fn strict(mut self) -> Self {
        self.mode = ListMode::Strict;
        self
    }

    /// Skip undecodable documents and count them
    pub fn lenient(mut self) -> Self {
        self.mode = ListMode::Lenient;
        self
    }

    pub fn mode(&self) -> ListMode {
        self.mode
    }

    pub fn stream(&self) -> ItemStream {
        ItemStream {
            inner: self.backend.find(&self.collection),
            collection: self.collection.clone(),
            mode: self.mode,
            skipped: 0,
            done: false,
        }
    }

    /// Drain one stream into memory, bounded by the store's operation timeout
    pub async fn collect(&self) -> StoreResult<ListOutcome> {
        bounded(self.op_timeout, async {
            let mut stream = self.stream();
            let mut items = Vec::new();
            while let Some(item) = stream.next().await {
                items.push(item?);
            }
            Ok(ListOutcome {
                items,
                skipped: stream.skipped(),
            })
        })
        .await
    }
}

/// Decoded items from one `find` snapshot.
///
/// Ends after the first error it yields.
pub struct ItemStream {
    inner: DocumentStream,
    collection: CollectionRef,
    mode: ListMode,
    skipped: usize,
    done: bool,
}

impl ItemStream {
    /// Documents skipped so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn reject(&mut self, err: StoreError) -> Option<StoreError> {
        match self.mode {
            ListMode::Lenient => {
                self.skipped += 1;
                tracing::warn!("Skipping document in {}: {}", self.collection, err);
                None
            }
            ListMode::Strict => {
                self.done = true;
                Some(err)
            }
        }
    }
}

impl Stream for ItemStream {
    type Item = StoreResult<WatchedItem>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }

            let rejected = match ready!(self.inner.poll_next_unpin(cx)) {
                None => {
                    self.done = true;
                    return Poll::Ready(None);
                }
                Some(Ok(doc)) => match WatchedItem::from_document(&doc) {
                    Ok(item) => return Poll::Ready(Some(Ok(item))),
                    Err(e) => e,
                },
                Some(Err(e)) if e.is_invalid_item() => e,
                Some(Err(e)) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
            };

            if let Some(err) = self.reject(rejected) {
                return Poll::Ready(Some(Err(err)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::memory::MemoryDocumentStore;
    use crate::sqlite::SqliteDocumentStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;

    const SYMBOLS: [&str; 3] = ["2330", "2317", "0050"];

    async fn memory_store() -> (WatchlistStore, MemoryDocumentStore) {
        let backend = MemoryDocumentStore::new();
        let store = WatchlistStore::open(Arc::new(backend.clone()), StoreOptions::default())
            .await
            .unwrap();
        (store, backend)
    }

    async fn sqlite_store() -> (WatchlistStore, SqliteDocumentStore) {
        let backend = SqliteDocumentStore::connect("sqlite::memory:", 1).await.unwrap();
        let store = WatchlistStore::open(Arc::new(backend.clone()), StoreOptions::default())
            .await
            .unwrap();
        (store, backend)
    }

    async fn watch_all(store: &WatchlistStore, symbols: &[&str]) {
        for symbol in symbols {
            store.watch(symbol, Metadata::new()).await.unwrap();
        }
    }

    fn symbol_set(outcome: &ListOutcome) -> HashSet<String> {
        outcome.items.iter().map(|i| i.symbol.clone()).collect()
    }

    fn raw(value: serde_json::Value) -> Document {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    async fn check_lifecycle(store: &WatchlistStore) {
        watch_all(store, &SYMBOLS).await;
        assert_eq!(store.count().await.unwrap(), 3);

        let listed = store.list().collect().await.unwrap();
        let expected: HashSet<String> = SYMBOLS.iter().map(|s| s.to_string()).collect();
        assert_eq!(symbol_set(&listed), expected);
        assert_eq!(listed.len(), 3);
        assert_eq!(listed.skipped, 0);

        assert_eq!(store.clear_all().await.unwrap(), 3);
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.list().collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_memory() {
        let (store, _) = memory_store().await;
        check_lifecycle(&store).await;
    }

    #[tokio::test]
    async fn test_lifecycle_sqlite() {
        let (store, _) = sqlite_store().await;
        check_lifecycle(&store).await;
    }

    #[tokio::test]
    async fn test_list_is_set_equal_for_any_insertion_order() {
        let orders: [[&str; 4]; 4] = [
            ["2330", "2317", "0050", "2454"],
            ["2454", "0050", "2317", "2330"],
            ["0050", "2330", "2454", "2317"],
            // duplicates collapse
            ["2330", "2330", "0050", "0050"],
        ];

        for order in orders {
            let (store, _) = memory_store().await;
            watch_all(&store, &order).await;

            let listed = store.list().collect().await.unwrap();
            let expected: HashSet<String> = order.iter().map(|s| s.to_string()).collect();
            assert_eq!(symbol_set(&listed), expected);
            assert_eq!(listed.len(), expected.len(), "no duplicates for {:?}", order);
        }
    }

    #[tokio::test]
    async fn test_clear_all_twice_yields_n_then_zero() {
        for n in [0usize, 1, 5] {
            let (store, _) = sqlite_store().await;
            let symbols: Vec<String> = (0..n).map(|i| format!("{:04}", 1000 + i)).collect();
            for symbol in &symbols {
                store.watch(symbol, Metadata::new()).await.unwrap();
            }

            assert_eq!(store.clear_all().await.unwrap(), n as u64);
            assert_eq!(store.clear_all().await.unwrap(), 0);
            assert_eq!(store.count().await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_count_matches_list_when_quiescent() {
        let (store, _) = memory_store().await;
        watch_all(&store, &["2330", "2317", "2454", "3008", "2412"]).await;
        store.unwatch("2454").await.unwrap();

        let listed = store.list().collect().await.unwrap();
        assert_eq!(store.count().await.unwrap(), listed.len() as u64);
    }

    #[tokio::test]
    async fn test_watch_existing_symbol_is_reported() {
        let (store, _) = sqlite_store().await;
        let mut metadata = Metadata::new();
        metadata.insert("name".to_string(), "台積電".into());

        let first = store.watch("2330", metadata.clone()).await.unwrap();
        assert!(first.is_added());
        let second = store.watch(" 2330 ", metadata).await.unwrap();
        assert_eq!(second, WatchOutcome::AlreadyWatched);
        assert_eq!(store.count().await.unwrap(), 1);

        let item = store.get("2330").await.unwrap().unwrap();
        assert_eq!(item.name(), Some("台積電"));
    }

    async fn check_seeded_symbol_blocks_watch(store: &WatchlistStore, backend: &dyn DocumentStore) {
        let seeded = raw(json!({"symbol": "2330", "added_at": "2025-01-01T00:00:00Z"}));
        backend.insert_one(store.collection(), seeded).await.unwrap();

        let outcome = store.watch("2330", Metadata::new()).await.unwrap();
        assert_eq!(outcome, WatchOutcome::AlreadyWatched);
        let listed = store.list().collect().await.unwrap();
        assert_eq!(listed.symbols(), vec!["2330"]);
    }

    #[tokio::test]
    async fn test_seeded_symbol_blocks_watch_memory() {
        let (store, backend) = memory_store().await;
        check_seeded_symbol_blocks_watch(&store, &backend).await;
    }

    #[tokio::test]
    async fn test_seeded_symbol_blocks_watch_sqlite() {
        let (store, backend) = sqlite_store().await;
        check_seeded_symbol_blocks_watch(&store, &backend).await;
    }

    #[tokio::test]
    async fn test_watch_rejects_non_finite_metadata() {
        let (store, _) = memory_store().await;
        let mut metadata = Metadata::new();
        metadata.insert("threshold".to_string(), f64::NAN.into());

        let err = store.watch("2330", metadata).await.unwrap_err();
        assert!(err.is_invalid_item());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bot_rows_are_listed() {
        let (store, backend) = sqlite_store().await;
        for (code, name) in [("2330", "台積電"), ("2317", "鴻海")] {
            let row = raw(json!({
                "user_id": "U4af4980629",
                "user_name": "小明",
                "stock_code": code,
                "stock_name": name
            }));
            backend.insert_one(store.collection(), row).await.unwrap();
        }

        let listed = store.list().strict().collect().await.unwrap();
        assert_eq!(listed.symbols(), vec!["2330", "2317"]);
        assert_eq!(listed.items[1].name(), Some("鴻海"));
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.clear_all().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_watch_rejects_blank_symbol() {
        let (store, _) = memory_store().await;
        let err = store.watch("   ", Metadata::new()).await.unwrap_err();
        assert!(err.is_invalid_item());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unwatch() {
        let (store, _) = memory_store().await;
        watch_all(&store, &["2330", "2317"]).await;

        assert!(store.unwatch("2330").await.unwrap());
        assert!(!store.unwatch("2330").await.unwrap());
        assert!(store.get("2330").await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 1);

        // unwatching frees the symbol for a later watch
        assert!(store.watch("2330", Metadata::new()).await.unwrap().is_added());
    }

    #[tokio::test]
    async fn test_lenient_listing_skips_malformed_documents() {
        let (store, backend) = memory_store().await;
        watch_all(&store, &["2330"]).await;
        backend
            .insert_one(store.collection(), raw(json!({"stock_name": "鴻海"})))
            .await
            .unwrap();
        watch_all(&store, &["0050"]).await;

        let listed = store.list().collect().await.unwrap();
        assert_eq!(listed.symbols(), vec!["2330", "0050"]);
        assert_eq!(listed.skipped, 1);
    }

    #[tokio::test]
    async fn test_strict_listing_fails_on_malformed_document() {
        let (store, backend) = memory_store().await;
        watch_all(&store, &["2330"]).await;
        backend
            .insert_one(
                store.collection(),
                raw(json!({"symbol": "2317", "added_at": "not a date"})),
            )
            .await
            .unwrap();

        let err = store.list().strict().collect().await.unwrap_err();
        assert!(err.is_invalid_item());

        // the stream yields the good item, then the error, then ends
        let mut stream = store.list().strict().stream();
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_listing_is_lazy_and_restartable() {
        let (store, _) = memory_store().await;
        watch_all(&store, &["2330"]).await;

        let listing = store.list();
        watch_all(&store, &["2317"]).await;
        assert_eq!(listing.collect().await.unwrap().len(), 2);

        store.clear_all().await.unwrap();
        assert!(listing.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outage_fails_only_the_in_flight_call() {
        let (store, backend) = memory_store().await;
        watch_all(&store, &SYMBOLS).await;

        backend.set_available(false);
        assert!(store.count().await.unwrap_err().is_unavailable());
        assert!(store.clear_all().await.unwrap_err().is_unavailable());
        assert!(store.list().collect().await.unwrap_err().is_unavailable());

        backend.set_available(true);
        assert_eq!(store.count().await.unwrap(), 3);
        assert_eq!(store.list().collect().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_open_fails_when_storage_is_down() {
        let backend = MemoryDocumentStore::new();
        backend.set_available(false);
        let result = WatchlistStore::open(Arc::new(backend), StoreOptions::default()).await;
        assert!(matches!(result, Err(StoreError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let backend: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let prod = WatchlistStore::open(Arc::clone(&backend), StoreOptions::new("linebot"))
            .await
            .unwrap();
        let staging = WatchlistStore::open(backend, StoreOptions::new("staging"))
            .await
            .unwrap();

        watch_all(&prod, &SYMBOLS).await;
        assert_eq!(staging.count().await.unwrap(), 0);
        assert_eq!(staging.clear_all().await.unwrap(), 0);
        assert_eq!(prod.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated_sqlite() {
        let backend: Arc<dyn DocumentStore> =
            Arc::new(SqliteDocumentStore::connect("sqlite::memory:", 1).await.unwrap());
        let a = WatchlistStore::open(Arc::clone(&backend), StoreOptions::new("line__bot"))
            .await
            .unwrap();
        let b = WatchlistStore::open(
            backend,
            StoreOptions::new("line").with_collection("bot__watchlist"),
        )
        .await
        .unwrap();

        watch_all(&a, &["2330"]).await;
        assert_eq!(b.count().await.unwrap(), 0);
        assert_eq!(b.clear_all().await.unwrap(), 0);
        assert_eq!(a.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_namespace_is_rejected() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let result = WatchlistStore::open(backend, StoreOptions::new("line bot")).await;
        assert!(matches!(result, Err(StoreError::InvalidConfig(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_watch_adds_once() {
        let (store, _) = memory_store().await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.watch("2330", Metadata::new()).await.unwrap()
            }));
        }

        let mut added = 0;
        for handle in handles {
            if handle.await.unwrap().is_added() {
                added += 1;
            }
        }
        assert_eq!(added, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    /// Backend whose count never answers in time
    struct SlowCount(MemoryDocumentStore);

    #[async_trait]
    impl DocumentStore for SlowCount {
        fn find(&self, collection: &CollectionRef) -> DocumentStream {
            self.0.find(collection)
        }

        async fn insert_one(&self, collection: &CollectionRef, doc: Document) -> StoreResult<()> {
            self.0.insert_one(collection, doc).await
        }

        async fn insert_unique(
            &self,
            collection: &CollectionRef,
            key_field: &str,
            doc: Document,
        ) -> StoreResult<bool> {
            self.0.insert_unique(collection, key_field, doc).await
        }

        async fn delete_many(&self, collection: &CollectionRef, filter: &Filter) -> StoreResult<u64> {
            self.0.delete_many(collection, filter).await
        }

        async fn count_documents(&self, collection: &CollectionRef, filter: &Filter) -> StoreResult<u64> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.0.count_documents(collection, filter).await
        }

        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_operation_timeout() {
        let options = StoreOptions::default().with_timeout(Some(Duration::from_millis(20)));
        let store = WatchlistStore::open(Arc::new(SlowCount(MemoryDocumentStore::new())), options)
            .await
            .unwrap();

        let err = store.count().await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));

        // other operations are unaffected
        assert_eq!(store.clear_all().await.unwrap(), 0);
    }
}
