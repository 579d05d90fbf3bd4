//! MongoDB-backed document store (enabled with the `mongodb` feature).

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use mongodb::bson::{self, doc, Bson};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};

use crate::document::{CollectionRef, Document, DocumentStore, DocumentStream, Filter};
use crate::error::{StoreError, StoreResult};

const DUPLICATE_KEY: i32 = 11000;

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        match *err.kind {
            ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::Shutdown => StoreError::StorageUnavailable(err.to_string()),
            ErrorKind::InvalidArgument { .. } => StoreError::InvalidConfig(err.to_string()),
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        &*err.kind,
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY
    )
}

fn to_bson(doc: &Document) -> StoreResult<bson::Document> {
    bson::to_document(doc).map_err(|e| StoreError::Backend(format!("bson encode: {}", e)))
}

fn from_bson(doc: bson::Document) -> StoreResult<Document> {
    match Bson::Document(doc).into_relaxed_extjson() {
        serde_json::Value::Object(mut map) => {
            map.remove("_id");
            Ok(map)
        }
        _ => Err(StoreError::InvalidItem("document is not an object".to_string())),
    }
}

fn filter_to_bson(filter: &Filter) -> StoreResult<bson::Document> {
    let mut out = bson::Document::new();
    for (field, value) in filter.fields() {
        let value = bson::to_bson(value).map_err(|e| StoreError::Backend(e.to_string()))?;
        out.insert(field.clone(), value);
    }
    Ok(out)
}

/// Unique index on `key_field`, limited to documents where it is a string.
/// Rows written before the field existed stay out of the index.
fn unique_key_index(key_field: &str) -> IndexModel {
    let mut keys = bson::Document::new();
    keys.insert(key_field, 1);

    let mut partial = bson::Document::new();
    partial.insert(key_field, doc! { "$exists": true, "$type": "string" });

    IndexModel::builder()
        .keys(keys)
        .options(
            IndexOptions::builder()
                .unique(true)
                .partial_filter_expression(partial)
                .build(),
        )
        .build()
}

#[derive(Clone)]
pub struct MongoDocumentStore {
    client: Client,
}

impl MongoDocumentStore {
    pub async fn connect(uri: &str) -> StoreResult<Self> {
        let client = Client::with_uri_str(uri).await?;
        tracing::debug!("MongoDB client created");
        Ok(Self { client })
    }

    fn collection(&self, collection: &CollectionRef) -> Collection<bson::Document> {
        self.client
            .database(&collection.namespace)
            .collection(&collection.name)
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn ensure_collection(&self, collection: &CollectionRef, key_field: &str) -> StoreResult<()> {
        self.collection(collection)
            .create_index(unique_key_index(key_field))
            .await?;
        Ok(())
    }

    fn find(&self, collection: &CollectionRef) -> DocumentStream {
        let coll = self.collection(collection);

        stream::once(async move {
            let cursor = coll.find(doc! {}).await?;
            Ok::<_, StoreError>(
                cursor
                    .map_err(StoreError::from)
                    .and_then(|doc| async move { from_bson(doc) }),
            )
        })
        .try_flatten()
        .boxed()
    }

    async fn insert_one(&self, collection: &CollectionRef, doc: Document) -> StoreResult<()> {
        self.collection(collection).insert_one(to_bson(&doc)?).await?;
        Ok(())
    }

    async fn insert_unique(
        &self,
        collection: &CollectionRef,
        _key_field: &str,
        doc: Document,
    ) -> StoreResult<bool> {
        // The unique index from ensure_collection does the enforcement
        match self.collection(collection).insert_one(to_bson(&doc)?).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_many(&self, collection: &CollectionRef, filter: &Filter) -> StoreResult<u64> {
        let result = self
            .collection(collection)
            .delete_many(filter_to_bson(filter)?)
            .await?;
        Ok(result.deleted_count)
    }

    async fn count_documents(&self, collection: &CollectionRef, filter: &Filter) -> StoreResult<u64> {
        let count = self
            .collection(collection)
            .count_documents(filter_to_bson(filter)?)
            .await?;
        Ok(count)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }

    fn backend_name(&self) -> &'static str {
        "mongodb"
    }
}
