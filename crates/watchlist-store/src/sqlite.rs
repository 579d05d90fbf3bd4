//! SQLite-backed document store.
//!
//! Each `(namespace, collection)` pair maps to one table holding documents
//! as JSON text. The key field is projected into a generated `doc_key`
//! column with a UNIQUE index, so every insert path is checked by SQLite
//! itself. Rows whose key is missing or not a string get a NULL key and are
//! not constrained.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions,
};
use sqlx::Row;
use std::str::FromStr;

use crate::document::{CollectionRef, Document, DocumentStore, DocumentStream, Filter};
use crate::error::{StoreError, StoreResult};

#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    /// Open a pool for `database_url` (e.g. `sqlite:watchlist.db`), creating the file if needed
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let in_memory = database_url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives and dies with its connection, so pin exactly one
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .connect_with(options)
                .await?
        };

        tracing::debug!("Connected to {}", database_url);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// Both parts are validated identifiers, which never contain '.'
fn table_name(collection: &CollectionRef) -> String {
    format!("\"{}.{}\"", collection.namespace, collection.name)
}

fn key_index_name(collection: &CollectionRef) -> String {
    format!("\"{}.{}.doc_key\"", collection.namespace, collection.name)
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', ""))
}

/// Expression for the generated key column. Corrupt bodies and non-string
/// keys yield NULL instead of failing the insert.
fn key_expression(key_field: &str) -> String {
    let path = json_path(key_field).replace('\'', "''");
    format!(
        "CASE WHEN json_valid(body) THEN \
         CASE json_type(body, '{path}') WHEN 'text' THEN json_extract(body, '{path}') END \
         END",
        path = path
    )
}

fn where_clause(filter: &Filter) -> StoreResult<String> {
    if filter.is_empty() {
        return Ok(String::new());
    }

    let mut parts = Vec::with_capacity(filter.fields().len());
    for (field, value) in filter.fields() {
        match value {
            serde_json::Value::Null => parts.push("json_type(body, ?) = 'null'"),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                return Err(StoreError::Backend(format!(
                    "filter on '{}' must compare a scalar",
                    field
                )))
            }
            _ => parts.push("json_extract(body, ?) = ?"),
        }
    }
    Ok(format!(" WHERE {}", parts.join(" AND ")))
}

fn bind_filter<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    filter: &Filter,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for (field, value) in filter.fields() {
        query = query.bind(json_path(field));
        query = match value {
            serde_json::Value::Null => query,
            serde_json::Value::Bool(b) => query.bind(i64::from(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => query.bind(s.clone()),
            // rejected by where_clause
            _ => query,
        };
    }
    query
}

fn parse_body(body: &str) -> StoreResult<Document> {
    serde_json::from_str::<Document>(body)
        .map_err(|e| StoreError::InvalidItem(format!("corrupt document body: {}", e)))
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn ensure_collection(&self, collection: &CollectionRef, key_field: &str) -> StoreResult<()> {
        let table = table_name(collection);
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                body TEXT NOT NULL,
                doc_key TEXT GENERATED ALWAYS AS ({}) VIRTUAL
            )
            "#,
            table,
            key_expression(key_field)
        );
        let create_index = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} (doc_key)",
            key_index_name(collection),
            table
        );

        sqlx::query(&create_table).execute(&self.pool).await?;
        sqlx::query(&create_index).execute(&self.pool).await?;
        Ok(())
    }

    fn find(&self, collection: &CollectionRef) -> DocumentStream {
        let pool = self.pool.clone();
        let sql = format!("SELECT body FROM {} ORDER BY id", table_name(collection));

        // One SELECT per stream, so every listing reads a single snapshot
        stream::once(async move {
            let rows: Vec<(String,)> = sqlx::query_as(&sql).fetch_all(&pool).await?;
            Ok::<_, StoreError>(stream::iter(
                rows.into_iter().map(|(body,)| parse_body(&body)),
            ))
        })
        .try_flatten()
        .boxed()
    }

    async fn insert_one(&self, collection: &CollectionRef, doc: Document) -> StoreResult<()> {
        let sql = format!("INSERT INTO {} (body) VALUES (?)", table_name(collection));
        let body = serde_json::to_string(&doc)?;
        sqlx::query(&sql).bind(body).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_unique(
        &self,
        collection: &CollectionRef,
        key_field: &str,
        doc: Document,
    ) -> StoreResult<bool> {
        // The generated column only constrains string keys
        if !matches!(doc.get(key_field), Some(serde_json::Value::String(_))) {
            return Err(StoreError::InvalidItem(format!(
                "document has no string '{}' key",
                key_field
            )));
        }

        let sql = format!(
            "INSERT INTO {} (body) VALUES (?) ON CONFLICT DO NOTHING",
            table_name(collection)
        );
        let body = serde_json::to_string(&doc)?;
        let result = sqlx::query(&sql)
            .bind(body)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_many(&self, collection: &CollectionRef, filter: &Filter) -> StoreResult<u64> {
        let sql = format!("DELETE FROM {}{}", table_name(collection), where_clause(filter)?);
        let result = bind_filter(sqlx::query(&sql), filter)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_documents(&self, collection: &CollectionRef, filter: &Filter) -> StoreResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            table_name(collection),
            where_clause(filter)?
        );
        let row = bind_filter(sqlx::query(&sql), filter)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
