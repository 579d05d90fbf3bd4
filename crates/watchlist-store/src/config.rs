use std::sync::Arc;
use std::time::Duration;

use crate::document::DocumentStore;
use crate::error::{StoreError, StoreResult};
use crate::memory::MemoryDocumentStore;
use crate::models::ListMode;
use crate::sqlite::SqliteDocumentStore;
use crate::store::{
    StoreOptions, WatchlistStore, DEFAULT_COLLECTION, DEFAULT_NAMESPACE, DEFAULT_OP_TIMEOUT,
};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:watchlist.db";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Connection and store settings, usually read from the environment
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// `sqlite:<path>`, `sqlite::memory:`, `memory:` or `mongodb://...`
    pub database_url: String,
    pub namespace: String,
    pub collection: String,
    pub op_timeout: Option<Duration>,
    pub list_mode: ListMode,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            op_timeout: Some(DEFAULT_OP_TIMEOUT),
            list_mode: ListMode::Lenient,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl StoreConfig {
    /// Read `WATCHLIST_*` variables, falling back to defaults for anything unset
    pub fn from_env() -> StoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> StoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("WATCHLIST_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(namespace) = lookup("WATCHLIST_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(collection) = lookup("WATCHLIST_COLLECTION") {
            config.collection = collection;
        }
        if let Some(raw) = lookup("WATCHLIST_OP_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                StoreError::InvalidConfig(format!("WATCHLIST_OP_TIMEOUT_SECS '{}' is not a number", raw))
            })?;
            config.op_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(raw) = lookup("WATCHLIST_STRICT_LIST") {
            config.list_mode = if parse_flag(&raw)? {
                ListMode::Strict
            } else {
                ListMode::Lenient
            };
        }
        if let Some(raw) = lookup("WATCHLIST_MAX_CONNECTIONS") {
            config.max_connections = raw.trim().parse().map_err(|_| {
                StoreError::InvalidConfig(format!("WATCHLIST_MAX_CONNECTIONS '{}' is not a number", raw))
            })?;
        }

        Ok(config)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions::new(&self.namespace)
            .with_collection(&self.collection)
            .with_timeout(self.op_timeout)
            .with_list_mode(self.list_mode)
    }

    /// Connect the configured backend and open the store on it
    pub async fn open(&self) -> StoreResult<WatchlistStore> {
        let backend = connect_backend(&self.database_url, self.max_connections).await?;
        WatchlistStore::open(backend, self.store_options()).await
    }
}

fn parse_flag(raw: &str) -> StoreResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(StoreError::InvalidConfig(format!(
            "'{}' is not a boolean",
            other
        ))),
    }
}

/// Pick a backend from the URL scheme
pub async fn connect_backend(
    database_url: &str,
    max_connections: u32,
) -> StoreResult<Arc<dyn DocumentStore>> {
    if database_url == "memory:" || database_url == "memory" {
        return Ok(Arc::new(MemoryDocumentStore::new()));
    }

    if database_url.starts_with("sqlite:") {
        let store = SqliteDocumentStore::connect(database_url, max_connections).await?;
        return Ok(Arc::new(store));
    }

    if database_url.starts_with("mongodb://") || database_url.starts_with("mongodb+srv://") {
        return connect_mongo(database_url).await;
    }

    Err(StoreError::InvalidConfig(format!(
        "unsupported database url '{}'",
        database_url
    )))
}

#[cfg(feature = "mongodb")]
async fn connect_mongo(database_url: &str) -> StoreResult<Arc<dyn DocumentStore>> {
    let store = crate::mongo::MongoDocumentStore::connect(database_url).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "mongodb"))]
async fn connect_mongo(_database_url: &str) -> StoreResult<Arc<dyn DocumentStore>> {
    Err(StoreError::InvalidConfig(
        "built without the `mongodb` feature".to_string(),
    ))
}
