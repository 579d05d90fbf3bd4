//! Watchlist Store
//!
//! The set of stock symbols a bot is tracking, kept in one document
//! collection. Exposes list, count and bulk clear with explicit consistency
//! semantics, plus `watch`/`unwatch` to produce and remove items.

pub mod config;
pub mod document;
pub mod error;
pub mod memory;
pub mod models;
#[cfg(feature = "mongodb")]
pub mod mongo;
pub mod sqlite;
pub mod store;

pub use config::{connect_backend, StoreConfig};
pub use document::{CollectionRef, Document, DocumentStore, DocumentStream, Filter};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryDocumentStore;
pub use models::{ListMode, Metadata, MetadataValue, WatchOutcome, WatchedItem};
#[cfg(feature = "mongodb")]
pub use mongo::MongoDocumentStore;
pub use sqlite::SqliteDocumentStore;
pub use store::{ItemStream, ListOutcome, Listing, StoreOptions, WatchlistStore};
