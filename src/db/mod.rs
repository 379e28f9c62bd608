//! Document store abstraction.
//!
//! The cleanup engine works against a small document model: named
//! collections of JSON objects addressed by id, each optionally carrying a
//! `timestamp` field that orders it for retention queries. Backends:
//!
//! - **Memory**: process-local maps, also used as the test fake
//! - **SQLite** / **PostgreSQL**: a single `documents` table via sqlx
//!
//! A handle is created once at startup with [`create_document_store`] and
//! passed explicitly to every component that needs it.

mod error;
mod memory;
#[cfg(feature = "database-postgres")]
pub mod postgres;
#[cfg(feature = "database-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use error::{DbError, DbResult};
pub use memory::MemoryDocumentStore;
use serde_json::{Map, Value};

use crate::config::DatabaseConfig;

/// Field every purgeable document is ordered by.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Largest number of deletes committed in one atomic batch.
pub const MAX_BATCH_SIZE: usize = 500;

/// JSON object body of a document.
pub type Fields = Map<String, Value>;

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Fields,
}

impl Document {
    /// The ordering timestamp, if the document has a readable one.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        timestamp_of(&self.data)
    }
}

/// Which documents a retention query selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryFilter {
    /// Documents whose timestamp is strictly before the cutoff.
    /// Documents without a timestamp are never selected.
    Before(DateTime<Utc>),
    /// Every document in the collection.
    All,
}

impl ExpiryFilter {
    pub fn matches(&self, timestamp: Option<DateTime<Utc>>) -> bool {
        match self {
            ExpiryFilter::All => true,
            ExpiryFilter::Before(cutoff) => timestamp.is_some_and(|ts| ts < *cutoff),
        }
    }
}

/// Storage operations the cleanup engine needs.
///
/// Implementations must be `Send + Sync` to support async contexts.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a single document.
    async fn get(&self, collection: &str, id: &str) -> DbResult<Option<Document>>;

    /// Create the document or merge `fields` into it (top-level keys replace).
    async fn merge(&self, collection: &str, id: &str, fields: Fields) -> DbResult<()>;

    /// Append a new document under a generated id and return the id.
    async fn append(&self, collection: &str, fields: Fields) -> DbResult<String>;

    /// Merge `fields` into the document only if its `guard_field` is not
    /// `true`, as a single atomic step. A missing document is created.
    /// Returns whether the write was applied.
    async fn merge_unless_set(
        &self,
        collection: &str,
        id: &str,
        guard_field: &str,
        fields: Fields,
    ) -> DbResult<bool>;

    /// Ids of up to `limit` documents matching `filter`, oldest first.
    async fn list_expired(
        &self,
        collection: &str,
        filter: ExpiryFilter,
        limit: usize,
    ) -> DbResult<Vec<String>>;

    /// Count of documents matching `filter`.
    async fn count_expired(&self, collection: &str, filter: ExpiryFilter) -> DbResult<u64>;

    /// Delete the given documents atomically. Ids that no longer exist are
    /// ignored. Returns the number of documents removed.
    async fn delete_batch(&self, collection: &str, ids: &[String]) -> DbResult<u64>;

    /// Most recent documents by timestamp, newest first.
    async fn list_recent(&self, collection: &str, limit: usize) -> DbResult<Vec<Document>>;

    /// Largest batch accepted by [`DocumentStore::delete_batch`].
    fn max_batch_size(&self) -> usize {
        MAX_BATCH_SIZE
    }

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}

/// Create a document store from configuration.
pub async fn create_document_store(config: &DatabaseConfig) -> DbResult<Arc<dyn DocumentStore>> {
    match config {
        DatabaseConfig::Memory => {
            tracing::warn!("Using in-memory document store; nothing will persist across restarts");
            Ok(Arc::new(MemoryDocumentStore::new()))
        }
        #[cfg(feature = "database-sqlite")]
        DatabaseConfig::Sqlite(cfg) => Ok(Arc::new(sqlite::SqliteDocumentStore::connect(cfg).await?)),
        #[cfg(feature = "database-postgres")]
        DatabaseConfig::Postgres(cfg) => {
            Ok(Arc::new(postgres::PostgresDocumentStore::connect(cfg).await?))
        }
    }
}

/// Read the ordering timestamp of a document body.
///
/// Accepts RFC 3339 strings, epoch milliseconds, and exported Firestore
/// timestamps (`{"_seconds": .., "_nanoseconds": ..}`).
pub fn timestamp_of(data: &Fields) -> Option<DateTime<Utc>> {
    match data.get(TIMESTAMP_FIELD)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => DateTime::from_timestamp_millis(n.as_i64()?),
        Value::Object(o) => {
            let secs = o.get("_seconds")?.as_i64()?;
            let nanos = o
                .get("_nanoseconds")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0);
            DateTime::from_timestamp(secs, nanos)
        }
        _ => None,
    }
}

/// Encode a timestamp the way documents store it.
pub fn timestamp_value(ts: DateTime<Utc>) -> Value {
    Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}
