//! S3-compatible object storage used for uploaded media.
//!
//! Only the two calls the cleanup engine needs are modelled: paginated
//! listing under a prefix and batched deletion. Backends:
//!
//! - **S3**: AWS S3, Cloudflare R2, MinIO via `aws-sdk-s3` (`s3-storage` feature)
//! - **Memory**: process-local map, used by tests and local runs
//!
//! Credentials are stored in the document store and may change between runs,
//! so clients are built per run through an [`ObjectStoreConnector`].

mod memory;
#[cfg(feature = "s3-storage")]
mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use memory::MemoryObjectStore;
#[cfg(feature = "s3-storage")]
pub use s3::{S3Connector, S3ObjectStore};
use thiserror::Error;

use crate::retention::ObjectStoreCredentials;

/// Errors that fail a whole storage request.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object store request failed: {0}")]
    Request(String),

    #[error("Object store configuration error: {0}")]
    Config(String),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// One entry of a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    /// Cursor for the next page; `None` when the listing is complete.
    pub next_continuation_token: Option<String>,
}

/// A key the store refused to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDeleteError {
    pub key: String,
    pub code: String,
    pub message: String,
}

/// Result of a batch delete request that reached the store.
#[derive(Debug, Clone, Default)]
pub struct DeleteOutcome {
    pub deleted: u64,
    pub errors: Vec<KeyDeleteError>,
}

/// Listing and batch deletion over one bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List up to `max_keys` objects under `prefix`, resuming from
    /// `continuation_token` when given.
    async fn list_objects(
        &self,
        prefix: &str,
        max_keys: u32,
        continuation_token: Option<String>,
    ) -> ObjectStoreResult<ListPage>;

    /// Delete up to 1000 keys in one request. Per-key failures are reported
    /// in the outcome rather than as an error.
    async fn delete_objects(&self, keys: &[String]) -> ObjectStoreResult<DeleteOutcome>;

    /// Bucket name for logging.
    fn bucket(&self) -> &str;
}

/// Builds an [`ObjectStore`] client from stored credentials.
#[async_trait]
pub trait ObjectStoreConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &ObjectStoreCredentials,
    ) -> ObjectStoreResult<Arc<dyn ObjectStore>>;
}

/// Connector that always hands out the same client. Used for local runs and
/// tests where credentials only gate whether the phase runs.
pub struct StaticConnector {
    store: Arc<dyn ObjectStore>,
}

impl StaticConnector {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ObjectStoreConnector for StaticConnector {
    async fn connect(
        &self,
        _credentials: &ObjectStoreCredentials,
    ) -> ObjectStoreResult<Arc<dyn ObjectStore>> {
        Ok(self.store.clone())
    }
}

/// Connector used when the binary was built without an object store
/// backend. Every connection attempt fails, which the engine reports as a
/// failed object-store phase.
pub struct UnavailableConnector;

#[async_trait]
impl ObjectStoreConnector for UnavailableConnector {
    async fn connect(
        &self,
        _credentials: &ObjectStoreCredentials,
    ) -> ObjectStoreResult<Arc<dyn ObjectStore>> {
        Err(ObjectStoreError::Config(
            "object storage requires the 's3-storage' feature".into(),
        ))
    }
}

/// The connector for this build.
pub fn default_connector() -> Arc<dyn ObjectStoreConnector> {
    #[cfg(feature = "s3-storage")]
    {
        Arc::new(S3Connector)
    }
    #[cfg(not(feature = "s3-storage"))]
    {
        Arc::new(UnavailableConnector)
    }
}
