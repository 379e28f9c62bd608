use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::instrument;

use super::{
    DbError, DbResult, Document, DocumentStore, ExpiryFilter, Fields, MAX_BATCH_SIZE, timestamp_of,
};

type Collection = BTreeMap<String, Fields>;

/// In-memory document store.
///
/// All operations take a single lock, so every call is atomic with respect
/// to every other call.
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, Collection>>,
    max_batch_size: usize,
    delete_batches: AtomicUsize,
    failing_collections: Mutex<HashSet<String>>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::with_max_batch_size(MAX_BATCH_SIZE)
    }

    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            max_batch_size: max_batch_size.max(1),
            delete_batches: AtomicUsize::new(0),
            failing_collections: Mutex::new(HashSet::new()),
        }
    }

    /// Number of `delete_batch` calls that removed at least one document.
    pub fn delete_batches(&self) -> usize {
        self.delete_batches.load(Ordering::Relaxed)
    }

    /// Number of documents currently in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Make every write to `collection` fail from now on.
    #[cfg(test)]
    pub fn fail_writes_to(&self, collection: &str) {
        self.failing_collections.lock().insert(collection.to_string());
    }

    fn check_writable(&self, collection: &str) -> DbResult<()> {
        if self.failing_collections.lock().contains(collection) {
            return Err(DbError::Internal(format!(
                "writes to '{collection}' are failing"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> DbResult<Option<Document>> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|data| Document {
                id: id.to_string(),
                data: data.clone(),
            }))
    }

    async fn merge(&self, collection: &str, id: &str, fields: Fields) -> DbResult<()> {
        self.check_writable(collection)?;
        let mut collections = self.collections.lock();
        let doc = collections
            .entry(collection.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default();
        doc.extend(fields);
        Ok(())
    }

    async fn append(&self, collection: &str, fields: Fields) -> DbResult<String> {
        self.check_writable(collection)?;
        let id = uuid::Uuid::new_v4().to_string();
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), fields);
        Ok(id)
    }

    async fn merge_unless_set(
        &self,
        collection: &str,
        id: &str,
        guard_field: &str,
        fields: Fields,
    ) -> DbResult<bool> {
        self.check_writable(collection)?;
        let mut collections = self.collections.lock();
        let doc = collections
            .entry(collection.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default();
        if doc.get(guard_field).and_then(|v| v.as_bool()) == Some(true) {
            return Ok(false);
        }
        doc.extend(fields);
        Ok(true)
    }

    async fn list_expired(
        &self,
        collection: &str,
        filter: ExpiryFilter,
        limit: usize,
    ) -> DbResult<Vec<String>> {
        let collections = self.collections.lock();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut matching: Vec<_> = docs
            .iter()
            .map(|(id, data)| (timestamp_of(data), id))
            .filter(|(ts, _)| filter.matches(*ts))
            .collect();
        matching.sort();
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn count_expired(&self, collection: &str, filter: ExpiryFilter) -> DbResult<u64> {
        let collections = self.collections.lock();
        Ok(collections.get(collection).map_or(0, |docs| {
            docs.values()
                .filter(|data| filter.matches(timestamp_of(data)))
                .count() as u64
        }))
    }

    #[instrument(skip(self, ids), fields(batch = ids.len()))]
    async fn delete_batch(&self, collection: &str, ids: &[String]) -> DbResult<u64> {
        if ids.len() > self.max_batch_size {
            return Err(DbError::Validation(format!(
                "batch of {} exceeds the limit of {}",
                ids.len(),
                self.max_batch_size
            )));
        }
        self.check_writable(collection)?;
        let mut collections = self.collections.lock();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let removed = ids.iter().filter(|id| docs.remove(*id).is_some()).count() as u64;
        if removed > 0 {
            self.delete_batches.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn list_recent(&self, collection: &str, limit: usize) -> DbResult<Vec<Document>> {
        let collections = self.collections.lock();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut recent: Vec<_> = docs
            .iter()
            .map(|(id, data)| Document {
                id: id.clone(),
                data: data.clone(),
            })
            .collect();
        recent.sort_by_key(|doc| std::cmp::Reverse(doc.timestamp()));
        recent.truncate(limit);
        Ok(recent)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
