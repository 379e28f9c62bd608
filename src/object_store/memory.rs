use std::{
    collections::{BTreeMap, HashSet},
    ops::Bound,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    DeleteOutcome, KeyDeleteError, ListPage, ObjectStore, ObjectStoreError, ObjectStoreResult,
    ObjectSummary,
};
use crate::config::S3_MAX_KEYS_PER_REQUEST;

/// In-memory bucket.
///
/// Continuation tokens are the last key of the previous page, so listing
/// stays consistent while the caller deletes keys it has already seen.
/// Call counters and failure switches make it usable as a test double.
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, Option<DateTime<Utc>>>>,
    list_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    listed_prefixes: Mutex<Vec<String>>,
    failing_prefixes: Mutex<HashSet<String>>,
    undeletable_keys: Mutex<HashSet<String>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(BTreeMap::new()),
            list_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            listed_prefixes: Mutex::new(Vec::new()),
            failing_prefixes: Mutex::new(HashSet::new()),
            undeletable_keys: Mutex::new(HashSet::new()),
        }
    }

    pub fn put(&self, key: impl Into<String>, last_modified: Option<DateTime<Utc>>) {
        self.objects.lock().insert(key.into(), last_modified);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    /// Number of stored keys under `prefix`.
    pub fn count_under(&self, prefix: &str) -> usize {
        self.objects
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .count()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::Relaxed)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::Relaxed)
    }

    /// Every prefix passed to `list_objects`, in call order.
    pub fn listed_prefixes(&self) -> Vec<String> {
        self.listed_prefixes.lock().clone()
    }

    /// Make every listing under `prefix` fail at the request level.
    pub fn fail_listing(&self, prefix: impl Into<String>) {
        self.failing_prefixes.lock().insert(prefix.into());
    }

    /// Make deletes of `key` come back as a per-key error.
    pub fn reject_delete(&self, key: impl Into<String>) {
        self.undeletable_keys.lock().insert(key.into());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_objects(
        &self,
        prefix: &str,
        max_keys: u32,
        continuation_token: Option<String>,
    ) -> ObjectStoreResult<ListPage> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        self.listed_prefixes.lock().push(prefix.to_string());

        if self.failing_prefixes.lock().contains(prefix) {
            return Err(ObjectStoreError::Request(format!(
                "ListObjectsV2 failed for prefix '{prefix}'"
            )));
        }

        let max_keys = max_keys.clamp(1, S3_MAX_KEYS_PER_REQUEST) as usize;
        let objects = self.objects.lock();
        let lower = match &continuation_token {
            Some(token) => Bound::Excluded(token.clone()),
            None => Bound::Included(prefix.to_string()),
        };

        let mut matching = objects
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix));

        let page: Vec<ObjectSummary> = matching
            .by_ref()
            .take(max_keys)
            .map(|(key, last_modified)| ObjectSummary {
                key: key.clone(),
                last_modified: *last_modified,
            })
            .collect();

        let truncated = matching.next().is_some();
        let next_continuation_token = if truncated {
            page.last().map(|object| object.key.clone())
        } else {
            None
        };

        Ok(ListPage {
            objects: page,
            next_continuation_token,
        })
    }

    async fn delete_objects(&self, keys: &[String]) -> ObjectStoreResult<DeleteOutcome> {
        if keys.len() > S3_MAX_KEYS_PER_REQUEST as usize {
            return Err(ObjectStoreError::Request(format!(
                "DeleteObjects accepts at most {S3_MAX_KEYS_PER_REQUEST} keys, got {}",
                keys.len()
            )));
        }
        self.delete_calls.fetch_add(1, Ordering::Relaxed);

        let undeletable = self.undeletable_keys.lock();
        let mut objects = self.objects.lock();
        let mut outcome = DeleteOutcome::default();
        for key in keys {
            if undeletable.contains(key) {
                outcome.errors.push(KeyDeleteError {
                    key: key.clone(),
                    code: "AccessDenied".to_string(),
                    message: "Access Denied".to_string(),
                });
                continue;
            }
            // S3 reports missing keys as deleted.
            objects.remove(key);
            outcome.deleted += 1;
        }
        Ok(outcome)
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(count: usize, prefix: &str) -> MemoryObjectStore {
        let store = MemoryObjectStore::new("test-bucket");
        for i in 0..count {
            store.put(format!("{prefix}{i:05}.jpg"), None);
        }
        store
    }

    #[tokio::test]
    async fn test_listing_paginates_within_prefix() {
        let store = seeded(5, "images/");
        store.put("videos/a.mp4", None);

        let first = store.list_objects("images/", 3, None).await.unwrap();
        assert_eq!(first.objects.len(), 3);
        let token = first.next_continuation_token.clone();
        assert!(token.is_some());

        let second = store.list_objects("images/", 3, token).await.unwrap();
        assert_eq!(second.objects.len(), 2);
        assert!(second.next_continuation_token.is_none());
        assert!(second.objects.iter().all(|o| o.key.starts_with("images/")));
    }

    #[tokio::test]
    async fn test_listing_exact_page_has_no_cursor() {
        let store = seeded(3, "pdfs/");
        let page = store.list_objects("pdfs/", 3, None).await.unwrap();
        assert_eq!(page.objects.len(), 3);
        assert!(page.next_continuation_token.is_none());
    }

    #[tokio::test]
    async fn test_delete_reports_rejected_keys() {
        let store = seeded(2, "documents/");
        store.reject_delete("documents/00001.jpg");

        let outcome = store
            .delete_objects(&["documents/00000.jpg".into(), "documents/00001.jpg".into()])
            .await
            .unwrap();
        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(store.contains("documents/00001.jpg"));
    }

    #[tokio::test]
    async fn test_oversized_delete_rejected() {
        let store = MemoryObjectStore::new("test-bucket");
        let keys: Vec<String> = (0..1001).map(|i| i.to_string()).collect();
        assert!(store.delete_objects(&keys).await.is_err());
    }
}
