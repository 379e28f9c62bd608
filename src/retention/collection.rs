//! Batched deletion of expired documents from one collection.

use std::sync::Arc;

use crate::{
    config::RetentionSafety,
    db::{DbResult, DocumentStore, ExpiryFilter},
};

/// Deletes expired documents in atomic batches.
///
/// Batches are not atomic with each other. A purge interrupted halfway is
/// resumed by running it again: each batch re-selects only what is still
/// expired.
pub struct CollectionPurger {
    store: Arc<dyn DocumentStore>,
    batch_size: usize,
    dry_run: bool,
}

impl CollectionPurger {
    pub fn new(store: Arc<dyn DocumentStore>, safety: &RetentionSafety) -> Self {
        let batch_size = (safety.batch_size as usize)
            .min(store.max_batch_size())
            .max(1);
        Self {
            store,
            batch_size,
            dry_run: safety.dry_run,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Delete every document in `collection` matched by `filter` and return
    /// how many were removed. In dry-run mode nothing is deleted and the
    /// number of matching documents is returned instead.
    pub async fn purge(&self, collection: &str, filter: ExpiryFilter) -> DbResult<u64> {
        if self.dry_run {
            let matching = self.store.count_expired(collection, filter).await?;
            tracing::info!(
                collection,
                matching,
                filter = ?filter,
                "DRY RUN: Would delete {} documents",
                matching
            );
            return Ok(matching);
        }

        let mut total_deleted: u64 = 0;
        let mut batches: u64 = 0;

        loop {
            let ids = self
                .store
                .list_expired(collection, filter, self.batch_size)
                .await?;
            if ids.is_empty() {
                break;
            }

            let removed = self.store.delete_batch(collection, &ids).await?;
            total_deleted += removed;
            batches += 1;

            tracing::trace!(collection, batch = batches, removed, "Deleted batch");

            // A short page means the selection is exhausted; a page that
            // deleted nothing would be selected again forever.
            if ids.len() < self.batch_size || removed == 0 {
                break;
            }
        }

        if total_deleted > 0 {
            tracing::debug!(
                collection,
                deleted = total_deleted,
                batches,
                "Deleted expired documents"
            );
        }

        Ok(total_deleted)
    }
}
