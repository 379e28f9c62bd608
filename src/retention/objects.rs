//! Sweeps media folders in object storage.

use std::sync::Arc;

use futures::{StreamExt, stream};
use thiserror::Error;

use crate::{
    config::{ObjectStorePurgeConfig, S3_MAX_KEYS_PER_REQUEST},
    db::ExpiryFilter,
    object_store::{KeyDeleteError, ObjectStore, ObjectStoreError},
};

/// Prefixes a purge may touch.
///
/// The protected prefix is removed when the scope is built, so it can never
/// reach a list or delete call. A prefix conflicts with it when it is the
/// same, lies inside it, or encloses it (an enclosing listing would return
/// protected keys).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPurgeScope {
    prefixes: Vec<String>,
    protected_prefix: String,
}

impl ObjectPurgeScope {
    pub fn new<I, S>(prefixes: I, protected_prefix: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let protected_prefix = protected_prefix.into();
        let mut kept: Vec<String> = Vec::new();

        for prefix in prefixes {
            let prefix = prefix.into();
            let conflicts = !protected_prefix.is_empty()
                && (prefix.starts_with(&protected_prefix) || protected_prefix.starts_with(&prefix));
            if conflicts {
                tracing::warn!(
                    prefix = %prefix,
                    protected = %protected_prefix,
                    "Dropping prefix that overlaps the protected prefix"
                );
                continue;
            }
            if !kept.contains(&prefix) {
                kept.push(prefix);
            }
        }

        Self {
            prefixes: kept,
            protected_prefix,
        }
    }

    pub fn from_config(config: &ObjectStorePurgeConfig) -> Self {
        Self::new(config.prefixes.iter().cloned(), config.protected_prefix.clone())
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn protected_prefix(&self) -> &str {
        &self.protected_prefix
    }
}

/// Totals for an object storage sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPurgeReport {
    /// Objects deleted, or in dry-run mode the objects that would be.
    pub deleted: u64,
    pub pages_listed: u64,
    pub delete_batches: u64,
    /// Keys the store refused to delete.
    pub key_errors: Vec<KeyDeleteError>,
}

impl ObjectPurgeReport {
    fn absorb(&mut self, other: ObjectPurgeReport) {
        self.deleted += other.deleted;
        self.pages_listed += other.pages_listed;
        self.delete_batches += other.delete_batches;
        self.key_errors.extend(other.key_errors);
    }
}

/// A prefix whose sweep stopped on a request-level failure.
#[derive(Debug)]
pub struct PrefixFailure {
    pub prefix: String,
    pub error: ObjectStoreError,
}

fn describe_failures(failures: &[PrefixFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.prefix, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// One or more prefixes failed. Work done on the other prefixes, and on the
/// failed ones before they failed, is in `partial`.
#[derive(Debug, Error)]
#[error("object storage sweep failed for {} prefix(es): {}", .failures.len(), describe_failures(.failures))]
pub struct ObjectPurgeError {
    pub failures: Vec<PrefixFailure>,
    pub partial: ObjectPurgeReport,
}

/// Lists each prefix page by page and deletes the selected keys in batches.
pub struct ObjectStorePurger {
    store: Arc<dyn ObjectStore>,
    scope: ObjectPurgeScope,
    page_size: u32,
    delete_batch_size: usize,
    concurrency: usize,
    dry_run: bool,
}

impl ObjectStorePurger {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        scope: ObjectPurgeScope,
        config: &ObjectStorePurgeConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            scope,
            page_size: config.page_size.clamp(1, S3_MAX_KEYS_PER_REQUEST),
            delete_batch_size: config.delete_batch_size.clamp(1, S3_MAX_KEYS_PER_REQUEST) as usize,
            concurrency: config.prefix_concurrency.max(1),
            dry_run,
        }
    }

    /// Sweep every prefix in scope.
    ///
    /// Keys are selected when `filter` matches their last-modified time;
    /// keys without one are only selected by [`ExpiryFilter::All`].
    pub async fn purge(&self, filter: ExpiryFilter) -> Result<ObjectPurgeReport, ObjectPurgeError> {
        let results: Vec<_> = stream::iter(self.scope.prefixes())
            .map(|prefix| self.purge_prefix(prefix, filter))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut report = ObjectPurgeReport::default();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(prefix_report) => report.absorb(prefix_report),
                Err((failure, prefix_report)) => {
                    report.absorb(prefix_report);
                    failures.push(failure);
                }
            }
        }

        for key_error in &report.key_errors {
            tracing::warn!(
                bucket = self.store.bucket(),
                key = %key_error.key,
                code = %key_error.code,
                message = %key_error.message,
                "Object could not be deleted"
            );
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(ObjectPurgeError {
                failures,
                partial: report,
            })
        }
    }

    async fn purge_prefix(
        &self,
        prefix: &str,
        filter: ExpiryFilter,
    ) -> Result<ObjectPurgeReport, (PrefixFailure, ObjectPurgeReport)> {
        let mut report = ObjectPurgeReport::default();
        let mut pending: Vec<String> = Vec::new();
        let mut continuation_token: Option<String> = None;

        let fail = |error: ObjectStoreError, report: ObjectPurgeReport| {
            tracing::error!(prefix, error = %error, "Object storage sweep failed");
            (
                PrefixFailure {
                    prefix: prefix.to_string(),
                    error,
                },
                report,
            )
        };

        loop {
            let page = match self
                .store
                .list_objects(prefix, self.page_size, continuation_token.take())
                .await
            {
                Ok(page) => page,
                Err(e) => return Err(fail(e, report)),
            };
            report.pages_listed += 1;

            pending.extend(
                page.objects
                    .into_iter()
                    .filter(|object| filter.matches(object.last_modified))
                    .map(|object| object.key),
            );

            while pending.len() >= self.delete_batch_size {
                let batch: Vec<String> = pending.drain(..self.delete_batch_size).collect();
                if let Err(e) = self.delete_batch(&batch, &mut report).await {
                    return Err(fail(e, report));
                }
            }

            match page.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        if !pending.is_empty()
            && let Err(e) = self.delete_batch(&pending, &mut report).await
        {
            return Err(fail(e, report));
        }

        tracing::debug!(
            prefix,
            deleted = report.deleted,
            pages = report.pages_listed,
            batches = report.delete_batches,
            dry_run = self.dry_run,
            "Swept prefix"
        );
        Ok(report)
    }

    async fn delete_batch(
        &self,
        keys: &[String],
        report: &mut ObjectPurgeReport,
    ) -> Result<(), ObjectStoreError> {
        if self.dry_run {
            report.deleted += keys.len() as u64;
            return Ok(());
        }

        let outcome = self.store.delete_objects(keys).await?;
        report.deleted += outcome.deleted;
        report.delete_batches += 1;
        report.key_errors.extend(outcome.errors);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::object_store::MemoryObjectStore;

    fn purger(store: Arc<MemoryObjectStore>, prefixes: &[&str], dry_run: bool) -> ObjectStorePurger {
        let config = ObjectStorePurgeConfig {
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        };
        ObjectStorePurger::new(store, ObjectPurgeScope::from_config(&config), &config, dry_run)
    }

    #[test]
    fn test_scope_drops_protected_overlaps() {
        let scope = ObjectPurgeScope::new(
            [
                "images/",
                "currentPageBackgroundImage/",
                "currentPageBackgroundImage/2024/",
                "current",
                "",
                "images/",
                "videos/",
            ],
            "currentPageBackgroundImage/",
        );
        assert_eq!(scope.prefixes(), ["images/", "videos/"]);
    }

    #[tokio::test]
    async fn test_cutoff_selects_strictly_older_objects() {
        let cutoff = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let store = Arc::new(MemoryObjectStore::new("media"));
        store.put("images/old.jpg", Some(cutoff - Duration::days(1)));
        store.put("images/edge.jpg", Some(cutoff));
        store.put("images/new.jpg", Some(cutoff + Duration::days(1)));
        store.put("images/unknown.jpg", None);

        let report = purger(store.clone(), &["images/"], false)
            .purge(ExpiryFilter::Before(cutoff))
            .await
            .unwrap();

        assert_eq!(report.deleted, 1);
        assert!(!store.contains("images/old.jpg"));
        assert!(store.contains("images/edge.jpg"));
        assert!(store.contains("images/unknown.jpg"));
    }

    #[tokio::test]
    async fn test_empty_prefix_is_not_an_error() {
        let store = Arc::new(MemoryObjectStore::new("media"));
        let report = purger(store.clone(), &["pdfs/"], false)
            .purge(ExpiryFilter::All)
            .await
            .unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(report.pages_listed, 1);
        assert_eq!(store.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_key_errors_do_not_abort() {
        let store = Arc::new(MemoryObjectStore::new("media"));
        for i in 0..5 {
            store.put(format!("videos/{i}.mp4"), None);
        }
        store.reject_delete("videos/2.mp4");

        let report = purger(store.clone(), &["videos/"], false)
            .purge(ExpiryFilter::All)
            .await
            .unwrap();
        assert_eq!(report.deleted, 4);
        assert_eq!(report.key_errors.len(), 1);
        assert_eq!(report.key_errors[0].key, "videos/2.mp4");
    }

    #[tokio::test]
    async fn test_failed_prefix_keeps_other_prefixes_going() {
        let store = Arc::new(MemoryObjectStore::new("media"));
        store.put("images/a.jpg", None);
        store.put("videos/a.mp4", None);
        store.put("pdfs/a.pdf", None);
        store.fail_listing("videos/");

        let err = purger(store.clone(), &["images/", "videos/", "pdfs/"], false)
            .purge(ExpiryFilter::All)
            .await
            .unwrap_err();

        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].prefix, "videos/");
        assert_eq!(err.partial.deleted, 2);
        assert!(store.contains("videos/a.mp4"));
        assert!(err.to_string().contains("videos/"));
    }

    #[tokio::test]
    async fn test_dry_run_counts_candidates() {
        let store = Arc::new(MemoryObjectStore::new("media"));
        for i in 0..3 {
            store.put(format!("thumbnails/{i}.png"), None);
        }
        let report = purger(store.clone(), &["thumbnails/"], true)
            .purge(ExpiryFilter::All)
            .await
            .unwrap();
        assert_eq!(report.deleted, 3);
        assert_eq!(report.delete_batches, 0);
        assert_eq!(store.count_under("thumbnails/"), 3);
    }
}
