//! Runs one cleanup end to end.
//!
//! A run moves through fixed phases:
//!
//! ```text
//! Starting -> ResolvingPolicy -> PurgingCollections -> PurgingObjectStore
//!          -> Finalizing -> Completed | Error
//! ```
//!
//! A failing purge phase is recorded and the next phase still runs; the run
//! then finishes with `success = false`. Failing to read the settings or to
//! write status or audit documents aborts the run: an `error` status and an
//! audit entry without counts are written on a best-effort basis and the
//! error is returned.

use std::{sync::Arc, time::Instant};

use thiserror::Error;

use super::{
    collection::CollectionPurger,
    model::{
        AuditLogEntry, AuditedKeyError, DeletedCounts, MAX_AUDITED_KEY_ERRORS,
        ObjectStoreCredentials, RetentionPolicyConfig, RunStatus, RunTrigger, StatusUpdate,
        TriggerKind,
    },
    objects::{ObjectPurgeScope, ObjectStorePurger},
    policy::{Clock, PolicyResolver, RunPolicy, SystemClock},
};
use crate::{
    config::RetentionConfig,
    db::{DbError, DocumentStore},
    object_store::{KeyDeleteError, ObjectStoreConnector},
    observability::metrics,
};

/// Fatal run failures.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to read cleanup settings: {0}")]
    Config(#[source] DbError),

    #[error("failed to write run status: {0}")]
    Status(#[source] DbError),

    #[error("failed to write audit log entry: {0}")]
    Audit(#[source] DbError),
}

/// Phase a run is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    ResolvingPolicy,
    PurgingCollections,
    PurgingObjectStore,
    Finalizing,
    Completed,
    Error,
}

/// What happened to the object storage phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStorePhase {
    Completed,
    Failed,
    SkippedDisabled,
    SkippedMissingCredentials,
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub trigger_kind: TriggerKind,
    pub policy: RunPolicy,
    pub deleted: DeletedCounts,
    pub object_store: ObjectStorePhase,
    /// One message per failed phase.
    pub phase_errors: Vec<String>,
    pub object_key_errors: Vec<KeyDeleteError>,
    pub dry_run: bool,
    pub audit_id: String,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.phase_errors.is_empty()
    }

    /// Phase errors joined into one line, if any.
    pub fn error_summary(&self) -> Option<String> {
        (!self.phase_errors.is_empty()).then(|| self.phase_errors.join("; "))
    }
}

/// Orchestrates the purgers for one run and records the outcome.
pub struct RunCoordinator {
    store: Arc<dyn DocumentStore>,
    connector: Arc<dyn ObjectStoreConnector>,
    config: RetentionConfig,
    resolver: PolicyResolver,
    clock: Arc<dyn Clock>,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        connector: Arc<dyn ObjectStoreConnector>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            resolver: PolicyResolver::new(config.safety.allow_unconditional),
            store,
            connector,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Execute one run.
    pub async fn run(&self, trigger: &RunTrigger) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let kind = trigger.kind();
        let mut settings = None;

        match self.execute(trigger, &mut settings, started).await {
            Ok(report) => {
                let outcome = if report.success() { "success" } else { "partial" };
                metrics::record_retention_run(kind.as_str(), outcome);
                Ok(report)
            }
            Err(err) => {
                self.record_fatal(kind, settings.as_ref(), &err, started)
                    .await;
                metrics::record_retention_run(kind.as_str(), "failed");
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        trigger: &RunTrigger,
        settings_out: &mut Option<RetentionPolicyConfig>,
        started: Instant,
    ) -> Result<RunReport, RunError> {
        let kind = trigger.kind();
        let dry_run = self.config.safety.dry_run;
        let mut state = RunState::Starting;

        tracing::info!(trigger = %kind, dry_run, "Starting cleanup run");
        self.set_status(kind, RunStatus::Starting, format!("Starting {kind} cleanup..."))
            .await?;

        advance(&mut state, RunState::ResolvingPolicy, kind);
        let documents = &self.config.documents;
        let settings_doc = self
            .store
            .get(&documents.config_collection, &documents.settings_doc)
            .await
            .map_err(RunError::Config)?;
        let credentials_doc = self
            .store
            .get(&documents.config_collection, &documents.credentials_doc)
            .await
            .map_err(RunError::Config)?;

        let settings = RetentionPolicyConfig::from_document(settings_doc.as_ref().map(|d| &d.data));
        let credentials =
            ObjectStoreCredentials::from_document(credentials_doc.as_ref().map(|d| &d.data));
        *settings_out = Some(settings.clone());

        let policy = self.resolver.resolve(&settings, trigger, self.clock.now());
        tracing::info!(
            trigger = %kind,
            frequency = %policy.frequency,
            range = %policy.range,
            cutoff = %policy.cutoff,
            unconditional = policy.unconditional,
            include_chats = policy.include_chats,
            include_announcements = policy.include_announcements,
            include_object_storage = policy.include_object_storage,
            "Resolved cleanup policy"
        );

        let mut deleted = DeletedCounts::default();
        let mut phase_errors = Vec::new();

        advance(&mut state, RunState::PurgingCollections, kind);
        if policy.include_chats || policy.include_announcements {
            self.set_status(
                kind,
                RunStatus::Processing,
                "Processing chats and announcements...".into(),
            )
            .await?;
        }

        let purger = CollectionPurger::new(self.store.clone(), &self.config.safety);
        let collections = &self.config.collections;
        for (name, label, noun, collection, enabled, slot) in [
            (
                "chats",
                "Chats",
                "chat messages",
                &collections.chats,
                policy.include_chats,
                &mut deleted.chats,
            ),
            (
                "announcements",
                "Announcements",
                "announcements",
                &collections.announcements,
                policy.include_announcements,
                &mut deleted.announcements,
            ),
        ] {
            if !enabled {
                tracing::debug!(collection = %collection, "Collection purge disabled");
                continue;
            }

            let message = match purger.purge(collection, policy.filter()).await {
                Ok(count) => {
                    *slot = count;
                    if !dry_run {
                        metrics::record_retention_deletion(name, count);
                    }
                    if count > 0 {
                        format!("{label}: deleted {count} {noun}")
                    } else {
                        format!("{label}: no {noun} to delete")
                    }
                }
                Err(e) => {
                    tracing::error!(collection = %collection, error = %e, "Collection purge failed");
                    phase_errors.push(format!("{name}: {e}"));
                    format!("{label}: cleanup failed - {e}")
                }
            };
            self.set_status(kind, RunStatus::Processing, message).await?;
        }

        advance(&mut state, RunState::PurgingObjectStore, kind);
        let mut object_key_errors = Vec::new();
        let object_store = if !policy.include_object_storage {
            self.set_status(
                kind,
                RunStatus::Processing,
                "Object storage: cleanup disabled".into(),
            )
            .await?;
            ObjectStorePhase::SkippedDisabled
        } else if !credentials.has_keys() {
            tracing::warn!("Object storage cleanup enabled but credentials are missing");
            self.set_status(
                kind,
                RunStatus::Processing,
                "Object storage: cleanup enabled but credentials missing".into(),
            )
            .await?;
            ObjectStorePhase::SkippedMissingCredentials
        } else {
            self.set_status(
                kind,
                RunStatus::Processing,
                "Processing object storage cleanup...".into(),
            )
            .await?;

            let (phase, message) = match self.purge_objects(&credentials, &policy).await {
                Ok((count, key_errors)) => {
                    deleted.objects = count;
                    object_key_errors = key_errors;
                    let scope = if policy.unconditional {
                        " (all files cleared)"
                    } else {
                        ""
                    };
                    (
                        ObjectStorePhase::Completed,
                        format!("Object storage: deleted {count} files{scope}"),
                    )
                }
                Err((message, count, key_errors)) => {
                    deleted.objects = count;
                    object_key_errors = key_errors;
                    phase_errors.push(format!("object storage: {message}"));
                    (
                        ObjectStorePhase::Failed,
                        format!("Object storage: cleanup failed - {message}"),
                    )
                }
            };
            if !dry_run {
                metrics::record_retention_deletion("objects", deleted.objects);
            }
            metrics::record_object_key_errors(object_key_errors.len() as u64);
            self.set_status(kind, RunStatus::Processing, message).await?;
            phase
        };

        advance(&mut state, RunState::Finalizing, kind);
        let success = phase_errors.is_empty();
        let headline = if success {
            "Cleanup completed successfully."
        } else {
            "Cleanup completed with some errors."
        };
        let dry_run_note = if dry_run { " (dry run)" } else { "" };
        self.set_status(
            kind,
            RunStatus::Completed,
            format!(
                "{headline} Documents: {} items, object storage: {} files{dry_run_note}",
                deleted.documents(),
                deleted.objects
            ),
        )
        .await?;

        let entry = AuditLogEntry {
            timestamp: self.clock.now(),
            trigger_kind: kind,
            frequency: policy.frequency,
            range: policy.range.clone(),
            deleted_counts: Some(deleted),
            cutoff_date: (!policy.unconditional).then_some(policy.cutoff),
            success,
            error: (!success).then(|| phase_errors.join("; ")),
            config_snapshot: settings.snapshot(),
            object_key_errors: object_key_errors
                .iter()
                .take(MAX_AUDITED_KEY_ERRORS)
                .map(AuditedKeyError::from)
                .collect(),
            dry_run,
            duration_ms: elapsed_ms(started),
        };
        let audit_id = self.append_audit(&entry).await?;

        advance(&mut state, RunState::Completed, kind);
        tracing::info!(
            trigger = %kind,
            chats = deleted.chats,
            announcements = deleted.announcements,
            objects = deleted.objects,
            success,
            dry_run,
            duration_ms = entry.duration_ms,
            "Cleanup run complete"
        );

        Ok(RunReport {
            trigger_kind: kind,
            policy,
            deleted,
            object_store,
            phase_errors,
            object_key_errors,
            dry_run,
            audit_id,
        })
    }

    /// Connect and sweep. On failure returns the message together with the
    /// work completed before it.
    async fn purge_objects(
        &self,
        credentials: &ObjectStoreCredentials,
        policy: &RunPolicy,
    ) -> Result<(u64, Vec<KeyDeleteError>), (String, u64, Vec<KeyDeleteError>)> {
        let store = self.connector.connect(credentials).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to object storage");
            (e.to_string(), 0, Vec::new())
        })?;

        let purger = ObjectStorePurger::new(
            store,
            ObjectPurgeScope::from_config(&self.config.object_store),
            &self.config.object_store,
            self.config.safety.dry_run,
        );

        match purger.purge(policy.filter()).await {
            Ok(report) => Ok((report.deleted, report.key_errors)),
            Err(e) => {
                let message = e.to_string();
                Err((message, e.partial.deleted, e.partial.key_errors))
            }
        }
    }

    async fn set_status(
        &self,
        kind: TriggerKind,
        status: RunStatus,
        message: String,
    ) -> Result<(), RunError> {
        let update = StatusUpdate {
            status,
            message,
            timestamp: self.clock.now(),
            trigger_kind: kind,
        };
        tracing::debug!(trigger = %kind, status = status.as_str(), message = %update.message, "Run status");
        self.store
            .merge(
                &self.config.documents.status_collection,
                kind.status_doc_id(),
                update.to_fields(),
            )
            .await
            .map_err(RunError::Status)
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<String, RunError> {
        let fields = entry
            .to_fields()
            .map_err(|e| RunError::Audit(DbError::Json(e)))?;
        self.store
            .append(&self.config.documents.audit_collection, fields)
            .await
            .map_err(RunError::Audit)
    }

    /// Best-effort `error` status and audit entry for an aborted run.
    async fn record_fatal(
        &self,
        kind: TriggerKind,
        settings: Option<&RetentionPolicyConfig>,
        err: &RunError,
        started: Instant,
    ) {
        tracing::error!(trigger = %kind, state = ?RunState::Error, error = %err, "Cleanup run failed");

        if let Err(e) = self
            .set_status(kind, RunStatus::Error, format!("Cleanup failed: {err}"))
            .await
        {
            tracing::warn!(error = %e, "Could not record failed run status");
        }

        let settings = settings.cloned().unwrap_or_default();
        let entry = AuditLogEntry {
            timestamp: self.clock.now(),
            trigger_kind: kind,
            frequency: settings.frequency,
            range: settings.range_label(),
            deleted_counts: None,
            cutoff_date: None,
            success: false,
            error: Some(err.to_string()),
            config_snapshot: settings.snapshot(),
            object_key_errors: Vec::new(),
            dry_run: self.config.safety.dry_run,
            duration_ms: elapsed_ms(started),
        };
        if let Err(e) = self.append_audit(&entry).await {
            tracing::warn!(error = %e, "Could not record failed run in audit log");
        }
    }
}

fn advance(state: &mut RunState, next: RunState, kind: TriggerKind) {
    tracing::trace!(trigger = %kind, from = ?state, to = ?next, "Run state");
    *state = next;
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
