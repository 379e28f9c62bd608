//! Admission of manual runs.
//!
//! A manual run is requested by writing the trigger document from the admin
//! app. Each observed write is evaluated against the previous contents; an
//! admitted write is then claimed by atomically setting `processing` on the
//! document, and only the caller holding the resulting [`ManualClaim`] may
//! start the run. Completing the claim clears `processing` again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use super::model::{ManualTrigger, RunTrigger};
use crate::{
    config::DocumentLocations,
    db::{DbError, DocumentStore, Fields, timestamp_value},
};

const PROCESSING_FIELD: &str = "processing";

/// Errors raised while admitting or completing a manual run.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// The claim could not be written; the run must not start.
    #[error("failed to claim manual trigger: {0}")]
    Claim(#[source] DbError),

    #[error("trigger document store error: {0}")]
    Store(#[from] DbError),
}

/// Why a trigger write did not start a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Neither `triggerRequested` nor `includeObjectStorage` became true.
    NoTriggerTransition,
    /// A run is already in progress.
    AlreadyProcessing,
    /// Another claimant set `processing` first.
    LostClaim,
    /// The trigger document was removed.
    DocumentDeleted,
}

/// A write to the trigger document, as before/after snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerWrite {
    pub before: Option<Fields>,
    pub after: Option<Fields>,
}

/// Outcome of [`TriggerGate::admit`].
#[derive(Debug)]
pub enum Admission {
    Admitted(ManualClaim),
    Rejected(RejectReason),
}

/// Proof that `processing` was set by this caller. Consumed by
/// [`TriggerGate::complete`].
#[derive(Debug)]
#[must_use = "a claim must be completed or the trigger stays locked"]
pub struct ManualClaim {
    trigger: ManualTrigger,
    claimed_at: DateTime<Utc>,
}

impl ManualClaim {
    pub fn trigger(&self) -> &ManualTrigger {
        &self.trigger
    }

    pub fn claimed_at(&self) -> DateTime<Utc> {
        self.claimed_at
    }

    pub fn run_trigger(&self) -> RunTrigger {
        RunTrigger::Manual(self.trigger.clone())
    }
}

/// Guards the manual trigger document.
pub struct TriggerGate {
    store: Arc<dyn DocumentStore>,
    collection: String,
    doc_id: String,
}

impl TriggerGate {
    pub fn new(store: Arc<dyn DocumentStore>, documents: &DocumentLocations) -> Self {
        Self {
            store,
            collection: documents.config_collection.clone(),
            doc_id: documents.trigger_doc.clone(),
        }
    }

    /// Decide whether a write asks for a run, looking only at the snapshots.
    pub fn evaluate(before: Option<&Fields>, after: Option<&Fields>) -> Result<(), RejectReason> {
        let Some(after) = after else {
            return Err(RejectReason::DocumentDeleted);
        };
        let previous = ManualTrigger::from_document(before);
        let current = ManualTrigger::from_document(Some(after));

        let requested = current.trigger_requested && !previous.trigger_requested;
        let storage_enabled = current.include_object_storage && !previous.include_object_storage;
        if !(requested || storage_enabled) {
            return Err(RejectReason::NoTriggerTransition);
        }
        if current.processing {
            return Err(RejectReason::AlreadyProcessing);
        }
        Ok(())
    }

    /// Evaluate a write and, if it asks for a run, claim the trigger.
    ///
    /// Fails closed: when the claim cannot be written the error is returned
    /// and no run may start.
    pub async fn admit(
        &self,
        write: &TriggerWrite,
        now: DateTime<Utc>,
    ) -> Result<Admission, TriggerError> {
        if let Err(reason) = Self::evaluate(write.before.as_ref(), write.after.as_ref()) {
            tracing::debug!(reason = ?reason, "Trigger write not admitted");
            return Ok(Admission::Rejected(reason));
        }

        let mut claim = Fields::new();
        claim.insert(PROCESSING_FIELD.into(), Value::Bool(true));
        claim.insert("triggerRequested".into(), Value::Bool(false));
        if write
            .after
            .as_ref()
            .is_some_and(|after| after.contains_key("triggerCleanup"))
        {
            claim.insert("triggerCleanup".into(), Value::Bool(false));
        }
        claim.insert("startedAt".into(), timestamp_value(now));

        let applied = self
            .store
            .merge_unless_set(&self.collection, &self.doc_id, PROCESSING_FIELD, claim)
            .await
            .map_err(TriggerError::Claim)?;

        if !applied {
            tracing::info!("Manual trigger already claimed; skipping");
            return Ok(Admission::Rejected(RejectReason::LostClaim));
        }

        tracing::info!("Manual cleanup trigger admitted");
        Ok(Admission::Admitted(ManualClaim {
            trigger: ManualTrigger::from_document(write.after.as_ref()),
            claimed_at: now,
        }))
    }

    /// Release the claim and record the outcome on the trigger document.
    pub async fn complete(
        &self,
        claim: ManualClaim,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), TriggerError> {
        let mut fields = Fields::new();
        fields.insert(PROCESSING_FIELD.into(), Value::Bool(false));
        fields.insert("completedAt".into(), timestamp_value(now));
        fields.insert(
            "lastResult".into(),
            Value::from(if error.is_some() { "error" } else { "success" }),
        );
        fields.insert(
            "lastError".into(),
            error.map_or(Value::Null, Value::from),
        );

        self.store
            .merge(&self.collection, &self.doc_id, fields)
            .await?;

        tracing::debug!(
            held_ms = (now - claim.claimed_at).num_milliseconds(),
            "Manual trigger released"
        );
        Ok(())
    }

    /// Request a manual run the way the admin app does.
    pub async fn request(
        &self,
        include_object_storage: bool,
        full_reset: bool,
        now: DateTime<Utc>,
    ) -> Result<(), TriggerError> {
        let mut fields = Fields::new();
        fields.insert("triggerRequested".into(), Value::Bool(true));
        fields.insert(
            "includeObjectStorage".into(),
            Value::Bool(include_object_storage),
        );
        fields.insert("fullReset".into(), Value::Bool(full_reset));
        fields.insert("timestamp".into(), timestamp_value(now));

        self.store
            .merge(&self.collection, &self.doc_id, fields)
            .await?;
        Ok(())
    }

    /// Current contents of the trigger document.
    pub async fn snapshot(&self) -> Result<Option<Fields>, TriggerError> {
        Ok(self
            .store
            .get(&self.collection, &self.doc_id)
            .await?
            .map(|doc| doc.data))
    }
}
