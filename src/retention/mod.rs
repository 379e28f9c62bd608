//! Retention cleanup engine.
//!
//! Purges expired chat messages and announcements from the document store
//! and expired media from object storage, under a policy administered from
//! the mobile app. Runs are started either on a schedule or by writing the
//! manual trigger document; see [`worker`] for how both are hosted.
//!
//! Every run writes live progress to a status document for its trigger kind
//! and appends exactly one entry to the audit log. All deletions are batched
//! and idempotent, so an interrupted run is recovered by running it again.

mod collection;
mod coordinator;
mod model;
mod objects;
mod policy;
mod trigger;
pub mod worker;

pub use collection::CollectionPurger;
pub use coordinator::{ObjectStorePhase, RunCoordinator, RunError, RunReport, RunState};
pub use model::{
    AuditLogEntry, AuditedKeyError, DeletedCounts, Frequency, MAX_AUDITED_KEY_ERRORS,
    MAX_CUSTOM_DAYS, ManualTrigger, ObjectStoreCredentials, RetentionPolicyConfig, RunStatus,
    RunTrigger, StatusUpdate, TriggerKind,
};
pub use objects::{
    ObjectPurgeError, ObjectPurgeReport, ObjectPurgeScope, ObjectStorePurger, PrefixFailure,
};
pub use policy::{Clock, FixedClock, PolicyResolver, RunPolicy, SystemClock};
pub use trigger::{Admission, ManualClaim, RejectReason, TriggerError, TriggerGate, TriggerWrite};
pub use worker::start_retention_worker;
