//! Documents the cleanup engine reads and writes.
//!
//! Field names on the wire are camelCase because the same documents are
//! edited by the admin screens of the mobile app. Everything read from the
//! store is parsed leniently: a missing or mistyped field falls back to its
//! default instead of failing the run.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::{
    db::{Fields, timestamp_of, timestamp_value},
    object_store::KeyDeleteError,
};

/// Maximum number of per-key delete failures copied into an audit entry.
pub const MAX_AUDITED_KEY_ERRORS: usize = 50;

/// Longest custom retention window, in days.
pub const MAX_CUSTOM_DAYS: u32 = 36_500;

fn bool_field(fields: &Fields, key: &str) -> Option<bool> {
    fields.get(key).and_then(Value::as_bool)
}

fn str_field(fields: &Fields, key: &str) -> Option<String> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Accepts both numbers and numeric strings; the admin form has stored both.
fn u32_field(fields: &Fields, key: &str) -> Option<u32> {
    match fields.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// How far back a run reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[default]
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl Frequency {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Custom => "custom",
        }
    }

    /// Age beyond which records are eligible. `custom_days` is clamped to
    /// `1..=MAX_CUSTOM_DAYS`.
    pub fn window(&self, custom_days: u32) -> Duration {
        match self {
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::days(7),
            Self::Monthly => Duration::days(30),
            Self::Custom => {
                Duration::days(i64::from(custom_days.clamp(1, MAX_CUSTOM_DAYS)))
            }
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retention policy administered from the app (`app_config/cleanup_settings`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicyConfig {
    pub frequency: Frequency,
    /// Legacy `range` value as stored, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    pub custom_days: u32,
    pub include_chats: bool,
    pub include_announcements: bool,
    pub include_object_storage: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<String>,
}

impl Default for RetentionPolicyConfig {
    fn default() -> Self {
        Self {
            frequency: Frequency::Daily,
            range: None,
            custom_days: 1,
            include_chats: true,
            include_announcements: true,
            include_object_storage: true,
            scheduled_time: None,
        }
    }
}

impl RetentionPolicyConfig {
    /// Parse the settings document; a missing document yields the defaults.
    pub fn from_document(fields: Option<&Fields>) -> Self {
        let Some(fields) = fields else {
            return Self::default();
        };

        let range = str_field(fields, "range");
        let frequency = str_field(fields, "frequency")
            .and_then(|f| Frequency::parse(&f))
            .or_else(|| range.as_deref().and_then(Frequency::parse))
            .unwrap_or_default();

        let firebase = bool_field(fields, "includeFirebase").unwrap_or(true);
        let include_object_storage = bool_field(fields, "includeObjectStorage")
            .or_else(|| bool_field(fields, "includeR2Storage"))
            .unwrap_or(true);

        Self {
            frequency,
            range,
            custom_days: u32_field(fields, "customDays")
                .unwrap_or(1)
                .clamp(1, MAX_CUSTOM_DAYS),
            include_chats: firebase && bool_field(fields, "includeChats").unwrap_or(true),
            include_announcements: firebase
                && bool_field(fields, "includeAnnouncements").unwrap_or(true),
            include_object_storage,
            scheduled_time: str_field(fields, "scheduledTime"),
        }
    }

    /// Label recorded as `range` in audit entries.
    pub fn range_label(&self) -> String {
        self.range
            .clone()
            .unwrap_or_else(|| self.frequency.as_str().to_string())
    }

    /// The resolved settings as stored in `configSnapshot`.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Object storage credentials (`app_config/r2_settings`).
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ObjectStoreCredentials {
    pub endpoint: Option<String>,
    pub account_id: Option<String>,
    pub bucket_name: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl fmt::Debug for ObjectStoreCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreCredentials")
            .field("endpoint", &self.endpoint)
            .field("account_id", &self.account_id)
            .field("bucket_name", &self.bucket_name)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl ObjectStoreCredentials {
    pub fn from_document(fields: Option<&Fields>) -> Self {
        let Some(fields) = fields else {
            return Self::default();
        };
        Self {
            endpoint: str_field(fields, "endpoint"),
            account_id: str_field(fields, "accountId"),
            bucket_name: str_field(fields, "bucketName"),
            access_key_id: str_field(fields, "accessKeyId"),
            secret_access_key: str_field(fields, "secretAccessKey"),
        }
    }

    /// Whether both halves of the access key are present.
    pub fn has_keys(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }

    /// Explicit endpoint, else the Cloudflare R2 endpoint for the account.
    pub fn resolve_endpoint(&self) -> Option<String> {
        self.endpoint.clone().or_else(|| {
            self.account_id
                .as_ref()
                .map(|account| format!("https://{account}.r2.cloudflarestorage.com"))
        })
    }
}

/// Manual trigger document (`app_config/test_cleanup_trigger`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManualTrigger {
    pub trigger_requested: bool,
    pub include_object_storage: bool,
    pub processing: bool,
    pub timestamp: Option<DateTime<Utc>>,
    /// Per-request overrides; `None` keeps the default of purging.
    pub include_chats: Option<bool>,
    pub include_announcements: Option<bool>,
    /// Request to purge everything in scope regardless of age.
    pub full_reset: bool,
}

impl ManualTrigger {
    pub fn from_document(fields: Option<&Fields>) -> Self {
        let Some(fields) = fields else {
            return Self::default();
        };

        let firebase = bool_field(fields, "includeFirebase");
        Self {
            trigger_requested: bool_field(fields, "triggerRequested")
                .or_else(|| bool_field(fields, "triggerCleanup"))
                .unwrap_or(false),
            include_object_storage: bool_field(fields, "includeObjectStorage")
                .or_else(|| bool_field(fields, "includeR2Storage"))
                .unwrap_or(false),
            processing: bool_field(fields, "processing").unwrap_or(false),
            timestamp: timestamp_of(fields),
            include_chats: bool_field(fields, "includeChats").or(firebase),
            include_announcements: bool_field(fields, "includeAnnouncements").or(firebase),
            full_reset: bool_field(fields, "fullReset").unwrap_or(false),
        }
    }
}

/// Which of the two independent run paths started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }

    /// Id of the live status document for this kind.
    pub fn status_doc_id(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled_status",
            Self::Manual => "manual_status",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTrigger {
    Scheduled,
    Manual(ManualTrigger),
}

impl RunTrigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Self::Scheduled => TriggerKind::Scheduled,
            Self::Manual(_) => TriggerKind::Manual,
        }
    }
}

/// Value of the `status` field of a status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Starting,
    Processing,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// Live status document, overwritten in place during a run.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: RunStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub trigger_kind: TriggerKind,
}

impl StatusUpdate {
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("status".into(), self.status.as_str().into());
        fields.insert("message".into(), self.message.clone().into());
        fields.insert("timestamp".into(), timestamp_value(self.timestamp));
        fields.insert("triggerKind".into(), self.trigger_kind.as_str().into());
        fields
    }
}

/// Records removed per target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeletedCounts {
    pub chats: u64,
    pub announcements: u64,
    pub objects: u64,
}

impl DeletedCounts {
    /// Documents removed from both collections.
    pub fn documents(&self) -> u64 {
        self.chats + self.announcements
    }
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    timestamp_value(*ts).serialize(s)
}

fn serialize_opt_timestamp<S: Serializer>(
    ts: &Option<DateTime<Utc>>,
    s: S,
) -> Result<S::Ok, S::Error> {
    ts.map(timestamp_value).serialize(s)
}

/// A per-key delete failure as recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditedKeyError {
    pub key: String,
    pub code: String,
    pub message: String,
}

impl From<&KeyDeleteError> for AuditedKeyError {
    fn from(e: &KeyDeleteError) -> Self {
        Self {
            key: e.key.clone(),
            code: e.code.clone(),
            message: e.message.clone(),
        }
    }
}

/// One entry of the append-only `cleanup_logs` collection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub trigger_kind: TriggerKind,
    pub frequency: Frequency,
    pub range: String,
    /// Absent when the run failed before finishing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_counts: Option<DeletedCounts>,
    #[serde(
        serialize_with = "serialize_opt_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub cutoff_date: Option<DateTime<Utc>>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub config_snapshot: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub object_key_errors: Vec<AuditedKeyError>,
    pub dry_run: bool,
    pub duration_ms: u64,
}

impl AuditLogEntry {
    pub fn to_fields(&self) -> Result<Fields, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Fields::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_missing_settings_use_defaults() {
        let config = RetentionPolicyConfig::from_document(None);
        assert_eq!(config, RetentionPolicyConfig::default());
        assert!(config.include_chats);
        assert!(config.include_announcements);
        assert!(config.include_object_storage);
        assert_eq!(config.custom_days, 1);
    }

    #[rstest]
    #[case::frequency_wins(json!({"frequency": "weekly", "range": "monthly"}), Frequency::Weekly)]
    #[case::legacy_range(json!({"range": "monthly"}), Frequency::Monthly)]
    #[case::unknown_falls_back_to_range(json!({"frequency": "hourly", "range": "weekly"}), Frequency::Weekly)]
    #[case::unknown_everything(json!({"frequency": 7}), Frequency::Daily)]
    #[case::case_insensitive(json!({"frequency": "Custom"}), Frequency::Custom)]
    fn test_frequency_resolution(#[case] doc: Value, #[case] expected: Frequency) {
        let config = RetentionPolicyConfig::from_document(Some(&fields(doc)));
        assert_eq!(config.frequency, expected);
    }

    #[test]
    fn test_include_flags_default_true_unless_false() {
        let config = RetentionPolicyConfig::from_document(Some(&fields(json!({
            "includeChats": false,
            "includeAnnouncements": "yes",
        }))));
        assert!(!config.include_chats);
        assert!(config.include_announcements);
        assert!(config.include_object_storage);
    }

    #[test]
    fn test_legacy_include_keys() {
        let config = RetentionPolicyConfig::from_document(Some(&fields(json!({
            "includeFirebase": false,
            "includeR2Storage": false,
        }))));
        assert!(!config.include_chats);
        assert!(!config.include_announcements);
        assert!(!config.include_object_storage);
    }

    #[rstest]
    #[case(json!({"customDays": 14}), 14)]
    #[case(json!({"customDays": "5"}), 5)]
    #[case(json!({"customDays": 0}), 1)]
    #[case(json!({"customDays": -3}), 1)]
    #[case(json!({"customDays": 100_000_000}), MAX_CUSTOM_DAYS)]
    #[case(json!({"customDays": "4294967295"}), MAX_CUSTOM_DAYS)]
    fn test_custom_days_parsing(#[case] doc: Value, #[case] expected: u32) {
        let config = RetentionPolicyConfig::from_document(Some(&fields(doc)));
        assert_eq!(config.custom_days, expected);
    }

    #[test]
    fn test_snapshot_is_camel_case() {
        let snapshot = RetentionPolicyConfig::default().snapshot();
        assert_eq!(snapshot["frequency"], "daily");
        assert_eq!(snapshot["customDays"], 1);
        assert_eq!(snapshot["includeObjectStorage"], true);
    }

    #[test]
    fn test_credentials_endpoint_resolution() {
        let mut creds = ObjectStoreCredentials::from_document(Some(&fields(json!({
            "accountId": "abc123",
            "bucketName": "school-media",
            "accessKeyId": "key",
            "secretAccessKey": "secret",
        }))));
        assert!(creds.has_keys());
        assert_eq!(
            creds.resolve_endpoint().as_deref(),
            Some("https://abc123.r2.cloudflarestorage.com")
        );

        creds.endpoint = Some("http://localhost:9000".into());
        assert_eq!(
            creds.resolve_endpoint().as_deref(),
            Some("http://localhost:9000")
        );
    }

    #[test]
    fn test_credentials_blank_secret_counts_as_missing() {
        let creds = ObjectStoreCredentials::from_document(Some(&fields(json!({
            "accessKeyId": "key",
            "secretAccessKey": "  ",
        }))));
        assert!(!creds.has_keys());
        assert!(creds.secret_access_key.is_none());
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = ObjectStoreCredentials {
            secret_access_key: Some("hunter2".into()),
            ..Default::default()
        };
        let printed = format!("{creds:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_manual_trigger_legacy_keys() {
        let trigger = ManualTrigger::from_document(Some(&fields(json!({
            "triggerCleanup": true,
            "includeR2Storage": true,
            "includeFirebase": false,
            "timestamp": "2026-03-01T00:00:00Z",
        }))));
        assert!(trigger.trigger_requested);
        assert!(trigger.include_object_storage);
        assert_eq!(trigger.include_chats, Some(false));
        assert_eq!(trigger.include_announcements, Some(false));
        assert_eq!(
            trigger.timestamp,
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap())
        );
        assert!(!trigger.full_reset);
    }

    #[test]
    fn test_audit_entry_omits_counts_on_fatal_run() {
        let entry = AuditLogEntry {
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap(),
            trigger_kind: TriggerKind::Scheduled,
            frequency: Frequency::Daily,
            range: "daily".into(),
            deleted_counts: None,
            cutoff_date: None,
            success: false,
            error: Some("boom".into()),
            config_snapshot: Value::Null,
            object_key_errors: Vec::new(),
            dry_run: false,
            duration_ms: 12,
        };
        let doc = entry.to_fields().unwrap();
        assert!(!doc.contains_key("deletedCounts"));
        assert!(!doc.contains_key("cutoffDate"));
        assert_eq!(doc["triggerKind"], "scheduled");
        assert_eq!(doc["timestamp"], "2026-03-01T02:00:00.000Z");
        assert_eq!(doc["error"], "boom");
    }

    #[test]
    fn test_status_update_fields() {
        let update = StatusUpdate {
            status: RunStatus::Processing,
            message: "Processing chats and announcements...".into(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap(),
            trigger_kind: TriggerKind::Manual,
        };
        let doc = update.to_fields();
        assert_eq!(doc["status"], "processing");
        assert_eq!(doc["triggerKind"], "manual");
    }
}
