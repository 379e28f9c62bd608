//! Cleanup engine configuration.
//!
//! Configures when the worker runs, where its documents live and how it
//! sweeps object storage. The retention window itself is not configured here:
//! it comes from the `cleanup_settings` document edited in the admin app.
//!
//! # Example
//!
//! ```toml
//! [retention]
//! enabled = true
//! run_at_utc = "02:00"
//! trigger_poll_secs = 5
//!
//! [retention.collections]
//! chats = "chats"
//! announcements = "communications"
//!
//! [retention.safety]
//! dry_run = false
//! batch_size = 500
//!
//! [retention.object_store]
//! prefixes = ["images/", "videos/", "thumbnails/", "pdfs/", "documents/", "schools/"]
//! protected_prefix = "currentPageBackgroundImage/"
//! ```

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Largest number of keys a single S3 `ListObjectsV2` page or
/// `DeleteObjects` request may carry.
pub const S3_MAX_KEYS_PER_REQUEST: u32 = 1000;

/// Cleanup engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    /// Whether the background worker runs at all.
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often to run the scheduled cleanup (in hours), used when
    /// `run_at_utc` is not set.
    /// Default: 24
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,

    /// Fixed daily run time in UTC, formatted `HH:MM`.
    /// Takes precedence over `interval_hours`.
    #[serde(default)]
    pub run_at_utc: Option<String>,

    /// How often to poll the manual trigger document (in seconds).
    /// Set to 0 to disable manual triggers.
    /// Default: 5
    #[serde(default = "default_trigger_poll_secs")]
    pub trigger_poll_secs: u64,

    /// Names of the purged collections.
    #[serde(default)]
    pub collections: CollectionNames,

    /// Locations of the engine's own documents.
    #[serde(default)]
    pub documents: DocumentLocations,

    /// Safety settings to prevent accidental data loss.
    #[serde(default)]
    pub safety: RetentionSafety,

    /// Object storage sweep settings.
    #[serde(default)]
    pub object_store: ObjectStorePurgeConfig,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: default_interval_hours(),
            run_at_utc: None,
            trigger_poll_secs: default_trigger_poll_secs(),
            collections: CollectionNames::default(),
            documents: DocumentLocations::default(),
            safety: RetentionSafety::default(),
            object_store: ObjectStorePurgeConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_hours() -> u64 {
    24
}

fn default_trigger_poll_secs() -> u64 {
    5
}

/// Collections purged by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectionNames {
    /// Chat messages.
    #[serde(default = "default_chats_collection")]
    pub chats: String,

    /// Announcements posted by staff.
    #[serde(default = "default_announcements_collection")]
    pub announcements: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            chats: default_chats_collection(),
            announcements: default_announcements_collection(),
        }
    }
}

fn default_chats_collection() -> String {
    "chats".to_string()
}

fn default_announcements_collection() -> String {
    "communications".to_string()
}

/// Where the engine reads its inputs and writes its outputs.
///
/// Names match the documents the mobile app reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentLocations {
    /// Collection holding the settings, credentials and trigger documents.
    #[serde(default = "default_config_collection")]
    pub config_collection: String,

    /// Retention policy document (frequency, include flags).
    #[serde(default = "default_settings_doc")]
    pub settings_doc: String,

    /// Object store credentials document.
    #[serde(default = "default_credentials_doc")]
    pub credentials_doc: String,

    /// Manual trigger document written by the admin app.
    #[serde(default = "default_trigger_doc")]
    pub trigger_doc: String,

    /// Collection holding one live status document per trigger kind.
    #[serde(default = "default_status_collection")]
    pub status_collection: String,

    /// Append-only cleanup log.
    #[serde(default = "default_audit_collection")]
    pub audit_collection: String,
}

impl Default for DocumentLocations {
    fn default() -> Self {
        Self {
            config_collection: default_config_collection(),
            settings_doc: default_settings_doc(),
            credentials_doc: default_credentials_doc(),
            trigger_doc: default_trigger_doc(),
            status_collection: default_status_collection(),
            audit_collection: default_audit_collection(),
        }
    }
}

fn default_config_collection() -> String {
    "app_config".to_string()
}

fn default_settings_doc() -> String {
    "cleanup_settings".to_string()
}

fn default_credentials_doc() -> String {
    "r2_settings".to_string()
}

fn default_trigger_doc() -> String {
    "test_cleanup_trigger".to_string()
}

fn default_status_collection() -> String {
    "cleanup_status".to_string()
}

fn default_audit_collection() -> String {
    "cleanup_logs".to_string()
}

/// Safety settings for retention operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionSafety {
    /// If true, count what would be deleted without deleting anything.
    /// Default: false
    #[serde(default)]
    pub dry_run: bool,

    /// Documents deleted per atomic batch. Capped at the document store's
    /// own batch limit.
    /// Default: 500
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Honour `fullReset` on manual triggers, purging everything in scope
    /// regardless of age.
    /// Default: false
    #[serde(default)]
    pub allow_unconditional: bool,
}

impl Default for RetentionSafety {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: default_batch_size(),
            allow_unconditional: false,
        }
    }
}

fn default_batch_size() -> u32 {
    500
}

/// Object storage sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectStorePurgeConfig {
    /// Key prefixes (logical folders) to sweep, in order.
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,

    /// Prefix that is never listed or deleted.
    #[serde(default = "default_protected_prefix")]
    pub protected_prefix: String,

    /// Keys requested per listing page.
    /// Default: 1000
    #[serde(default = "default_max_keys")]
    pub page_size: u32,

    /// Keys per `DeleteObjects` request.
    /// Default: 1000
    #[serde(default = "default_max_keys")]
    pub delete_batch_size: u32,

    /// Prefixes swept concurrently.
    /// Default: 2
    #[serde(default = "default_prefix_concurrency")]
    pub prefix_concurrency: usize,
}

impl Default for ObjectStorePurgeConfig {
    fn default() -> Self {
        Self {
            prefixes: default_prefixes(),
            protected_prefix: default_protected_prefix(),
            page_size: default_max_keys(),
            delete_batch_size: default_max_keys(),
            prefix_concurrency: default_prefix_concurrency(),
        }
    }
}

fn default_prefixes() -> Vec<String> {
    // Flat legacy folders first, then the per-school tree.
    ["images/", "videos/", "thumbnails/", "pdfs/", "documents/", "schools/"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_protected_prefix() -> String {
    "currentPageBackgroundImage/".to_string()
}

fn default_max_keys() -> u32 {
    S3_MAX_KEYS_PER_REQUEST
}

fn default_prefix_concurrency() -> usize {
    2
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run_at_utc.is_none() && self.interval_hours == 0 {
            return Err(ConfigError::Validation(
                "retention.interval_hours must be greater than 0 when run_at_utc is not set"
                    .into(),
            ));
        }
        if let Some(raw) = &self.run_at_utc
            && parse_run_at(raw).is_none()
        {
            return Err(ConfigError::Validation(format!(
                "retention.run_at_utc must be formatted HH:MM, got '{raw}'"
            )));
        }
        if self.safety.batch_size == 0 {
            return Err(ConfigError::Validation(
                "retention.safety.batch_size must be greater than 0".into(),
            ));
        }
        self.object_store.validate()
    }

    /// Get the scheduled interval as a Duration.
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_hours * 3600)
    }

    /// Parsed daily run time, if configured.
    pub fn run_at(&self) -> Option<NaiveTime> {
        self.run_at_utc.as_deref().and_then(parse_run_at)
    }

    /// Manual trigger poll interval, or `None` when manual triggers are off.
    pub fn trigger_poll_interval(&self) -> Option<std::time::Duration> {
        (self.trigger_poll_secs > 0)
            .then(|| std::time::Duration::from_secs(self.trigger_poll_secs))
    }
}

impl ObjectStorePurgeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("page_size", self.page_size),
            ("delete_batch_size", self.delete_batch_size),
        ] {
            if value == 0 || value > S3_MAX_KEYS_PER_REQUEST {
                return Err(ConfigError::Validation(format!(
                    "retention.object_store.{name} must be between 1 and {S3_MAX_KEYS_PER_REQUEST}, got {value}"
                )));
            }
        }
        if self.prefix_concurrency == 0 {
            return Err(ConfigError::Validation(
                "retention.object_store.prefix_concurrency must be at least 1".into(),
            ));
        }
        if self.protected_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "retention.object_store.protected_prefix cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

fn parse_run_at(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RetentionConfig::default();
        assert!(config.enabled);
        assert_eq!(config.interval_hours, 24);
        assert_eq!(config.trigger_poll_secs, 5);
        assert_eq!(config.collections.announcements, "communications");
        assert_eq!(config.documents.trigger_doc, "test_cleanup_trigger");
        assert!(!config.safety.dry_run);
        assert!(!config.safety.allow_unconditional);
        assert_eq!(config.safety.batch_size, 500);
        assert_eq!(config.object_store.prefixes.len(), 6);
        assert_eq!(
            config.object_store.protected_prefix,
            "currentPageBackgroundImage/"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            enabled = true
            run_at_utc = "02:30"
            trigger_poll_secs = 0

            [collections]
            chats = "messages"

            [safety]
            dry_run = true
            batch_size = 100
            allow_unconditional = true

            [object_store]
            prefixes = ["media/"]
            protected_prefix = "branding/"
            page_size = 250
            prefix_concurrency = 4
        "#;
        let config: RetentionConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.run_at(), NaiveTime::from_hms_opt(2, 30, 0));
        assert!(config.trigger_poll_interval().is_none());
        assert_eq!(config.collections.chats, "messages");
        assert_eq!(config.collections.announcements, "communications");
        assert!(config.safety.dry_run);
        assert_eq!(config.safety.batch_size, 100);
        assert_eq!(config.object_store.page_size, 250);
        assert_eq!(config.object_store.delete_batch_size, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_run_at_rejected() {
        let config = RetentionConfig {
            run_at_utc: Some("2am".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_interval_without_run_at_rejected() {
        let mut config = RetentionConfig {
            interval_hours: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.run_at_utc = Some("02:00".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_delete_batch_above_provider_limit_rejected() {
        let mut config = RetentionConfig::default();
        config.object_store.delete_batch_size = 1001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_interval_duration() {
        let mut config = RetentionConfig::default();
        assert_eq!(config.interval(), std::time::Duration::from_secs(24 * 3600));

        config.interval_hours = 6;
        assert_eq!(config.interval(), std::time::Duration::from_secs(6 * 3600));
    }
}
