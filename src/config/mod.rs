//! Configuration module for the cleanup engine.
//!
//! The engine is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! This file configures the *engine* (where the documents live, how often to
//! run, which storage prefixes to sweep). The retention *policy* itself
//! (frequency, include flags) is administered by the mobile app and stored in
//! the document store; see [`crate::retention::RetentionPolicyConfig`].
//!
//! # Example
//!
//! ```toml
//! [database]
//! type = "sqlite"
//! path = "/var/lib/campus-cleanup/documents.db"
//!
//! [retention]
//! run_at_utc = "02:00"
//!
//! [observability.logging]
//! format = "json"
//! ```

mod database;
mod observability;
mod retention;

use std::path::Path;

pub use database::*;
pub use observability::*;
pub use retention::*;
use serde::{Deserialize, Serialize};

/// Root configuration file.
///
/// All sections are optional; an empty file runs the worker against an
/// in-memory document store, which is only useful for local experiments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Document store holding policy, trigger, status and audit documents
    /// as well as the collections being purged.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Cleanup engine settings.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;

        let mut config: AppConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.retention.validate()?;
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand environment variables in the format `${VAR_NAME}`.
/// Skips commented lines (lines where content before the variable is a comment).
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(format!("invalid interpolation pattern: {e}")))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');

        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_empty_config_uses_memory_store() {
        let config = AppConfig::from_str("").unwrap();
        assert!(matches!(config.database, DatabaseConfig::Memory));
        assert!(config.retention.enabled);
        assert_eq!(config.retention.collections.chats, "chats");
    }

    #[test]
    fn test_env_var_expansion() {
        temp_env::with_var("TEST_CLEANUP_DB", Some("/tmp/cleanup.db"), || {
            let result = expand_env_vars("path = \"${TEST_CLEANUP_DB}\"").unwrap();
            assert_eq!(result, "path = \"/tmp/cleanup.db\"");
        });
    }

    #[test]
    fn test_env_var_in_comment_ignored() {
        let result = expand_env_vars("# path = \"${NONEXISTENT_VAR}\"").unwrap();
        assert_eq!(result, "# path = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_env_var_after_comment_ignored() {
        let result = expand_env_vars("key = \"value\" # ${NONEXISTENT_VAR}").unwrap();
        assert_eq!(result, "key = \"value\" # ${NONEXISTENT_VAR}");
    }

    #[test]
    fn test_missing_env_var_errors() {
        temp_env::with_var_unset("CLEANUP_DEFINITELY_UNSET", || {
            let err = expand_env_vars("key = \"${CLEANUP_DEFINITELY_UNSET}\"").unwrap_err();
            assert!(matches!(err, ConfigError::EnvVarNotFound(name) if name == "CLEANUP_DEFINITELY_UNSET"));
        });
    }

    #[test]
    fn test_unknown_section_rejected() {
        let err = AppConfig::from_str("[server]\nport = 8080").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [retention]
            interval_hours = 6

            [retention.object_store]
            prefixes = ["media/"]
            "#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.retention.interval_hours, 6);
        assert_eq!(config.retention.object_store.prefixes, vec!["media/".to_string()]);
    }

    #[test]
    fn test_from_file_missing() {
        let err = AppConfig::from_file("/nonexistent/campus-cleanup.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_, _)));
    }
}
