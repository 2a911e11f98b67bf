//! Coordinator configuration
//!
//! A single [`CoordinatorConfig`] is shared (behind an `Arc`) by every
//! [`TransactionManager`](crate::manager::TransactionManager) in the process.
//! Its `query_cache_enabled` flag is the global gate for scoped query caching:
//! a transaction's own cache toggle only matters while the gate is open.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How repeated deferred statements with the same identity are queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredQueueMode {
    /// Re-adding an identity replaces the queued entry in place
    #[default]
    Deduplicate,
    /// Every added statement is queued and executed
    Append,
}

impl FromStr for DeferredQueueMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deduplicate" | "dedup" => Ok(DeferredQueueMode::Deduplicate),
            "append" | "list" => Ok(DeferredQueueMode::Append),
            _ => Err(ConfigError::InvalidValue {
                field: "deferred_mode".to_string(),
                value: s.to_string(),
                expected: "deduplicate or append".to_string(),
            }),
        }
    }
}

/// What happens to commit/rollback/close failures while a root transaction ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Attempt every resource, then report all failures as one error
    #[default]
    Strict,
    /// Attempt every resource, log failures and report success
    Lenient,
}

impl FromStr for CleanupPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(CleanupPolicy::Strict),
            "lenient" => Ok(CleanupPolicy::Lenient),
            _ => Err(ConfigError::InvalidValue {
                field: "cleanup_policy".to_string(),
                value: s.to_string(),
                expected: "strict or lenient".to_string(),
            }),
        }
    }
}

/// Process-wide coordinator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Global gate for transaction-scoped query caching
    pub query_cache_enabled: bool,
    /// Deferred statement queueing policy
    pub deferred_mode: DeferredQueueMode,
    /// Cleanup failure handling at the end of a root transaction
    pub cleanup_policy: CleanupPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            query_cache_enabled: true,
            deferred_mode: DeferredQueueMode::Deduplicate,
            cleanup_policy: CleanupPolicy::Strict,
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query_cache(mut self, enabled: bool) -> Self {
        self.query_cache_enabled = enabled;
        self
    }

    pub fn with_deferred_mode(mut self, mode: DeferredQueueMode) -> Self {
        self.deferred_mode = mode;
        self
    }

    pub fn with_cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup_policy = policy;
        self
    }

    /// Load configuration from environment variables, falling back to defaults
    ///
    /// Reads `ELIF_TXN_QUERY_CACHE`, `ELIF_TXN_DEFERRED_MODE` and
    /// `ELIF_TXN_CLEANUP_POLICY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(value) = env::var("ELIF_TXN_QUERY_CACHE") {
            config.query_cache_enabled = parse_bool("query_cache_enabled", &value)?;
        }

        if let Ok(value) = env::var("ELIF_TXN_DEFERRED_MODE") {
            config.deferred_mode = value.parse()?;
        }

        if let Ok(value) = env::var("ELIF_TXN_CLEANUP_POLICY") {
            config.cleanup_policy = value.parse()?;
        }

        tracing::debug!("Loaded coordinator configuration: {:?}", config);
        Ok(config)
    }
}

fn parse_bool(field: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            expected: "true or false".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        env::remove_var("ELIF_TXN_QUERY_CACHE");
        env::remove_var("ELIF_TXN_DEFERRED_MODE");
        env::remove_var("ELIF_TXN_CLEANUP_POLICY");
    }

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert!(config.query_cache_enabled);
        assert_eq!(config.deferred_mode, DeferredQueueMode::Deduplicate);
        assert_eq!(config.cleanup_policy, CleanupPolicy::Strict);
    }

    #[test]
    fn test_builder_methods() {
        let config = CoordinatorConfig::new()
            .with_query_cache(false)
            .with_deferred_mode(DeferredQueueMode::Append)
            .with_cleanup_policy(CleanupPolicy::Lenient);

        assert!(!config.query_cache_enabled);
        assert_eq!(config.deferred_mode, DeferredQueueMode::Append);
        assert_eq!(config.cleanup_policy, CleanupPolicy::Lenient);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"deferred_mode": "append"}"#).unwrap();
        assert_eq!(config.deferred_mode, DeferredQueueMode::Append);
        assert!(config.query_cache_enabled);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        env::set_var("ELIF_TXN_QUERY_CACHE", "off");
        env::set_var("ELIF_TXN_CLEANUP_POLICY", "Lenient");

        let config = CoordinatorConfig::from_env().unwrap();
        assert!(!config.query_cache_enabled);
        assert_eq!(config.cleanup_policy, CleanupPolicy::Lenient);
        assert_eq!(config.deferred_mode, DeferredQueueMode::Deduplicate);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_unknown_mode() {
        clear_env();
        env::set_var("ELIF_TXN_DEFERRED_MODE", "shuffle");

        let result = CoordinatorConfig::from_env();
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        clear_env();
    }
}
