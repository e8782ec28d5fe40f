//! Configuration for synchronized collections.
//!
//! Configuration is passed to [`Collection::open()`](crate::Collection::open)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//! Behavior that can't be serialized (key extractor, write handler, shape
//! transport) is supplied to `open()` directly.
//!
//! # Quick Start
//!
//! ```rust
//! use sync_collection::config::{CollectionConfig, ConflictPolicy};
//!
//! let mut config = CollectionConfig::for_testing("todos", "todos");
//! config.mutations.conflict_policy = ConflictPolicy::RejectConcurrent;
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! CollectionConfig
//! ├── id: String                    # Unique within a CollectionManager
//! ├── shape: ShapeDefinition        # table / where / params / columns
//! ├── mutations: MutationConfig
//! │   ├── confirmation_timeout      # "30s"
//! │   ├── txid_match                # exact | at_least
//! │   ├── conflict_policy           # queue | reject_concurrent
//! │   ├── upsert                    # insert over existing key allowed
//! │   └── seen_txid_window          # early-confirmation memory
//! └── ingest: IngestConfig
//!     ├── live                      # keep long-polling after catch-up
//!     ├── long_poll_timeout         # "20s"
//!     └── retry_*                   # reconnect backoff
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! id: todos
//! shape:
//!   table: todos
//!   where: "list_id = $1"
//!   params: ["42"]
//! mutations:
//!   confirmation_timeout: "10s"
//!   txid_match: at_least
//!   conflict_policy: reject_concurrent
//! ingest:
//!   long_poll_timeout: "20s"
//!   retry_max_delay: "1m"
//! ```

use crate::error::{Result, SyncError};
use crate::resilience::RetryConfig;
use crate::shape::ShapeDefinition;
use crate::stream::Txid;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: one per collection
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything needed to open one collection, minus the behavior hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Collection identifier. Used in logs, metrics, and as the manager key.
    pub id: String,

    /// The shape this collection mirrors.
    pub shape: ShapeDefinition,

    /// Optimistic mutation settings.
    #[serde(default)]
    pub mutations: MutationConfig,

    /// Ingestion stream settings.
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl CollectionConfig {
    /// Config for a whole-table shape with defaults.
    pub fn new(id: impl Into<String>, shape: ShapeDefinition) -> Self {
        Self {
            id: id.into(),
            shape,
            mutations: MutationConfig::default(),
            ingest: IngestConfig::default(),
        }
    }

    /// Create a config with short timeouts for testing.
    pub fn for_testing(id: &str, table: &str) -> Self {
        Self {
            id: id.to_string(),
            shape: ShapeDefinition::table(table),
            mutations: MutationConfig::for_testing(),
            ingest: IngestConfig::for_testing(),
        }
    }

    /// Reject configurations that can't work.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SyncError::Config("collection id must not be empty".into()));
        }
        self.shape.validate()?;
        self.mutations.validate()?;
        self.ingest.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MutationConfig: optimistic writes and confirmation
// ═══════════════════════════════════════════════════════════════════════════════

/// How a confirmation token is matched against txids seen in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TxidMatch {
    /// Only the exact transaction confirms.
    #[default]
    Exact,
    /// Any transaction with an id at or above the token confirms.
    AtLeast,
}

impl TxidMatch {
    /// Check if `observed` confirms a mutation waiting on `token`.
    pub fn matches(&self, token: Txid, observed: Txid) -> bool {
        match self {
            TxidMatch::Exact => observed == token,
            TxidMatch::AtLeast => observed >= token,
        }
    }
}

/// What happens when a key already has a mutation in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Wait for the earlier mutation to resolve, then apply.
    #[default]
    Queue,
    /// Fail immediately with `ConflictingKeyMutation`.
    RejectConcurrent,
}

/// Optimistic mutation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationConfig {
    /// How long to wait for a mutation's txid to appear in the stream
    /// (humantime format, e.g. "30s", "500ms").
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout: String,

    /// Token matching rule.
    #[serde(default)]
    pub txid_match: TxidMatch,

    /// Same-key concurrency rule.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Let `insert` overwrite an existing row instead of failing.
    #[serde(default)]
    pub upsert: bool,

    /// How many recently observed txids to remember, so a write whose
    /// txid streams in before its handler returns still confirms.
    #[serde(default = "default_seen_txid_window")]
    pub seen_txid_window: usize,
}

fn default_confirmation_timeout() -> String {
    "30s".to_string()
}

fn default_seen_txid_window() -> usize {
    1024
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: default_confirmation_timeout(),
            txid_match: TxidMatch::default(),
            conflict_policy: ConflictPolicy::default(),
            upsert: false,
            seen_txid_window: default_seen_txid_window(),
        }
    }
}

impl MutationConfig {
    /// Short confirmation timeout for tests.
    pub fn for_testing() -> Self {
        Self {
            confirmation_timeout: "2s".to_string(),
            ..Default::default()
        }
    }

    /// Parse confirmation timeout as Duration.
    pub fn confirmation_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.confirmation_timeout).unwrap_or(Duration::from_secs(30))
    }

    fn validate(&self) -> Result<()> {
        let timeout = parse_field("mutations.confirmation_timeout", &self.confirmation_timeout)?;
        if timeout.is_zero() {
            return Err(SyncError::Config(
                "mutations.confirmation_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IngestConfig: shape stream consumption
// ═══════════════════════════════════════════════════════════════════════════════

/// Ingestion stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Keep long-polling for new changes once caught up.
    /// When false the stream stops after the first up-to-date marker.
    #[serde(default = "default_true")]
    pub live: bool,

    /// How long the source may hold a live request open (humantime format).
    #[serde(default = "default_long_poll_timeout")]
    pub long_poll_timeout: String,

    /// First reconnect delay after a transport error.
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: String,

    /// Reconnect delay ceiling.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,

    /// Reconnect backoff multiplier.
    #[serde(default = "default_retry_backoff_factor")]
    pub retry_backoff_factor: f64,

    /// Consecutive failures before the collection gives up and is marked
    /// failed. `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<usize>,
}

fn default_true() -> bool {
    true
}

fn default_long_poll_timeout() -> String {
    "20s".to_string()
}

fn default_retry_initial_delay() -> String {
    "100ms".to_string()
}

fn default_retry_max_delay() -> String {
    "30s".to_string()
}

fn default_retry_backoff_factor() -> f64 {
    2.0
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            live: true,
            long_poll_timeout: default_long_poll_timeout(),
            retry_initial_delay: default_retry_initial_delay(),
            retry_max_delay: default_retry_max_delay(),
            retry_backoff_factor: default_retry_backoff_factor(),
            max_attempts: None,
        }
    }
}

impl IngestConfig {
    /// Fast polling and retries for tests.
    pub fn for_testing() -> Self {
        Self {
            live: true,
            long_poll_timeout: "200ms".to_string(),
            retry_initial_delay: "10ms".to_string(),
            retry_max_delay: "100ms".to_string(),
            retry_backoff_factor: 2.0,
            max_attempts: None,
        }
    }

    /// Parse long-poll timeout as Duration.
    pub fn long_poll_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.long_poll_timeout).unwrap_or(Duration::from_secs(20))
    }

    /// Backoff settings for the ingestion loop.
    pub fn retry_config(&self) -> RetryConfig {
        let defaults = match self.max_attempts {
            Some(n) => RetryConfig::bounded(n),
            None => RetryConfig::default(),
        };
        RetryConfig {
            initial_delay: humantime::parse_duration(&self.retry_initial_delay)
                .unwrap_or(defaults.initial_delay),
            max_delay: humantime::parse_duration(&self.retry_max_delay).unwrap_or(defaults.max_delay),
            backoff_factor: self.retry_backoff_factor,
            ..defaults
        }
    }

    fn validate(&self) -> Result<()> {
        parse_field("ingest.long_poll_timeout", &self.long_poll_timeout)?;
        let initial = parse_field("ingest.retry_initial_delay", &self.retry_initial_delay)?;
        let max = parse_field("ingest.retry_max_delay", &self.retry_max_delay)?;
        if initial > max {
            return Err(SyncError::Config(format!(
                "ingest.retry_initial_delay ({}) exceeds retry_max_delay ({})",
                self.retry_initial_delay, self.retry_max_delay
            )));
        }
        if !self.retry_backoff_factor.is_finite() || self.retry_backoff_factor < 1.0 {
            return Err(SyncError::Config(format!(
                "ingest.retry_backoff_factor must be >= 1.0, got {}",
                self.retry_backoff_factor
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(SyncError::Config("ingest.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_field(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| SyncError::Config(format!("{}: invalid duration {:?}: {}", name, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_config_default() {
        let config = MutationConfig::default();
        assert_eq!(config.confirmation_timeout, "30s");
        assert_eq!(config.txid_match, TxidMatch::Exact);
        assert_eq!(config.conflict_policy, ConflictPolicy::Queue);
        assert!(!config.upsert);
        assert_eq!(config.seen_txid_window, 1024);
        assert_eq!(config.confirmation_timeout_duration(), Duration::from_secs(30));
    }

    #[test]
    fn test_confirmation_timeout_parsing() {
        let config = MutationConfig {
            confirmation_timeout: "250ms".to_string(),
            ..Default::default()
        };
        assert_eq!(config.confirmation_timeout_duration(), Duration::from_millis(250));
    }

    #[test]
    fn test_confirmation_timeout_invalid_fallback() {
        let config = MutationConfig {
            confirmation_timeout: "soon".to_string(),
            ..Default::default()
        };
        // Should fall back to 30 seconds
        assert_eq!(config.confirmation_timeout_duration(), Duration::from_secs(30));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_txid_match() {
        assert!(TxidMatch::Exact.matches(Txid(42), Txid(42)));
        assert!(!TxidMatch::Exact.matches(Txid(42), Txid(43)));
        assert!(TxidMatch::AtLeast.matches(Txid(42), Txid(43)));
        assert!(TxidMatch::AtLeast.matches(Txid(42), Txid(42)));
        assert!(!TxidMatch::AtLeast.matches(Txid(42), Txid(41)));
    }

    #[test]
    fn test_ingest_config_default() {
        let config = IngestConfig::default();
        assert!(config.live);
        assert_eq!(config.long_poll_timeout_duration(), Duration::from_secs(20));
        let retry = config.retry_config();
        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, Duration::from_secs(30));
        assert_eq!(retry.max_attempts, usize::MAX);
    }

    #[test]
    fn test_ingest_retry_config_bounded() {
        let config = IngestConfig {
            max_attempts: Some(3),
            retry_max_delay: "1m".to_string(),
            ..Default::default()
        };
        let retry = config.retry_config();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_ingest_validate() {
        assert!(IngestConfig::default().validate().is_ok());
        assert!(IngestConfig::for_testing().validate().is_ok());

        let inverted = IngestConfig {
            retry_initial_delay: "5s".to_string(),
            retry_max_delay: "1s".to_string(),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let shrinking = IngestConfig {
            retry_backoff_factor: 0.5,
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());

        let zero = IngestConfig {
            max_attempts: Some(0),
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_collection_config_validate() {
        assert!(CollectionConfig::for_testing("todos", "todos").validate().is_ok());

        let mut config = CollectionConfig::for_testing("", "todos");
        assert!(config.validate().is_err());

        config.id = "todos".to_string();
        config.mutations.confirmation_timeout = "0s".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_json_with_defaults() {
        let json = r#"{
            "id": "todos",
            "shape": {"table": "todos", "where": "list_id = $1", "params": ["7"]},
            "mutations": {"txid_match": "at_least", "conflict_policy": "reject_concurrent"}
        }"#;
        let config: CollectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.id, "todos");
        assert_eq!(config.shape.params, vec!["7"]);
        assert_eq!(config.mutations.txid_match, TxidMatch::AtLeast);
        assert_eq!(config.mutations.conflict_policy, ConflictPolicy::RejectConcurrent);
        assert_eq!(config.mutations.confirmation_timeout, "30s");
        assert!(config.ingest.live);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = CollectionConfig::for_testing("todos", "todos");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CollectionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "todos");
        assert_eq!(parsed.shape, config.shape);
        assert_eq!(parsed.mutations.confirmation_timeout, "2s");
        assert_eq!(parsed.ingest.long_poll_timeout, "200ms");
    }
}
