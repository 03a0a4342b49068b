//! Engine configuration.
//!
//! Loads configuration from environment variables with sensible defaults. Unparseable
//! values fall back to the default.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Optimistic retry behavior of the capacity ledger
    pub ledger: LedgerConfig,
    /// Background reconciliation
    pub reconcile: ReconcileConfig,
    /// Log filter (trace, debug, info, warn, error, or an `EnvFilter` directive)
    pub log_level: String,
}

/// Ledger retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Retries after a lost capacity race
    pub max_retries: usize,
    /// First backoff in milliseconds
    pub initial_backoff_ms: u64,
    /// Backoff cap in milliseconds
    pub max_backoff_ms: u64,
    /// Backoff growth factor
    pub backoff_multiplier: f64,
}

/// Reconciliation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Whether the background reconciler runs
    pub enabled: bool,
    /// Seconds between passes
    pub interval_secs: u64,
    /// Seconds a seat or queue entry is treated as an in-flight write
    pub grace_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 2,
            max_backoff_ms: 50,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            grace_secs: 30,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            reconcile: ReconcileConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            ledger: LedgerConfig {
                max_retries: parse_or(
                    &lookup,
                    "GATHER_LEDGER_MAX_RETRIES",
                    defaults.ledger.max_retries,
                ),
                initial_backoff_ms: parse_or(
                    &lookup,
                    "GATHER_LEDGER_INITIAL_BACKOFF_MS",
                    defaults.ledger.initial_backoff_ms,
                ),
                max_backoff_ms: parse_or(
                    &lookup,
                    "GATHER_LEDGER_MAX_BACKOFF_MS",
                    defaults.ledger.max_backoff_ms,
                ),
                backoff_multiplier: parse_or(
                    &lookup,
                    "GATHER_LEDGER_BACKOFF_MULTIPLIER",
                    defaults.ledger.backoff_multiplier,
                ),
            },
            reconcile: ReconcileConfig {
                enabled: parse_or(
                    &lookup,
                    "GATHER_RECONCILE_ENABLED",
                    defaults.reconcile.enabled,
                ),
                interval_secs: parse_or(
                    &lookup,
                    "GATHER_RECONCILE_INTERVAL_SECS",
                    defaults.reconcile.interval_secs,
                ),
                grace_secs: parse_or(
                    &lookup,
                    "GATHER_RECONCILE_GRACE_SECS",
                    defaults.reconcile.grace_secs,
                ),
            },
            log_level: lookup("GATHER_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or(defaults.log_level),
        }
    }
}

impl LedgerConfig {
    /// Retry policy for the ledger's optimistic transactions
    #[must_use]
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_retries)
            .initial_delay(Duration::from_millis(self.initial_backoff_ms))
            .max_delay(Duration::from_millis(self.max_backoff_ms))
            .multiplier(self.backoff_multiplier)
            .build()
    }
}

impl ReconcileConfig {
    /// Interval between reconciliation passes (at least one second)
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Age below which reconciliation leaves a seat or queue entry alone
    #[must_use]
    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(i64::try_from(self.grace_secs).unwrap_or(i64::MAX))
            .unwrap_or(chrono::Duration::MAX)
    }
}
