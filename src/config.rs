//! Client configuration.
//!
//! All options are plain data with serde defaults; parsing them out of a
//! file or environment is the embedding application's concern. Validation
//! happens once, at client construction, and rejects bad option sets with
//! a configuration error before any I/O.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigSnafu;
use crate::error::Result;

/// Whether a connection may exist without a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeaseMode {
    /// Leasing is mandatory; a missing or short secret is a configuration
    /// error.
    #[default]
    Required,
    /// Leasing is enabled only when a secret is configured; without one the
    /// client runs unleased (no heartbeats, no reaping).
    Optional,
}

/// What a failed reaper pass does beyond logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReaperErrorMode {
    /// Log and report the failure in the reap outcome.
    #[default]
    Swallow,
    /// Re-raise the failure to whoever triggered the pass.
    Throw,
}

/// What a failed heartbeat does to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatErrorMode {
    /// Mark the client dead; the next query reconnects.
    #[default]
    Reconnect,
    /// Log only; the lease keeps its old expiry.
    Swallow,
    /// Surface the failure at the query that hard-waited on the heartbeat.
    Throw,
}

/// Options recognized by [`crate::Client`].
#[derive(Clone, Serialize, Deserialize)]
pub struct TetherConfig {
    /// HMAC key for lease signatures, shared by every instance of the same
    /// service. At least 16 bytes. Required unless `lease_mode` is
    /// `optional`. Never logged, never sent to the database.
    #[serde(default)]
    pub coordination_secret: Option<String>,

    /// Service identity shared by all instances that may reap each other.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Stable identity of this instance. Defaults to `<pid>-<hex>` when
    /// unset.
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Whether the client may run without a lease.
    #[serde(default = "default_lease_mode")]
    pub lease_mode: LeaseMode,

    /// Run the reaper after successful connects.
    #[serde(default = "default_reaper")]
    pub reaper: bool,

    /// Probability that an eligible connect triggers a reaper pass,
    /// checked before the cooldown. 1.0 reaps on every eligible connect.
    #[serde(default = "default_reaper_run_probability")]
    pub reaper_run_probability: f64,

    /// Base cooldown between reaper passes in milliseconds.
    #[serde(default = "default_reaper_cooldown_ms")]
    pub reaper_cooldown_ms: u64,

    /// Error handling for reaper passes.
    #[serde(default = "default_reaper_error_mode")]
    pub reaper_error_mode: ReaperErrorMode,

    /// Sessions idle for less than this many seconds are never candidates.
    #[serde(default = "default_min_connection_idle_time_sec")]
    pub min_connection_idle_time_sec: u64,

    /// Upper bound on terminations per reaper pass.
    #[serde(default = "default_max_idle_connections_to_kill")]
    pub max_idle_connections_to_kill: usize,

    /// Lease lifetime stamped into each minted label.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Remaining lease lifetime below which a heartbeat is scheduled.
    #[serde(default = "default_heartbeat_soft_remaining_ms")]
    pub heartbeat_soft_remaining_ms: u64,

    /// Remaining lease lifetime below which queries wait for the heartbeat
    /// instead of letting it run in the background.
    #[serde(default = "default_heartbeat_hard_wait_remaining_ms")]
    pub heartbeat_hard_wait_remaining_ms: u64,

    /// Wall-clock bound on one heartbeat attempt.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Error handling for heartbeat failures.
    #[serde(default = "default_heartbeat_error_mode")]
    pub heartbeat_error_mode: HeartbeatErrorMode,

    /// Maximum query attempts (first try included).
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Decorrelated-jitter base delay in milliseconds.
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    /// Decorrelated-jitter delay cap in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Wall-clock budget for one logical connect, retries included.
    #[serde(default = "default_max_connect_retry_time_ms")]
    pub max_connect_retry_time_ms: u64,

    /// Wall-clock budget for one logical query, retries included.
    #[serde(default = "default_max_query_retry_time_ms")]
    pub max_query_retry_time_ms: u64,

    /// Per-attempt query timeout; `None` leaves queries unbounded.
    #[serde(default)]
    pub default_query_timeout_ms: Option<u64>,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            coordination_secret: None,
            service_name: default_service_name(),
            instance_id: None,
            lease_mode: default_lease_mode(),
            reaper: default_reaper(),
            reaper_run_probability: default_reaper_run_probability(),
            reaper_cooldown_ms: default_reaper_cooldown_ms(),
            reaper_error_mode: default_reaper_error_mode(),
            min_connection_idle_time_sec: default_min_connection_idle_time_sec(),
            max_idle_connections_to_kill: default_max_idle_connections_to_kill(),
            lease_ttl_ms: default_lease_ttl_ms(),
            heartbeat_soft_remaining_ms: default_heartbeat_soft_remaining_ms(),
            heartbeat_hard_wait_remaining_ms: default_heartbeat_hard_wait_remaining_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            heartbeat_error_mode: default_heartbeat_error_mode(),
            retries: default_retries(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_connect_retry_time_ms: default_max_connect_retry_time_ms(),
            max_query_retry_time_ms: default_max_query_retry_time_ms(),
            default_query_timeout_ms: None,
        }
    }
}

fn default_service_name() -> String {
    "tether".to_string()
}

fn default_lease_mode() -> LeaseMode {
    LeaseMode::Required
}

fn default_reaper() -> bool {
    true
}

fn default_reaper_run_probability() -> f64 {
    1.0
}

// One pass per instance-minute.
fn default_reaper_cooldown_ms() -> u64 {
    60_000
}

fn default_reaper_error_mode() -> ReaperErrorMode {
    ReaperErrorMode::Swallow
}

fn default_min_connection_idle_time_sec() -> u64 {
    10
}

fn default_max_idle_connections_to_kill() -> usize {
    5
}

fn default_lease_ttl_ms() -> u64 {
    120_000
}

// Renew in the background below 30s of lease left.
fn default_heartbeat_soft_remaining_ms() -> u64 {
    30_000
}

// Block queries below 5s of lease left.
fn default_heartbeat_hard_wait_remaining_ms() -> u64 {
    5_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    2_000
}

fn default_heartbeat_error_mode() -> HeartbeatErrorMode {
    HeartbeatErrorMode::Reconnect
}

fn default_retries() -> u32 {
    3
}

fn default_min_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_max_connect_retry_time_ms() -> u64 {
    30_000
}

fn default_max_query_retry_time_ms() -> u64 {
    15_000
}

impl TetherConfig {
    /// Minimum accepted secret length in bytes.
    pub const MIN_SECRET_LEN: usize = 16;

    /// Check option consistency. Called once at client construction.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return ConfigSnafu { message: "service_name must not be empty" }.fail();
        }
        match &self.coordination_secret {
            None => {
                if self.lease_mode == LeaseMode::Required {
                    return ConfigSnafu {
                        message: "coordination_secret is required unless lease_mode is optional",
                    }
                    .fail();
                }
            }
            Some(secret) => {
                if secret.len() < Self::MIN_SECRET_LEN {
                    return ConfigSnafu {
                        message: format!(
                            "coordination_secret must be at least {} bytes",
                            Self::MIN_SECRET_LEN
                        ),
                    }
                    .fail();
                }
            }
        }
        if !(0.0..=1.0).contains(&self.reaper_run_probability) {
            return ConfigSnafu { message: "reaper_run_probability must be within [0, 1]" }.fail();
        }
        if self.min_backoff_ms == 0 || self.min_backoff_ms > self.max_backoff_ms {
            return ConfigSnafu {
                message: "backoff bounds require 0 < min_backoff_ms <= max_backoff_ms",
            }
            .fail();
        }
        if self.retries == 0 {
            return ConfigSnafu { message: "retries must be at least 1" }.fail();
        }
        if self.lease_ttl_ms == 0 {
            return ConfigSnafu { message: "lease_ttl_ms must be positive" }.fail();
        }
        if self.heartbeat_hard_wait_remaining_ms > self.heartbeat_soft_remaining_ms {
            return ConfigSnafu {
                message: "heartbeat_hard_wait_remaining_ms must not exceed heartbeat_soft_remaining_ms",
            }
            .fail();
        }
        if self.max_idle_connections_to_kill == 0 {
            return ConfigSnafu { message: "max_idle_connections_to_kill must be at least 1" }.fail();
        }
        Ok(())
    }

    /// True when this option set carries a usable lease secret.
    pub fn leasing_enabled(&self) -> bool {
        self.coordination_secret.is_some()
    }
}

// The secret never appears in logs, so Debug is hand-written.
impl fmt::Debug for TetherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TetherConfig")
            .field("coordination_secret", &self.coordination_secret.as_ref().map(|_| "<redacted>"))
            .field("service_name", &self.service_name)
            .field("instance_id", &self.instance_id)
            .field("lease_mode", &self.lease_mode)
            .field("reaper", &self.reaper)
            .field("reaper_run_probability", &self.reaper_run_probability)
            .field("reaper_cooldown_ms", &self.reaper_cooldown_ms)
            .field("reaper_error_mode", &self.reaper_error_mode)
            .field("min_connection_idle_time_sec", &self.min_connection_idle_time_sec)
            .field("max_idle_connections_to_kill", &self.max_idle_connections_to_kill)
            .field("lease_ttl_ms", &self.lease_ttl_ms)
            .field("heartbeat_soft_remaining_ms", &self.heartbeat_soft_remaining_ms)
            .field("heartbeat_hard_wait_remaining_ms", &self.heartbeat_hard_wait_remaining_ms)
            .field("heartbeat_timeout_ms", &self.heartbeat_timeout_ms)
            .field("heartbeat_error_mode", &self.heartbeat_error_mode)
            .field("retries", &self.retries)
            .field("min_backoff_ms", &self.min_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("max_connect_retry_time_ms", &self.max_connect_retry_time_ms)
            .field("max_query_retry_time_ms", &self.max_query_retry_time_ms)
            .field("default_query_timeout_ms", &self.default_query_timeout_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> TetherConfig {
        TetherConfig {
            coordination_secret: Some("secret-1234567890".to_string()),
            service_name: "mysvc".to_string(),
            ..TetherConfig::default()
        }
    }

    #[test]
    fn test_default_config_requires_secret() {
        let config = TetherConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_optional_mode_allows_missing_secret() {
        let config = TetherConfig {
            lease_mode: LeaseMode::Optional,
            ..TetherConfig::default()
        };
        config.validate().unwrap();
        assert!(!config.leasing_enabled());
    }

    #[test]
    fn test_short_secret_rejected() {
        let config = TetherConfig {
            coordination_secret: Some("short".to_string()),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_secret_rejected_even_in_optional_mode() {
        let config = TetherConfig {
            coordination_secret: Some("short".to_string()),
            lease_mode: LeaseMode::Optional,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_probability_bounds() {
        let mut config = valid_config();
        config.reaper_run_probability = 1.5;
        assert!(config.validate().is_err());
        config.reaper_run_probability = -0.1;
        assert!(config.validate().is_err());
        config.reaper_run_probability = 0.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_backoff_ordering() {
        let mut config = valid_config();
        config.min_backoff_ms = 5_000;
        config.max_backoff_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", valid_config());
        assert!(!rendered.contains("secret-1234567890"));
        assert!(rendered.contains("<redacted>"));
    }
}
