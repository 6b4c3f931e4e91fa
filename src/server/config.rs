//! Server configuration.
//!
//! All tunables live in a single typed [`Settings`] struct with documented
//! defaults. Settings load from a JSON file and are passed explicitly to
//! the components that need them; there is no ambient global state.

use crate::security::{AuditConfig, TlsSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default client port.
pub const DEFAULT_PORT: u16 = 11210;

/// Scheduling priority of a connection, selecting its work budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPriority {
    /// Large budget; for latency-sensitive internal connections
    High,
    /// Default budget
    #[default]
    Medium,
    /// Small budget; yields frequently
    Low,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // === Listeners ===
    /// Bind address
    pub bind: String,
    /// Client port
    pub port: u16,
    /// Additional ports reserved for system-internal connections
    pub system_ports: Vec<u16>,
    /// TLS listener configuration
    pub tls: TlsSettings,

    // === Concurrency ===
    /// Number of worker reactor threads
    pub worker_threads: usize,
    /// Maximum concurrent client connections
    pub max_connections: usize,
    /// Extra connection quota reserved for system ports
    pub system_connections: usize,
    /// Maximum concurrently executing requests per connection in
    /// unordered mode
    pub max_in_flight: usize,

    // === Limits and timeouts ===
    /// Maximum packet body size in bytes
    pub max_packet_size: usize,
    /// Maximum bytes queued for sending before writes fail
    pub max_send_queue_size: usize,
    /// Disconnect idle connections after this many seconds (0 = never)
    pub idle_timeout_secs: u64,
    /// Send-queue stall grace window while the bucket is ready
    pub ready_stall_timeout_secs: u64,
    /// Send-queue stall grace window while the bucket is not ready
    pub unready_stall_timeout_secs: u64,

    // === Work budgets per event-loop entry ===
    /// Requests per event for high-priority connections
    pub budget_high: u32,
    /// Requests per event for medium-priority connections
    pub budget_medium: u32,
    /// Requests per event for low-priority connections
    pub budget_low: u32,

    // === Security ===
    /// Path to the local user database (JSON)
    pub users_file: Option<PathBuf>,
    /// Audit sink configuration
    pub audit: AuditConfig,
    /// Allow privilege-debug mode (debug builds only; denied privilege
    /// checks are audited and then allowed)
    pub privilege_debug: bool,
    /// Seconds between active-external-users pushes to the auth provider
    pub active_users_push_interval_secs: u64,

    // === Buckets ===
    /// Name of the bucket created at startup
    pub default_bucket: Option<String>,

    // === Logging ===
    /// Log verbosity (0 = info, 1 = debug, 2+ = trace)
    pub verbosity: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            system_ports: Vec::new(),
            tls: TlsSettings::default(),
            worker_threads: 4,
            max_connections: 60_000,
            system_connections: 5_000,
            max_in_flight: 16,
            max_packet_size: 30 * 1024 * 1024,
            max_send_queue_size: 40 * 1024 * 1024,
            idle_timeout_secs: 0,
            ready_stall_timeout_secs: 29,
            unready_stall_timeout_secs: 1,
            budget_high: 50,
            budget_medium: 20,
            budget_low: 5,
            users_file: None,
            audit: AuditConfig::default(),
            privilege_debug: false,
            active_users_push_interval_secs: 300,
            default_bucket: Some("default".to_string()),
            verbosity: 0,
        }
    }
}

/// Errors loading or validating settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("cannot read {path}: {source}")]
    Read {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// The file is not valid JSON for [`Settings`]
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    /// A field holds an unusable value
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be > 0".into()));
        }
        if self.max_packet_size < crate::protocol::HEADER_LEN {
            return Err(ConfigError::Invalid(
                "max_packet_size smaller than a packet header".into(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid("max_in_flight must be > 0".into()));
        }
        if self.budget_high == 0 || self.budget_medium == 0 || self.budget_low == 0 {
            return Err(ConfigError::Invalid("work budgets must be > 0".into()));
        }
        Ok(())
    }

    /// Work budget for a priority class.
    pub fn budget_for(&self, priority: ConnectionPriority) -> u32 {
        match priority {
            ConnectionPriority::High => self.budget_high,
            ConnectionPriority::Medium => self.budget_medium,
            ConnectionPriority::Low => self.budget_low,
        }
    }

    /// Send-queue stall grace window given the bucket state.
    pub fn stall_timeout(&self, bucket_ready: bool) -> Duration {
        if bucket_ready {
            Duration::from_secs(self.ready_stall_timeout_secs)
        } else {
            Duration::from_secs(self.unready_stall_timeout_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn budgets_follow_priority() {
        let settings = Settings::default();
        assert!(settings.budget_for(ConnectionPriority::High)
            > settings.budget_for(ConnectionPriority::Medium));
        assert!(settings.budget_for(ConnectionPriority::Medium)
            > settings.budget_for(ConnectionPriority::Low));
    }

    #[test]
    fn stall_timeout_tightens_when_not_ready() {
        let settings = Settings::default();
        assert_eq!(settings.stall_timeout(true), Duration::from_secs(29));
        assert_eq!(settings.stall_timeout(false), Duration::from_secs(1));
    }

    #[test]
    fn rejects_zero_workers() {
        let settings = Settings {
            worker_threads: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn partial_json_round_trip() {
        let settings: Settings = serde_json::from_str(r#"{"port": 12000}"#).unwrap();
        assert_eq!(settings.port, 12000);
        assert_eq!(settings.worker_threads, 4);
    }
}
