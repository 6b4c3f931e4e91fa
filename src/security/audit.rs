//! Audit logging for security-relevant events.
//!
//! Events are kept in a bounded in-memory ring for inspection and
//! optionally appended to a JSON-lines file. Writing never blocks the
//! data path beyond a short mutex hold; file errors are logged and
//! swallowed.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};
use uuid::Uuid;

/// Configuration for the audit sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Master switch
    pub enabled: bool,
    /// Append JSON lines to this file when set
    pub file_path: Option<PathBuf>,
    /// Maximum events retained in memory
    pub max_memory_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file_path: None,
            max_memory_entries: 1000,
        }
    }
}

/// Kinds of audited events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A client authenticated successfully
    AuthSuccess,
    /// A client failed authentication
    AuthFailure,
    /// A privilege check denied a command
    PrivilegeDenied,
    /// Privilege debug let a denied command through
    PrivilegeDebugAllowed,
    /// A packet failed header validation
    InvalidPacket,
    /// A connection was forcibly terminated
    ConnectionTerminated,
    /// An event submitted through the audit-put command
    External,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique id, usable as an error reference
    pub id: Uuid,
    /// Seconds since the epoch
    pub timestamp: u64,
    /// Event kind
    pub event_type: AuditEventType,
    /// Peer address, when bound to a connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    /// User involved, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Free-form description
    pub description: String,
}

impl AuditEvent {
    /// Create an event stamped with the current time.
    pub fn new(event_type: AuditEventType, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            event_type,
            peer: None,
            user: None,
            description: description.into(),
        }
    }

    /// Attach the peer address.
    pub fn peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    /// Attach the user name.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// The audit sink.
pub struct AuditLog {
    config: AuditConfig,
    entries: RwLock<VecDeque<AuditEvent>>,
}

impl AuditLog {
    /// Create a sink with the given configuration.
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Record an event. Returns its id for use as an error reference.
    pub fn put(&self, event: AuditEvent) -> Uuid {
        let id = event.id;
        if !self.config.enabled {
            return id;
        }

        if let Some(ref path) = self.config.file_path {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    let result = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .and_then(|mut file| writeln!(file, "{line}"));
                    if let Err(e) = result {
                        error!("failed to write audit event to {}: {e}", path.display());
                    }
                }
                Err(e) => warn!("failed to serialize audit event: {e}"),
            }
        }

        let mut entries = self.entries.write();
        if entries.len() >= self.config.max_memory_entries {
            entries.pop_front();
        }
        entries.push_back(event);
        id
    }

    /// Most recent events, newest last.
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let entries = self.entries.read();
        entries
            .iter()
            .skip(entries.len().saturating_sub(limit))
            .cloned()
            .collect()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no events are retained.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("enabled", &self.config.enabled)
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let log = AuditLog::new(AuditConfig {
            enabled: true,
            file_path: None,
            max_memory_entries: 3,
        });
        for i in 0..5 {
            log.put(AuditEvent::new(
                AuditEventType::AuthFailure,
                format!("event {i}"),
            ));
        }
        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].description, "event 2");
        assert_eq!(recent[2].description, "event 4");
    }

    #[test]
    fn disabled_sink_drops_events() {
        let log = AuditLog::new(AuditConfig {
            enabled: false,
            ..AuditConfig::default()
        });
        log.put(AuditEvent::new(AuditEventType::InvalidPacket, "dropped"));
        assert!(log.is_empty());
    }

    #[test]
    fn builder_attaches_fields() {
        let event = AuditEvent::new(AuditEventType::PrivilegeDenied, "denied")
            .peer("127.0.0.1:1234")
            .user("joe");
        assert_eq!(event.peer.as_deref(), Some("127.0.0.1:1234"));
        assert_eq!(event.user.as_deref(), Some("joe"));
    }
}
