//! Shared server state.
//!
//! Everything the components need — settings, the privilege database, the
//! audit sink, the bucket table, worker mailboxes — is reachable through
//! one explicitly-passed [`ServerContext`]; there are no ambient globals.

use super::config::Settings;
use super::reactor::{ConnSignal, SignalSender, WorkerMailbox};
use super::server_event::ClustermapNotificationEvent;
use crate::engine::{BucketRegistry, CookieToken, EngineResult, IoCompletionSink};
use crate::error::{Error, Result};
use crate::security::{AuditLog, ExternalAuthManager, RbacView};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// Shared state passed to every component at construction.
pub struct ServerContext {
    /// Immutable configuration
    pub settings: Settings,
    /// Privilege database
    pub rbac: RbacView,
    /// Audit sink
    pub audit: AuditLog,
    /// Bucket table
    pub buckets: BucketRegistry,
    /// External authentication manager
    pub auth: ExternalAuthManager,
    /// One mailbox per worker reactor, shared with engine threads
    pub mailboxes: Vec<Arc<WorkerMailbox>>,
    /// Shutdown broadcast
    pub shutdown: Notify,
    /// Session control token
    pub ctrl_token: AtomicU64,
    /// TLS context shared by the TLS listener
    #[cfg(feature = "tls")]
    pub tls: Option<crate::security::TlsContextHolder>,
    connections: AtomicUsize,
    system_connections: AtomicUsize,
    next_conn_id: AtomicU64,
    verbosity: AtomicU32,
    clustermap_subscribers: Mutex<HashMap<String, Vec<(u64, SignalSender)>>>,
}

impl ServerContext {
    /// Build the context from settings; loads the user database and the
    /// TLS context when configured.
    pub fn new(settings: Settings) -> Result<Arc<Self>> {
        let rbac = RbacView::new();
        match settings.users_file {
            Some(ref path) => {
                let text = std::fs::read_to_string(path)?;
                rbac.load_local_users(&text)
                    .map_err(|e| Error::Config(e.to_string()))?;
                info!("loaded user database from {}", path.display());
            }
            None => {
                // Without a user database, unauthenticated clients get
                // full data access to the default bucket.
                rbac.upsert_user("default", crate::security::Domain::Local, default_user());
            }
        }

        #[cfg(feature = "tls")]
        let tls = if settings.tls.enabled {
            Some(
                crate::security::TlsContextHolder::new(settings.tls.clone())
                    .map_err(|e| Error::Config(e.to_string()))?,
            )
        } else {
            None
        };

        let mailboxes = (0..settings.worker_threads)
            .map(|_| Arc::new(WorkerMailbox::new()))
            .collect();

        Ok(Arc::new(Self {
            audit: AuditLog::new(settings.audit.clone()),
            rbac,
            buckets: BucketRegistry::new(),
            auth: ExternalAuthManager::new(),
            mailboxes,
            shutdown: Notify::new(),
            ctrl_token: AtomicU64::new(0),
            #[cfg(feature = "tls")]
            tls,
            connections: AtomicUsize::new(0),
            system_connections: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            verbosity: AtomicU32::new(settings.verbosity),
            clustermap_subscribers: Mutex::new(HashMap::new()),
            settings,
        }))
    }

    /// Allocate a process-unique connection id.
    pub fn next_connection_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Try to admit a connection against the client or system quota.
    pub fn try_admit(&self, system: bool) -> bool {
        if system {
            let current = self.system_connections.fetch_add(1, Ordering::AcqRel);
            if current >= self.settings.system_connections {
                self.system_connections.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
        } else {
            let current = self.connections.fetch_add(1, Ordering::AcqRel);
            if current >= self.settings.max_connections {
                self.connections.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
        }
        true
    }

    /// Release a previously-admitted connection.
    pub fn release(&self, system: bool) {
        if system {
            self.system_connections.fetch_sub(1, Ordering::AcqRel);
        } else {
            self.connections.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Number of admitted client connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Current log verbosity.
    pub fn verbosity(&self) -> u32 {
        self.verbosity.load(Ordering::Acquire)
    }

    /// Update the log verbosity.
    pub fn set_verbosity(&self, level: u32) {
        self.verbosity.store(level, Ordering::Release);
    }

    /// Subscribe a connection to cluster map changes for `bucket`.
    pub fn subscribe_clustermap(&self, bucket: &str, connection: u64, sender: SignalSender) {
        let mut subscribers = self.clustermap_subscribers.lock();
        let entry = subscribers.entry(bucket.to_string()).or_default();
        if !entry.iter().any(|(id, _)| *id == connection) {
            entry.push((connection, sender));
        }
    }

    /// Remove a connection from every subscription list.
    pub fn unsubscribe_clustermap(&self, connection: u64) {
        let mut subscribers = self.clustermap_subscribers.lock();
        for entry in subscribers.values_mut() {
            entry.retain(|(id, _)| *id != connection);
        }
        subscribers.retain(|_, entry| !entry.is_empty());
    }

    /// Push a cluster map change notification to every subscriber of
    /// `bucket`. Dead channels are pruned.
    pub fn notify_clustermap(&self, bucket: &str, revision: u64, config: Bytes) {
        let mut subscribers = self.clustermap_subscribers.lock();
        let Some(entry) = subscribers.get_mut(bucket) else {
            return;
        };
        entry.retain(|(_, sender)| {
            sender
                .send(ConnSignal::ServerEvent(Box::new(
                    ClustermapNotificationEvent {
                        bucket: bucket.to_string(),
                        revision,
                        config: config.clone(),
                    },
                )))
                .is_ok()
        });
    }
}

fn default_user() -> crate::security::UserEntry {
    use crate::security::Privilege as P;
    let mut entry = crate::security::UserEntry {
        global: vec![P::SelectBucket],
        ..Default::default()
    };
    entry.buckets.insert(
        "default".to_string(),
        vec![
            P::Read,
            P::Insert,
            P::Upsert,
            P::Delete,
            P::SimpleStats,
            P::MetaRead,
            P::XattrRead,
            P::XattrWrite,
            P::DcpProducer,
            P::DcpConsumer,
        ],
    );
    entry
}

impl IoCompletionSink for ServerContext {
    fn notify_io_complete(&self, token: CookieToken, status: EngineResult<()>) {
        if let Some(mailbox) = self.mailboxes.get(token.worker) {
            mailbox.push_completion(token, status);
        }
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("workers", &self.mailboxes.len())
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Arc<ServerContext> {
        ServerContext::new(Settings {
            worker_threads: 2,
            max_connections: 2,
            system_connections: 1,
            ..Settings::default()
        })
        .unwrap()
    }

    #[test]
    fn completion_lands_in_the_right_mailbox() {
        let ctx = context();
        let token = CookieToken {
            worker: 1,
            connection: 42,
            slot: 5,
        };
        ctx.notify_io_complete(token, Ok(()));

        let (completions, _) = ctx.mailboxes[1].drain();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].0, token);
        let (completions, _) = ctx.mailboxes[0].drain();
        assert!(completions.is_empty());
    }

    #[test]
    fn quotas_are_independent() {
        let ctx = context();
        assert!(ctx.try_admit(false));
        assert!(ctx.try_admit(false));
        assert!(!ctx.try_admit(false));

        // The system quota is unaffected by the client quota.
        assert!(ctx.try_admit(true));
        assert!(!ctx.try_admit(true));

        ctx.release(false);
        assert!(ctx.try_admit(false));
    }
}
