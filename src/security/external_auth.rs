//! External authentication manager.
//!
//! One specially-privileged connection may register as the authentication
//! provider. SASL exchanges for users unknown to the local database are
//! suspended, framed as `Authenticate` server-requests and pushed onto
//! the provider's connection; the provider's answer is correlated by
//! opaque and routed back to the suspended request. The manager also
//! pushes the list of active externally-authenticated users to the
//! provider at a fixed interval.
//!
//! Lock ordering: the manager mutex is never held while sending into a
//! connection's signal channel; senders are cloned out under the lock and
//! used after it is released.

use super::rbac::{Domain, RbacView, UserEntry};
use crate::engine::CookieToken;
use crate::protocol::Status;
use crate::server::reactor::{ConnSignal, SignalSender};
use crate::server::server_event::{ActiveUsersEvent, AuthenticationRequestEvent};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors enqueueing an external authentication request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExternalAuthError {
    /// No provider is registered
    #[error("no external authentication provider registered")]
    NoProvider,
}

/// A provider's answer to a forwarded authentication request.
#[derive(Debug, Clone)]
pub struct AuthResponse {
    /// Final status of the exchange
    pub status: Status,
    /// On success, the RBAC entry for the user; otherwise an error
    /// description
    pub payload: String,
}

struct PendingAuth {
    token: CookieToken,
    sender: SignalSender,
    user: String,
}

struct Provider {
    connection: u64,
    sender: SignalSender,
}

#[derive(Default)]
struct Inner {
    provider: Option<Provider>,
    next_opaque: u32,
    pending: HashMap<u32, PendingAuth>,
    responses: HashMap<CookieToken, AuthResponse>,
}

/// Reference-counted set of externally-authenticated users currently
/// connected.
#[derive(Debug, Default)]
pub struct ActiveUsers {
    users: Mutex<HashMap<String, usize>>,
}

impl ActiveUsers {
    fn login(&self, user: &str) {
        *self.users.lock().entry(user.to_string()).or_insert(0) += 1;
    }

    fn logout(&self, user: &str) {
        let mut users = self.users.lock();
        if let Some(count) = users.get_mut(user) {
            *count -= 1;
            if *count == 0 {
                users.remove(user);
            }
        }
    }

    /// JSON array of the current user names.
    pub fn to_json(&self) -> String {
        let users = self.users.lock();
        let mut names: Vec<&str> = users.keys().map(String::as_str).collect();
        names.sort_unstable();
        serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
    }
}

/// The external authentication manager.
pub struct ExternalAuthManager {
    inner: Mutex<Inner>,
    /// Users authenticated through the external provider and still
    /// connected
    pub active_users: ActiveUsers,
    /// Per-connection external identity, for logout bookkeeping
    sessions: Mutex<HashMap<u64, String>>,
}

impl ExternalAuthManager {
    /// Create a manager with no provider.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            active_users: ActiveUsers::default(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// True when a provider is registered.
    pub fn have_provider(&self) -> bool {
        self.inner.lock().provider.is_some()
    }

    /// Register `connection` as the authentication provider.
    pub fn register_provider(&self, connection: u64, sender: SignalSender) {
        let mut inner = self.inner.lock();
        if let Some(ref existing) = inner.provider {
            warn!(
                "replacing auth provider {} with {}",
                existing.connection, connection
            );
        }
        inner.provider = Some(Provider { connection, sender });
        drop(inner);
        info!("connection {connection} registered as external auth provider");
    }

    /// Forward a SASL exchange to the provider. The suspended request is
    /// resumed through its signal channel when the answer arrives.
    pub fn enqueue_request(
        &self,
        token: CookieToken,
        sender: SignalSender,
        user: &str,
        mechanism: &str,
        challenge: &[u8],
        step: bool,
    ) -> Result<(), ExternalAuthError> {
        let (opaque, provider_sender) = {
            let mut inner = self.inner.lock();
            let provider = inner.provider.as_ref().ok_or(ExternalAuthError::NoProvider)?;
            let provider_sender = provider.sender.clone();
            inner.next_opaque = inner.next_opaque.wrapping_add(1);
            let opaque = inner.next_opaque;
            inner.pending.insert(
                opaque,
                PendingAuth {
                    token,
                    sender,
                    user: user.to_string(),
                },
            );
            (opaque, provider_sender)
        };

        let payload = json!({
            "step": step,
            "context": "",
            "mechanism": mechanism,
            "challenge": BASE64.encode(challenge),
        })
        .to_string();

        // The manager mutex is released; pushing onto the provider's
        // connection can take worker-side locks safely.
        let event = AuthenticationRequestEvent { opaque, payload };
        if provider_sender
            .send(ConnSignal::ServerEvent(Box::new(event)))
            .is_err()
        {
            self.fail_pending(opaque);
            return Err(ExternalAuthError::NoProvider);
        }
        debug!("forwarded auth request for {user} (opaque {opaque:#x})");
        Ok(())
    }

    /// Route a provider response back to the suspended request.
    pub fn response_received(&self, opaque: u32, status: Status, payload: &[u8]) {
        let entry = {
            let mut inner = self.inner.lock();
            let Some(pending) = inner.pending.remove(&opaque) else {
                warn!("auth response with unknown opaque {opaque:#x}");
                return;
            };
            inner.responses.insert(
                pending.token,
                AuthResponse {
                    status,
                    payload: String::from_utf8_lossy(payload).into_owned(),
                },
            );
            pending
        };
        let _ = entry.sender.send(ConnSignal::IoComplete {
            slot: entry.token.slot,
            status: Ok(()),
        });
    }

    /// Collect the answer for a resumed request.
    pub fn take_response(&self, token: CookieToken) -> Option<AuthResponse> {
        self.inner.lock().responses.remove(&token)
    }

    /// Record a successful external login on `connection`, updating the
    /// privilege database with the entry the provider returned.
    pub fn login(&self, connection: u64, user: &str, rbac: &RbacView, entry: Option<UserEntry>) {
        if let Some(entry) = entry {
            rbac.upsert_user(user, Domain::External, entry);
        }
        self.active_users.login(user);
        self.sessions.lock().insert(connection, user.to_string());
    }

    /// A connection went away: deregister the provider if it was one and
    /// log out its external identity.
    pub fn remove_connection(&self, connection: u64, _rbac: &RbacView) {
        let orphaned: Vec<(u32, PendingAuth)> = {
            let mut inner = self.inner.lock();
            if inner
                .provider
                .as_ref()
                .is_some_and(|p| p.connection == connection)
            {
                inner.provider = None;
                info!("external auth provider (connection {connection}) went away");
                inner.pending.drain().collect()
            } else {
                Vec::new()
            }
        };

        // Outstanding requests complete with a service-down error.
        for (_, pending) in orphaned {
            let mut inner = self.inner.lock();
            inner.responses.insert(
                pending.token,
                AuthResponse {
                    status: Status::Einternal,
                    payload: "external authentication service is down".to_string(),
                },
            );
            drop(inner);
            let _ = pending.sender.send(ConnSignal::IoComplete {
                slot: pending.token.slot,
                status: Ok(()),
            });
        }

        if let Some(user) = self.sessions.lock().remove(&connection) {
            self.active_users.logout(&user);
        }
    }

    fn fail_pending(&self, opaque: u32) {
        let mut inner = self.inner.lock();
        if let Some(pending) = inner.pending.remove(&opaque) {
            inner.responses.insert(
                pending.token,
                AuthResponse {
                    status: Status::Einternal,
                    payload: "external authentication service is down".to_string(),
                },
            );
            drop(inner);
            let _ = pending.sender.send(ConnSignal::IoComplete {
                slot: pending.token.slot,
                status: Ok(()),
            });
        }
    }

    /// Push the active-user list to the provider, if one is registered.
    pub fn push_active_users(&self) {
        let sender = {
            let inner = self.inner.lock();
            match inner.provider {
                Some(ref provider) => provider.sender.clone(),
                None => return,
            }
        };
        let payload = self.active_users.to_json();
        let _ = sender.send(ConnSignal::ServerEvent(Box::new(ActiveUsersEvent {
            payload,
        })));
    }
}

impl Default for ExternalAuthManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExternalAuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ExternalAuthManager")
            .field("provider", &inner.provider.as_ref().map(|p| p.connection))
            .field("pending", &inner.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn token(slot: u8) -> CookieToken {
        CookieToken {
            worker: 0,
            connection: 7,
            slot,
        }
    }

    #[test]
    fn no_provider_fails_fast() {
        let manager = ExternalAuthManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(
            manager.enqueue_request(token(0), tx, "joe", "PLAIN", b"challenge", false),
            Err(ExternalAuthError::NoProvider)
        );
    }

    #[tokio::test]
    async fn round_trip_through_provider() {
        let manager = ExternalAuthManager::new();
        let (provider_tx, mut provider_rx) = mpsc::unbounded_channel();
        manager.register_provider(1, provider_tx);

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        manager
            .enqueue_request(token(0), client_tx, "joe", "PLAIN", b"challenge", false)
            .unwrap();

        // The provider connection received a server event.
        let opaque = match provider_rx.recv().await.unwrap() {
            ConnSignal::ServerEvent(event) => {
                assert!(event.description().contains("authentication request"));
                // The opaque is embedded in the description; fish it out
                // of the manager instead.
                manager.inner.lock().pending.keys().copied().next().unwrap()
            }
            other => panic!("unexpected signal: {other:?}"),
        };

        manager.response_received(opaque, Status::Success, b"{}");

        // The suspended request was completed...
        match client_rx.recv().await.unwrap() {
            ConnSignal::IoComplete { slot: 0, status } => assert!(status.is_ok()),
            other => panic!("unexpected signal: {other:?}"),
        }
        // ...and the response is waiting for it.
        let response = manager.take_response(token(0)).unwrap();
        assert_eq!(response.status, Status::Success);
    }

    #[tokio::test]
    async fn provider_death_fails_outstanding() {
        let manager = ExternalAuthManager::new();
        let rbac = RbacView::new();
        let (provider_tx, _provider_rx) = mpsc::unbounded_channel();
        manager.register_provider(1, provider_tx);

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        manager
            .enqueue_request(token(2), client_tx, "joe", "PLAIN", b"c", false)
            .unwrap();

        manager.remove_connection(1, &rbac);

        match client_rx.recv().await.unwrap() {
            ConnSignal::IoComplete { slot: 2, .. } => {}
            other => panic!("unexpected signal: {other:?}"),
        }
        let response = manager.take_response(token(2)).unwrap();
        assert_eq!(response.status, Status::Einternal);

        // Later requests fail fast until a new provider registers.
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(
            manager.enqueue_request(token(3), tx, "joe", "PLAIN", b"c", false),
            Err(ExternalAuthError::NoProvider)
        );
    }

    #[test]
    fn active_users_refcount() {
        let users = ActiveUsers::default();
        users.login("joe");
        users.login("joe");
        users.login("ann");
        assert_eq!(users.to_json(), r#"["ann","joe"]"#);
        users.logout("joe");
        assert_eq!(users.to_json(), r#"["ann","joe"]"#);
        users.logout("joe");
        assert_eq!(users.to_json(), r#"["ann"]"#);
    }
}
