//! SASL executors.
//!
//! PLAIN is verified against the local user database. Credentials for
//! users without a local entry are forwarded to the external
//! authentication provider when one is registered; the request suspends
//! until the provider answers.

use super::context::CommandContext;
use crate::engine::{EngineError, EngineResult};
use crate::protocol::{Datatype, Status};
use crate::security::sasl::{self, PlainChallenge, SaslError};
use crate::security::{AuditEvent, AuditEventType, Domain, Identity, UserEntry};
use crate::server::connection::Connection;
use crate::server::cookie::Cookie;
use tracing::{debug, warn};

pub(super) fn list_mechs_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    cookie.send_response(
        conn,
        Status::Success,
        &[],
        &[],
        sasl::MECHANISMS.as_bytes(),
        Datatype::RAW,
        0,
    )
}

enum SaslState {
    Start,
    AwaitProvider { user: String },
}

struct SaslAuthContext {
    state: SaslState,
    mechanism: String,
    challenge: Vec<u8>,
    step: bool,
}

impl SaslAuthContext {
    fn new(cookie: &Cookie, step: bool) -> Self {
        let request = cookie.request();
        Self {
            state: SaslState::Start,
            mechanism: String::from_utf8_lossy(request.key()).into_owned(),
            challenge: request.value().to_vec(),
            step,
        }
    }

    fn auth_failed(
        &self,
        cookie: &mut Cookie,
        conn: &mut Connection,
        reason: &str,
    ) -> EngineResult<()> {
        let event = AuditEvent::new(AuditEventType::AuthFailure, reason.to_string())
            .peer(conn.peer().to_string());
        let event_id = conn.server_ctx().audit.put(event);
        cookie.set_event_id(event_id);
        cookie.set_error_context("Authentication failed");
        cookie.send_status(conn, Status::AuthError)
    }

    fn auth_success(
        &self,
        cookie: &mut Cookie,
        conn: &mut Connection,
        identity: Identity,
    ) -> EngineResult<()> {
        let event = AuditEvent::new(
            AuditEventType::AuthSuccess,
            format!("{identity} authenticated"),
        )
        .peer(conn.peer().to_string())
        .user(identity.to_string());
        conn.server_ctx().audit.put(event);
        debug!("{}: authenticated as {identity}", conn.id());
        conn.authenticate(identity);
        cookie.send_status(conn, Status::Success)
    }
}

impl CommandContext for SaslAuthContext {
    fn step(&mut self, cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
        match self.state {
            SaslState::Start => {
                if self.step {
                    // PLAIN completes in a single round trip; a step
                    // without an ongoing exchange is a protocol error.
                    cookie.set_error_context("No authentication in progress");
                    return cookie.send_status(conn, Status::Einval);
                }
                if !self.mechanism.eq_ignore_ascii_case("PLAIN") {
                    cookie.set_error_context(format!(
                        "mechanism {} not supported",
                        self.mechanism
                    ));
                    return cookie.send_status(conn, Status::AuthError);
                }

                match sasl::authenticate_plain(&conn.server_ctx().rbac, &self.challenge) {
                    Ok(outcome) => self.auth_success(cookie, conn, outcome.identity),
                    Err(SaslError::UnknownUser) => self.forward_to_provider(cookie, conn),
                    Err(SaslError::AuthFailed) => {
                        self.auth_failed(cookie, conn, "invalid credentials")
                    }
                    Err(e) => {
                        cookie.set_error_context(e.to_string());
                        cookie.send_status(conn, Status::Einval)
                    }
                }
            }
            SaslState::AwaitProvider { ref user } => {
                let user = user.clone();
                let token = conn.token_for(cookie.slot());
                let Some(response) = conn.server_ctx().auth.take_response(token) else {
                    // Resumed without an answer; treat as service failure.
                    return self.auth_failed(cookie, conn, "provider response missing");
                };
                match response.status {
                    Status::Success => {
                        let entry = parse_user_entry(&response.payload);
                        conn.server_ctx().auth.login(
                            conn.id(),
                            &user,
                            &conn.server_ctx().rbac,
                            entry,
                        );
                        self.auth_success(
                            cookie,
                            conn,
                            Identity {
                                user,
                                domain: Domain::External,
                            },
                        )
                    }
                    status => {
                        warn!(
                            "{}: external auth for {user} failed: {status:?} {}",
                            conn.id(),
                            response.payload
                        );
                        self.auth_failed(cookie, conn, "external authentication failed")
                    }
                }
            }
        }
    }
}

impl SaslAuthContext {
    fn forward_to_provider(
        &mut self,
        cookie: &mut Cookie,
        conn: &mut Connection,
    ) -> EngineResult<()> {
        let Ok(plain) = PlainChallenge::parse(&self.challenge) else {
            cookie.set_error_context("malformed challenge");
            return cookie.send_status(conn, Status::Einval);
        };

        let token = conn.token_for(cookie.slot());
        let enqueued = conn.server_ctx().auth.enqueue_request(
            token,
            conn.signal_sender(),
            &plain.authcid,
            &self.mechanism,
            &self.challenge,
            self.step,
        );

        match enqueued {
            Ok(()) => {
                self.state = SaslState::AwaitProvider {
                    user: plain.authcid,
                };
                Err(EngineError::WouldBlock)
            }
            Err(_) => self.auth_failed(cookie, conn, "unknown user, no external provider"),
        }
    }
}

pub(super) fn auth_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    super::run_context(cookie, conn, |cookie, _conn| {
        Ok(Box::new(SaslAuthContext::new(cookie, false)))
    })
}

pub(super) fn step_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    super::run_context(cookie, conn, |cookie, _conn| {
        Ok(Box::new(SaslAuthContext::new(cookie, true)))
    })
}

/// The provider answers a successful exchange with the user's privilege
/// entry, either bare or wrapped in an `"rbac"` object.
fn parse_user_entry(payload: &str) -> Option<UserEntry> {
    if payload.trim().is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let entry = value.get("rbac").cloned().unwrap_or(value);
    serde_json::from_value(entry).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_wrapped_entries() {
        let bare = r#"{"global": ["SelectBucket"]}"#;
        assert!(parse_user_entry(bare).is_some());

        let wrapped = r#"{"rbac": {"buckets": {"default": ["Read"]}}}"#;
        let entry = parse_user_entry(wrapped).unwrap();
        assert!(entry.buckets.contains_key("default"));

        assert!(parse_user_entry("").is_none());
        assert!(parse_user_entry("not json").is_none());
    }
}
