//! SASL authentication mechanisms.
//!
//! The server advertises PLAIN for locally-defined users. When an external
//! authentication provider is registered, PLAIN credentials for unknown
//! local users are forwarded to the provider instead of being rejected
//! outright.
//!
//! Password verification is constant-time over SHA-256 digests.

use super::rbac::{Domain, Identity, RbacView};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Mechanisms advertised to clients.
pub const MECHANISMS: &str = "PLAIN";

/// Errors from a SASL exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SaslError {
    /// The mechanism is not supported
    #[error("unsupported mechanism: {0}")]
    UnknownMechanism(String),
    /// The challenge payload is malformed
    #[error("malformed challenge")]
    BadChallenge,
    /// The credentials did not verify
    #[error("invalid credentials")]
    AuthFailed,
    /// The user is not defined locally; try the external provider
    #[error("user not defined locally")]
    UnknownUser,
    /// A step was received without a matching auth start
    #[error("no authentication in progress")]
    NoExchange,
}

/// Outcome of a successful local SASL exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslOutcome {
    /// The authenticated identity
    pub identity: Identity,
}

/// Decoded PLAIN challenge: `authzid \0 authcid \0 password`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainChallenge {
    /// Authorization id (usually empty)
    pub authzid: String,
    /// Authentication id (the user name)
    pub authcid: String,
    /// Cleartext password
    pub password: String,
}

impl PlainChallenge {
    /// Parse the three NUL-separated fields of a PLAIN challenge.
    pub fn parse(challenge: &[u8]) -> Result<Self, SaslError> {
        let mut parts = challenge.splitn(3, |byte| *byte == 0);
        let authzid = parts.next().ok_or(SaslError::BadChallenge)?;
        let authcid = parts.next().ok_or(SaslError::BadChallenge)?;
        let password = parts.next().ok_or(SaslError::BadChallenge)?;
        Ok(Self {
            authzid: String::from_utf8_lossy(authzid).into_owned(),
            authcid: String::from_utf8_lossy(authcid).into_owned(),
            password: String::from_utf8_lossy(password).into_owned(),
        })
    }
}

/// Hex-encode the SHA-256 digest of a password, the format stored in the
/// privilege database.
pub fn password_digest(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Verify PLAIN credentials against the local user database.
///
/// Returns [`SaslError::UnknownUser`] when the user has no local entry so
/// the caller can fall through to the external provider.
pub fn authenticate_plain(
    view: &RbacView,
    challenge: &[u8],
) -> Result<SaslOutcome, SaslError> {
    let plain = PlainChallenge::parse(challenge)?;

    let Some(stored) = view.password_digest(&plain.authcid) else {
        return Err(if view.contains(&plain.authcid, Domain::Local) {
            // Local entry without a password cannot authenticate via PLAIN.
            SaslError::AuthFailed
        } else {
            SaslError::UnknownUser
        });
    };

    let offered = password_digest(&plain.password);
    if stored.as_bytes().ct_eq(offered.as_bytes()).into() {
        Ok(SaslOutcome {
            identity: Identity {
                user: plain.authcid,
                domain: Domain::Local,
            },
        })
    } else {
        Err(SaslError::AuthFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::rbac::UserEntry;

    fn view_with_user(name: &str, password: &str) -> RbacView {
        let view = RbacView::new();
        view.upsert_user(
            name,
            Domain::Local,
            UserEntry {
                password_sha256: Some(password_digest(password)),
                ..UserEntry::default()
            },
        );
        view
    }

    fn plain(user: &str, password: &str) -> Vec<u8> {
        let mut challenge = Vec::new();
        challenge.push(0);
        challenge.extend_from_slice(user.as_bytes());
        challenge.push(0);
        challenge.extend_from_slice(password.as_bytes());
        challenge
    }

    #[test]
    fn parse_plain_challenge() {
        let parsed = PlainChallenge::parse(&plain("joe", "secret")).unwrap();
        assert_eq!(parsed.authcid, "joe");
        assert_eq!(parsed.password, "secret");
        assert!(parsed.authzid.is_empty());
    }

    #[test]
    fn missing_separator_rejected() {
        assert_eq!(
            PlainChallenge::parse(b"no-separators"),
            Err(SaslError::BadChallenge)
        );
    }

    #[test]
    fn correct_password_authenticates() {
        let view = view_with_user("joe", "secret");
        let outcome = authenticate_plain(&view, &plain("joe", "secret")).unwrap();
        assert_eq!(outcome.identity.user, "joe");
        assert_eq!(outcome.identity.domain, Domain::Local);
    }

    #[test]
    fn wrong_password_fails() {
        let view = view_with_user("joe", "secret");
        assert_eq!(
            authenticate_plain(&view, &plain("joe", "wrong")),
            Err(SaslError::AuthFailed)
        );
    }

    #[test]
    fn unknown_user_falls_through() {
        let view = view_with_user("joe", "secret");
        assert_eq!(
            authenticate_plain(&view, &plain("jane", "secret")),
            Err(SaslError::UnknownUser)
        );
    }
}
