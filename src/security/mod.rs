//! Authentication, authorization and audit.

pub mod audit;
pub mod external_auth;
pub mod rbac;
pub mod sasl;
pub mod tls_config;

pub use audit::{AuditConfig, AuditEvent, AuditEventType, AuditLog};
pub use external_auth::{ActiveUsers, AuthResponse, ExternalAuthManager};
pub use rbac::{
    resolve_with_rebuild, Domain, Identity, Privilege, PrivilegeCheck, PrivilegeContext,
    PrivilegeMask, RbacError, RbacView, ResolvedPrivilege, UserEntry, MAX_REBUILD_ATTEMPTS,
};
pub use sasl::{authenticate_plain, password_digest, PlainChallenge, SaslError, SaslOutcome};
pub use tls_config::{TlsAuthClients, TlsError, TlsSettings};
#[cfg(feature = "tls")]
pub use tls_config::TlsContextHolder;
