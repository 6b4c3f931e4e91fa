//! Role-based access control.
//!
//! Every connection carries a [`PrivilegeContext`]: a snapshot of the
//! authenticated identity's privileges in the currently-selected bucket.
//! The global [`RbacView`] is generation-counted; when the view changes,
//! outstanding contexts observe `Stale` on their next check and are
//! rebuilt against the new view. A request is allowed at most
//! [`MAX_REBUILD_ATTEMPTS`] rebuilds before the stale state is surfaced
//! to the client.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Upper bound on privilege-context rebuilds within a single request.
pub const MAX_REBUILD_ATTEMPTS: u32 = 100;

/// Individual privileges gating command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[repr(u8)]
pub enum Privilege {
    /// Read documents
    Read = 0,
    /// Create new documents
    Insert,
    /// Create or overwrite documents
    Upsert,
    /// Delete documents
    Delete,
    /// Basic statistics
    SimpleStats,
    /// Full statistics
    Stats,
    /// Read document metadata
    MetaRead,
    /// Write document metadata
    MetaWrite,
    /// Read user extended attributes
    XattrRead,
    /// Write user extended attributes
    XattrWrite,
    /// Read system extended attributes
    SystemXattrRead,
    /// Write system extended attributes
    SystemXattrWrite,
    /// Open CDC producer sessions
    DcpProducer,
    /// Open CDC consumer sessions
    DcpConsumer,
    /// Submit and configure audit events
    Audit,
    /// Manage buckets
    BucketManagement,
    /// Node administration (shutdown, config reload)
    NodeManagement,
    /// Session token management
    SessionManagement,
    /// Security administration (RBAC refresh, auth provider)
    SecurityManagement,
    /// Exempt from the idle-connection reaper
    IdleConnection,
    /// Select a bucket
    SelectBucket,
    /// Act on behalf of other users
    Impersonate,
}

const PRIVILEGE_COUNT: usize = 22;

const ALL_PRIVILEGES: [Privilege; PRIVILEGE_COUNT] = [
    Privilege::Read,
    Privilege::Insert,
    Privilege::Upsert,
    Privilege::Delete,
    Privilege::SimpleStats,
    Privilege::Stats,
    Privilege::MetaRead,
    Privilege::MetaWrite,
    Privilege::XattrRead,
    Privilege::XattrWrite,
    Privilege::SystemXattrRead,
    Privilege::SystemXattrWrite,
    Privilege::DcpProducer,
    Privilege::DcpConsumer,
    Privilege::Audit,
    Privilege::BucketManagement,
    Privilege::NodeManagement,
    Privilege::SessionManagement,
    Privilege::SecurityManagement,
    Privilege::IdleConnection,
    Privilege::SelectBucket,
    Privilege::Impersonate,
];

/// A set of privileges packed into a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrivilegeMask(u32);

impl PrivilegeMask {
    /// The empty set.
    pub const EMPTY: PrivilegeMask = PrivilegeMask(0);

    /// Every defined privilege.
    pub fn all() -> Self {
        PrivilegeMask((1u32 << PRIVILEGE_COUNT) - 1)
    }

    /// Build a mask from a privilege list.
    pub fn from_iter(privileges: impl IntoIterator<Item = Privilege>) -> Self {
        let mut mask = Self::EMPTY;
        for privilege in privileges {
            mask.insert(privilege);
        }
        mask
    }

    /// Add a privilege.
    #[inline]
    pub fn insert(&mut self, privilege: Privilege) {
        self.0 |= 1 << (privilege as u8);
    }

    /// Remove a privilege.
    #[inline]
    pub fn remove(&mut self, privilege: Privilege) {
        self.0 &= !(1 << (privilege as u8));
    }

    /// Membership test.
    #[inline]
    pub fn contains(self, privilege: Privilege) -> bool {
        self.0 & (1 << (privilege as u8)) != 0
    }

    /// True if no privilege is present.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The privileges present, for diagnostics.
    pub fn iter(self) -> impl Iterator<Item = Privilege> {
        ALL_PRIVILEGES
            .into_iter()
            .filter(move |p| self.contains(*p))
    }
}

/// Where an identity was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Authenticated against the local user database
    #[default]
    Local,
    /// Authenticated by an external provider
    External,
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// User name
    pub user: String,
    /// Authentication domain
    pub domain: Domain,
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.domain {
            Domain::Local => write!(f, "{}", self.user),
            Domain::External => write!(f, "{}^external", self.user),
        }
    }
}

/// A user definition in the privilege database.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserEntry {
    /// Hex-encoded SHA-256 of the password; absent for external users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_sha256: Option<String>,
    /// Privileges granted in every bucket and outside buckets
    #[serde(default)]
    pub global: Vec<Privilege>,
    /// Per-bucket privilege grants; the key `"*"` applies to any bucket
    #[serde(default)]
    pub buckets: HashMap<String, Vec<Privilege>>,
}

/// Errors from privilege-database operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RbacError {
    /// The identity does not exist in the database
    #[error("no such user: {0}")]
    NoSuchUser(String),
    /// The database document could not be parsed
    #[error("invalid privilege database: {0}")]
    InvalidDatabase(String),
}

/// Result of a privilege check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeCheck {
    /// The privilege is held
    Ok,
    /// The privilege is not held
    Fail,
    /// The context predates the current privilege database
    Stale,
}

/// Snapshot of one identity's privileges in one bucket.
#[derive(Debug, Clone)]
pub struct PrivilegeContext {
    generation: u64,
    mask: PrivilegeMask,
    dropped: PrivilegeMask,
}

impl PrivilegeContext {
    /// A context with no privileges, used before authentication.
    pub fn empty(generation: u64) -> Self {
        Self {
            generation,
            mask: PrivilegeMask::EMPTY,
            dropped: PrivilegeMask::EMPTY,
        }
    }

    /// Check a privilege against this snapshot.
    pub fn check(&self, privilege: Privilege, view: &RbacView) -> PrivilegeCheck {
        if self.generation != view.generation() {
            return PrivilegeCheck::Stale;
        }
        if self.dropped.contains(privilege) {
            return PrivilegeCheck::Fail;
        }
        if self.mask.contains(privilege) {
            PrivilegeCheck::Ok
        } else {
            PrivilegeCheck::Fail
        }
    }

    /// Remove a privilege from the effective set until the context is
    /// rebuilt.
    pub fn drop_privilege(&mut self, privilege: Privilege) {
        self.dropped.insert(privilege);
    }

    /// The effective privilege mask, for diagnostics.
    pub fn effective(&self) -> PrivilegeMask {
        let mut mask = self.mask;
        for privilege in self.dropped.iter() {
            mask.remove(privilege);
        }
        mask
    }

    /// Generation of the database this snapshot was built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Final outcome of a privilege gate, after any rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedPrivilege {
    /// The privilege is held
    Granted,
    /// The privilege is not held
    Denied,
    /// The context could not be brought up to date within the rebuild
    /// budget
    Stale,
}

/// Check a privilege, rebuilding a stale context until it resolves or the
/// per-request rebuild budget (`rebuilds`, capped at
/// [`MAX_REBUILD_ATTEMPTS`]) is exhausted.
pub fn resolve_with_rebuild(
    context: &mut PrivilegeContext,
    privilege: Privilege,
    view: &RbacView,
    rebuilds: &mut u32,
    mut rebuild: impl FnMut(&RbacView) -> PrivilegeContext,
) -> ResolvedPrivilege {
    loop {
        match context.check(privilege, view) {
            PrivilegeCheck::Ok => return ResolvedPrivilege::Granted,
            PrivilegeCheck::Fail => return ResolvedPrivilege::Denied,
            PrivilegeCheck::Stale => {
                if *rebuilds >= MAX_REBUILD_ATTEMPTS {
                    return ResolvedPrivilege::Stale;
                }
                *rebuilds += 1;
                *context = rebuild(view);
            }
        }
    }
}

/// The process-wide privilege database.
pub struct RbacView {
    generation: AtomicU64,
    users: RwLock<HashMap<(String, Domain), UserEntry>>,
}

impl RbacView {
    /// Create an empty database.
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(1),
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Current generation; bumped on every change.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Replace the local-domain users from a JSON document of the form
    /// `{"username": { ...UserEntry... }, ...}`.
    pub fn load_local_users(&self, json: &str) -> Result<(), RbacError> {
        let parsed: HashMap<String, UserEntry> =
            serde_json::from_str(json).map_err(|e| RbacError::InvalidDatabase(e.to_string()))?;
        let mut users = self.users.write();
        users.retain(|(_, domain), _| *domain == Domain::External);
        for (name, entry) in parsed {
            users.insert((name, Domain::Local), entry);
        }
        drop(users);
        self.bump();
        Ok(())
    }

    /// Insert or replace one user entry.
    pub fn upsert_user(&self, name: &str, domain: Domain, entry: UserEntry) {
        self.users
            .write()
            .insert((name.to_string(), domain), entry);
        self.bump();
    }

    /// Remove a user entry.
    pub fn remove_user(&self, name: &str, domain: Domain) {
        if self
            .users
            .write()
            .remove(&(name.to_string(), domain))
            .is_some()
        {
            self.bump();
        }
    }

    /// Force all outstanding contexts stale without changing content.
    pub fn invalidate(&self) {
        self.bump();
    }

    /// The stored password digest for a local user.
    pub fn password_digest(&self, user: &str) -> Option<String> {
        self.users
            .read()
            .get(&(user.to_string(), Domain::Local))
            .and_then(|entry| entry.password_sha256.clone())
    }

    /// True if the user exists in the given domain.
    pub fn contains(&self, user: &str, domain: Domain) -> bool {
        self.users.read().contains_key(&(user.to_string(), domain))
    }

    /// Build a privilege context for `identity` in `bucket` (empty string
    /// for the no-bucket state).
    ///
    /// The no-bucket context carries the identity's global privileges
    /// only: bucket-scoped data privileges never apply outside a bucket.
    pub fn create_context(
        &self,
        identity: &Identity,
        bucket: &str,
    ) -> Result<PrivilegeContext, RbacError> {
        let users = self.users.read();
        let entry = users
            .get(&(identity.user.clone(), identity.domain))
            .ok_or_else(|| RbacError::NoSuchUser(identity.user.clone()))?;

        let mut mask = PrivilegeMask::from_iter(entry.global.iter().copied());
        if !bucket.is_empty() {
            if let Some(grants) = entry.buckets.get(bucket).or_else(|| entry.buckets.get("*")) {
                for privilege in grants {
                    mask.insert(*privilege);
                }
            }
        }

        Ok(PrivilegeContext {
            generation: self.generation(),
            mask,
            dropped: PrivilegeMask::EMPTY,
        })
    }
}

impl Default for RbacView {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RbacView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RbacView")
            .field("generation", &self.generation())
            .field("users", &self.users.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(user: &str) -> Identity {
        Identity {
            user: user.to_string(),
            domain: Domain::Local,
        }
    }

    fn seed(view: &RbacView) {
        view.load_local_users(
            r#"{
                "alice": {
                    "password_sha256": "00",
                    "global": ["SelectBucket"],
                    "buckets": { "default": ["Read", "Upsert"] }
                }
            }"#,
        )
        .unwrap();
    }

    #[test]
    fn mask_operations() {
        let mut mask = PrivilegeMask::EMPTY;
        assert!(mask.is_empty());
        mask.insert(Privilege::Read);
        assert!(mask.contains(Privilege::Read));
        assert!(!mask.contains(Privilege::Upsert));
        mask.remove(Privilege::Read);
        assert!(mask.is_empty());
        assert!(PrivilegeMask::all().contains(Privilege::Impersonate));
    }

    #[test]
    fn bucket_scoped_grants() {
        let view = RbacView::new();
        seed(&view);

        let ctx = view.create_context(&identity("alice"), "default").unwrap();
        assert_eq!(ctx.check(Privilege::Read, &view), PrivilegeCheck::Ok);
        assert_eq!(ctx.check(Privilege::Delete, &view), PrivilegeCheck::Fail);

        // Outside a bucket only the global grants apply.
        let ctx = view.create_context(&identity("alice"), "").unwrap();
        assert_eq!(ctx.check(Privilege::SelectBucket, &view), PrivilegeCheck::Ok);
        assert_eq!(ctx.check(Privilege::Read, &view), PrivilegeCheck::Fail);
    }

    #[test]
    fn stale_after_generation_bump() {
        let view = RbacView::new();
        seed(&view);
        let ctx = view.create_context(&identity("alice"), "default").unwrap();
        view.invalidate();
        assert_eq!(ctx.check(Privilege::Read, &view), PrivilegeCheck::Stale);

        // Rebuilding against the new view succeeds again.
        let ctx = view.create_context(&identity("alice"), "default").unwrap();
        assert_eq!(ctx.check(Privilege::Read, &view), PrivilegeCheck::Ok);
    }

    #[test]
    fn dropped_privilege_fails_until_rebuild() {
        let view = RbacView::new();
        seed(&view);
        let mut ctx = view.create_context(&identity("alice"), "default").unwrap();
        ctx.drop_privilege(Privilege::Read);
        assert_eq!(ctx.check(Privilege::Read, &view), PrivilegeCheck::Fail);

        let ctx = view.create_context(&identity("alice"), "default").unwrap();
        assert_eq!(ctx.check(Privilege::Read, &view), PrivilegeCheck::Ok);
    }

    #[test]
    fn unknown_user() {
        let view = RbacView::new();
        assert!(matches!(
            view.create_context(&identity("ghost"), ""),
            Err(RbacError::NoSuchUser(_))
        ));
    }

    #[test]
    fn rebuild_resolves_single_staleness() {
        let view = RbacView::new();
        seed(&view);
        let mut ctx = view.create_context(&identity("alice"), "default").unwrap();
        view.invalidate();

        let mut rebuilds = 0;
        let outcome = resolve_with_rebuild(&mut ctx, Privilege::Read, &view, &mut rebuilds, |v| {
            v.create_context(&identity("alice"), "default").unwrap()
        });
        assert_eq!(outcome, ResolvedPrivilege::Granted);
        assert_eq!(rebuilds, 1);
    }

    #[test]
    fn persistent_staleness_exhausts_rebuild_budget() {
        let view = RbacView::new();
        seed(&view);
        let mut ctx = view.create_context(&identity("alice"), "default").unwrap();
        view.invalidate();

        // An adversarial database that changes under every rebuild.
        let mut rebuilds = 0;
        let outcome = resolve_with_rebuild(&mut ctx, Privilege::Read, &view, &mut rebuilds, |v| {
            let rebuilt = v.create_context(&identity("alice"), "default").unwrap();
            v.invalidate();
            rebuilt
        });
        assert_eq!(outcome, ResolvedPrivilege::Stale);
        assert_eq!(rebuilds, MAX_REBUILD_ATTEMPTS);
    }
}
