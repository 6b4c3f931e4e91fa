//! Buckets and the bucket registry.
//!
//! A bucket is a named engine instance the server multiplexes client
//! connections onto. Index 0 is the "no bucket" sentinel every connection
//! starts on: it grants bucket-management privileges but holds no engine,
//! so all data operations fail with `NoBucket`.

use super::EngineHandle;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Index of the no-bucket sentinel.
pub const NO_BUCKET_INDEX: usize = 0;

/// Lifecycle state of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BucketState {
    /// Being created; not yet usable
    Creating = 0,
    /// Serving traffic
    Ready = 1,
    /// Being torn down; connections must drain
    Destroying = 2,
}

/// Value compression policy of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionPolicy {
    /// Values are stored as received
    #[default]
    Off,
    /// Compressed values are accepted and stored compressed
    Passive,
    /// The server may compress values on its own
    Active,
}

/// A named engine instance.
pub struct Bucket {
    name: String,
    index: usize,
    state: AtomicU8,
    engine: Option<EngineHandle>,
    compression: CompressionPolicy,
    cluster_config: RwLock<Option<Bytes>>,
    cluster_config_revision: AtomicU64,
    connections: AtomicU64,
}

impl Bucket {
    fn new(
        name: impl Into<String>,
        index: usize,
        engine: Option<EngineHandle>,
        compression: CompressionPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            index,
            state: AtomicU8::new(BucketState::Creating as u8),
            engine,
            compression,
            cluster_config: RwLock::new(None),
            cluster_config_revision: AtomicU64::new(0),
            connections: AtomicU64::new(0),
        }
    }

    /// Bucket name. Empty for the no-bucket sentinel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bucket index; 0 is the no-bucket sentinel.
    pub fn index(&self) -> usize {
        self.index
    }

    /// True for the no-bucket sentinel.
    pub fn is_no_bucket(&self) -> bool {
        self.index == NO_BUCKET_INDEX
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BucketState {
        match self.state.load(Ordering::Acquire) {
            0 => BucketState::Creating,
            1 => BucketState::Ready,
            _ => BucketState::Destroying,
        }
    }

    /// Move the bucket to a new lifecycle state.
    pub fn set_state(&self, state: BucketState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// True when data operations may be dispatched.
    pub fn is_ready(&self) -> bool {
        self.state() == BucketState::Ready
    }

    /// The engine, if this is a data bucket.
    pub fn engine(&self) -> Option<&EngineHandle> {
        self.engine.as_ref()
    }

    /// Value compression policy.
    pub fn compression(&self) -> CompressionPolicy {
        self.compression
    }

    /// Latest cluster configuration blob pushed for this bucket.
    pub fn cluster_config(&self) -> Option<Bytes> {
        self.cluster_config.read().clone()
    }

    /// Revision of the current cluster configuration.
    pub fn cluster_config_revision(&self) -> u64 {
        self.cluster_config_revision.load(Ordering::Acquire)
    }

    /// Replace the cluster configuration, bumping the revision.
    pub fn set_cluster_config(&self, blob: Bytes) -> u64 {
        *self.cluster_config.write() = Some(blob);
        self.cluster_config_revision.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Account a connection binding to this bucket.
    pub fn connect(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Account a connection leaving this bucket.
    pub fn disconnect(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of connections currently bound.
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// The process-wide table of buckets.
pub struct BucketRegistry {
    buckets: RwLock<Vec<Arc<Bucket>>>,
    by_name: DashMap<String, usize>,
}

impl BucketRegistry {
    /// Create a registry holding only the no-bucket sentinel.
    pub fn new() -> Self {
        let no_bucket = Arc::new(Bucket::new("", NO_BUCKET_INDEX, None, CompressionPolicy::Off));
        no_bucket.set_state(BucketState::Ready);
        Self {
            buckets: RwLock::new(vec![no_bucket]),
            by_name: DashMap::new(),
        }
    }

    /// The sentinel every connection starts on.
    pub fn no_bucket(&self) -> Arc<Bucket> {
        self.buckets.read()[NO_BUCKET_INDEX].clone()
    }

    /// Register a data bucket and mark it ready.
    pub fn register(
        &self,
        name: impl Into<String>,
        engine: EngineHandle,
        compression: CompressionPolicy,
    ) -> Arc<Bucket> {
        let name = name.into();
        let mut buckets = self.buckets.write();
        let index = buckets.len();
        let bucket = Arc::new(Bucket::new(name.clone(), index, Some(engine), compression));
        bucket.set_state(BucketState::Ready);
        buckets.push(bucket.clone());
        self.by_name.insert(name, index);
        bucket
    }

    /// Look up a bucket by name.
    pub fn get(&self, name: &str) -> Option<Arc<Bucket>> {
        let index = *self.by_name.get(name)?;
        self.buckets.read().get(index).cloned()
    }

    /// Names of all registered data buckets.
    pub fn names(&self) -> Vec<String> {
        self.buckets
            .read()
            .iter()
            .filter(|b| !b.is_no_bucket())
            .map(|b| b.name().to_string())
            .collect()
    }
}

impl Default for BucketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BucketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketRegistry")
            .field("buckets", &self.buckets.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;

    fn memory_handle() -> EngineHandle {
        let engine = Arc::new(MemoryEngine::new());
        EngineHandle {
            kv: engine.clone(),
            dcp: Some(engine),
        }
    }

    #[test]
    fn sentinel_has_no_engine() {
        let registry = BucketRegistry::new();
        let sentinel = registry.no_bucket();
        assert!(sentinel.is_no_bucket());
        assert!(sentinel.engine().is_none());
        assert!(sentinel.is_ready());
    }

    #[test]
    fn register_and_lookup() {
        let registry = BucketRegistry::new();
        let bucket = registry.register("default", memory_handle(), CompressionPolicy::Off);
        assert_eq!(bucket.index(), 1);
        assert!(bucket.is_ready());
        assert!(registry.get("default").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["default".to_string()]);
    }

    #[test]
    fn cluster_config_revision_bumps() {
        let registry = BucketRegistry::new();
        let bucket = registry.register("default", memory_handle(), CompressionPolicy::Off);
        assert!(bucket.cluster_config().is_none());
        let rev = bucket.set_cluster_config(Bytes::from_static(b"{}"));
        assert_eq!(rev, 1);
        assert_eq!(bucket.cluster_config().unwrap(), Bytes::from_static(b"{}"));
    }
}
