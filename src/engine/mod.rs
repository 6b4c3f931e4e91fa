//! Storage engine interface.
//!
//! The front end never touches data directly: every key-value operation is
//! dispatched through the [`KvEngine`] trait and every change-data-capture
//! operation through [`DcpEngine`]. Engines run their own threads; an
//! operation that cannot complete synchronously returns
//! [`EngineError::WouldBlock`] and later delivers a completion for the
//! cookie token it was handed.

mod bucket;
mod memory;

pub use bucket::{Bucket, BucketRegistry, BucketState, CompressionPolicy, NO_BUCKET_INDEX};
pub use memory::MemoryEngine;

use crate::protocol::{Datatype, DurabilityRequirement, Status};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Result alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Status codes returned by engine operations.
///
/// `WouldBlock` is never client-visible: it suspends the request until the
/// engine delivers a completion through the [`IoCompletionSink`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum EngineError {
    #[error("key not found")]
    KeyNotFound,
    #[error("key exists")]
    KeyExists,
    #[error("not stored")]
    NotStored,
    #[error("delta is not a number")]
    DeltaBadval,
    #[error("value too big")]
    TooBig,
    #[error("invalid arguments")]
    Invalid,
    #[error("not supported")]
    NotSupported,
    #[error("operation would block")]
    WouldBlock,
    #[error("temporary failure")]
    TempFail,
    #[error("out of memory")]
    OutOfMemory,
    #[error("not my vbucket")]
    NotMyVbucket,
    #[error("engine busy")]
    Busy,
    #[error("value out of range")]
    Erange,
    #[error("rollback required")]
    Rollback,
    #[error("no bucket selected")]
    NoBucket,
    #[error("document locked")]
    Locked,
    #[error("document locked, retry later")]
    LockedTmpFail,
    #[error("authentication context is stale")]
    AuthStale,
    #[error("access denied")]
    AccessDenied,
    #[error("unknown collection")]
    UnknownCollection,
    #[error("collections manifest is ahead of the server")]
    CollectionsManifestIsAhead,
    #[error("predicate failed")]
    PredicateFailed,
    #[error("invalid durability level")]
    DurabilityInvalidLevel,
    #[error("durability requirement impossible")]
    DurabilityImpossible,
    #[error("synchronous write in progress")]
    SyncWriteInProgress,
    #[error("synchronous write ambiguous")]
    SyncWriteAmbiguous,
    #[error("synchronous write re-commit in progress")]
    SyncWriteReCommitInProgress,
    #[error("disconnect the connection")]
    Disconnect,
    #[error("engine failure")]
    Failed,
}

impl EngineError {
    /// Map an engine code onto the wire status sent to the client.
    ///
    /// This is the raw mapping; connection-dependent remaps (extended
    /// error codes, collections negotiation) are applied by the cookie.
    pub fn to_status(self) -> Status {
        match self {
            EngineError::KeyNotFound => Status::KeyEnoent,
            EngineError::KeyExists => Status::KeyEexists,
            EngineError::NotStored => Status::NotStored,
            EngineError::DeltaBadval => Status::DeltaBadval,
            EngineError::TooBig => Status::E2big,
            EngineError::Invalid => Status::Einval,
            EngineError::NotSupported => Status::NotSupported,
            EngineError::TempFail | EngineError::LockedTmpFail => Status::Etmpfail,
            EngineError::OutOfMemory => Status::Enomem,
            EngineError::NotMyVbucket => Status::NotMyVbucket,
            EngineError::Busy => Status::Ebusy,
            EngineError::Erange => Status::Erange,
            EngineError::Rollback => Status::Rollback,
            EngineError::NoBucket => Status::NoBucket,
            EngineError::Locked => Status::Locked,
            EngineError::AuthStale => Status::AuthStale,
            EngineError::AccessDenied => Status::Eaccess,
            EngineError::UnknownCollection => Status::UnknownCollection,
            EngineError::CollectionsManifestIsAhead => Status::NoCollectionsManifest,
            EngineError::PredicateFailed => Status::Einval,
            EngineError::DurabilityInvalidLevel => Status::DurabilityInvalidLevel,
            EngineError::DurabilityImpossible => Status::DurabilityImpossible,
            EngineError::SyncWriteInProgress => Status::SyncWriteInProgress,
            EngineError::SyncWriteAmbiguous => Status::SyncWriteAmbiguous,
            EngineError::SyncWriteReCommitInProgress => Status::SyncWriteReCommitInProgress,
            // These are not sendable; the state machine must close instead.
            EngineError::WouldBlock | EngineError::Disconnect | EngineError::Failed => {
                Status::Einternal
            }
        }
    }

    /// True for codes that always terminate the connection.
    #[inline]
    pub fn is_fatal(self) -> bool {
        matches!(self, EngineError::Disconnect | EngineError::Failed)
    }
}

/// Identifies a suspended request so an engine completion can find its
/// way back to the right cookie without holding any pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CookieToken {
    /// Index of the worker reactor owning the connection
    pub worker: usize,
    /// Connection id, unique for the lifetime of the process
    pub connection: u64,
    /// Cookie slot within the connection
    pub slot: u8,
}

/// Completion channel handed to engines at bucket registration.
///
/// Engine threads call [`notify_io_complete`](Self::notify_io_complete)
/// when previously-blocked work finishes; the reactor owning the
/// connection wakes up and resumes the cookie.
pub trait IoCompletionSink: Send + Sync {
    /// Deliver the final status for a suspended operation.
    fn notify_io_complete(&self, token: CookieToken, status: EngineResult<()>);
}

/// Item metadata as stored by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemMeta {
    /// Compare-and-swap value
    pub cas: u64,
    /// Client-assigned flags
    pub flags: u32,
    /// Absolute expiry time in seconds since the epoch; zero = never
    pub exptime: u32,
    /// Mutation sequence number
    pub seqno: u64,
    /// Revision sequence number
    pub rev_seqno: u64,
    /// vbucket incarnation the mutation belongs to
    pub vbucket_uuid: u64,
    /// Datatype bits of the stored value
    pub datatype: Datatype,
    /// True when the item is a tombstone
    pub deleted: bool,
}

/// A document: key, value and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Document key
    pub key: Bytes,
    /// Document value; `Bytes` so producers can chain it zero-copy
    pub value: Bytes,
    /// Metadata
    pub meta: ItemMeta,
}

/// Store semantics for mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSemantics {
    /// Store unconditionally (subject to CAS when non-zero)
    Set,
    /// Store only if the key does not exist
    Add,
    /// Store only if the key exists
    Replace,
}

/// Callback used by [`KvEngine::stats`] to emit one statistic.
pub type StatCallback<'a> = dyn FnMut(&str, &str) + 'a;

/// The key-value interface every bucket engine implements.
///
/// All methods may return [`EngineError::WouldBlock`]; the `token`
/// identifies the cookie to complete later.
pub trait KvEngine: Send + Sync {
    /// Fetch a document.
    fn get(&self, token: CookieToken, key: &[u8], vbucket: u16) -> EngineResult<Item>;

    /// Fetch and update the expiry time.
    fn get_and_touch(
        &self,
        token: CookieToken,
        key: &[u8],
        vbucket: u16,
        exptime: u32,
    ) -> EngineResult<Item>;

    /// Update the expiry time, returning the new metadata.
    fn touch(
        &self,
        token: CookieToken,
        key: &[u8],
        vbucket: u16,
        exptime: u32,
    ) -> EngineResult<ItemMeta>;

    /// Fetch and lock a document for `lock_time` seconds.
    fn get_locked(
        &self,
        token: CookieToken,
        key: &[u8],
        vbucket: u16,
        lock_time: u32,
    ) -> EngineResult<Item>;

    /// Release a lock taken by [`get_locked`](Self::get_locked).
    fn unlock(&self, token: CookieToken, key: &[u8], vbucket: u16, cas: u64) -> EngineResult<()>;

    /// Fetch metadata without the value. Returns tombstone metadata for
    /// deleted documents.
    fn get_meta(&self, token: CookieToken, key: &[u8], vbucket: u16) -> EngineResult<ItemMeta>;

    /// Store a document. `cas` non-zero requires a matching current CAS.
    /// Returns the stored metadata (new CAS and seqno).
    fn store(
        &self,
        token: CookieToken,
        item: &Item,
        cas: u64,
        semantics: StoreSemantics,
        durability: Option<DurabilityRequirement>,
        vbucket: u16,
    ) -> EngineResult<ItemMeta>;

    /// Delete a document, returning the tombstone metadata.
    fn remove(
        &self,
        token: CookieToken,
        key: &[u8],
        vbucket: u16,
        cas: u64,
        durability: Option<DurabilityRequirement>,
    ) -> EngineResult<ItemMeta>;

    /// Allocate an item for a later store. `priv_bytes` in excess of the
    /// configured limit fail fast with [`EngineError::TooBig`].
    #[allow(clippy::too_many_arguments)]
    fn allocate(
        &self,
        token: CookieToken,
        key: &[u8],
        nbytes: usize,
        priv_bytes: usize,
        flags: u32,
        exptime: u32,
        datatype: Datatype,
        vbucket: u16,
    ) -> EngineResult<Item>;

    /// Drop all documents.
    fn flush(&self, token: CookieToken) -> EngineResult<()>;

    /// Emit statistics for the given group (empty = default group).
    fn stats(&self, token: CookieToken, group: &str, emit: &mut StatCallback<'_>)
        -> EngineResult<()>;

    /// Fetch an arbitrary document, used by diagnostics.
    fn get_random_document(&self, token: CookieToken) -> EngineResult<Item>;

    /// Fallback for opcodes the front end does not recognize.
    fn unknown_command(
        &self,
        token: CookieToken,
        opcode: u8,
        request_body: &[u8],
    ) -> EngineResult<(Status, Bytes)> {
        let _ = (token, opcode, request_body);
        Ok((Status::UnknownCommand, Bytes::new()))
    }
}

/// Flags for a CDC open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcpOpenFlags(pub u32);

impl DcpOpenFlags {
    /// Open as a producer (server streams data out)
    pub const PRODUCER: u32 = 0x01;
    /// Stream tombstones with delete-times (deletion v2 frames)
    pub const INCLUDE_DELETE_TIMES: u32 = 0x20;

    /// True if the producer bit is set.
    #[inline]
    pub fn is_producer(self) -> bool {
        self.0 & Self::PRODUCER != 0
    }

    /// True if deletion v2 frames were requested.
    #[inline]
    pub fn include_delete_times(self) -> bool {
        self.0 & Self::INCLUDE_DELETE_TIMES != 0
    }
}

/// Outcome of a producer [`step`](DcpEngine::step).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Messages were produced; call again
    More,
    /// Nothing to ship right now
    Idle,
}

/// Outcome of a stream request.
#[derive(Debug, Clone)]
pub enum StreamReqOutcome {
    /// Stream accepted; the failover log is returned in the response
    Accepted {
        /// `(vbucket uuid, seqno)` entries, newest first
        failover_log: Vec<(u64, u64)>,
    },
    /// Client must roll back to the given sequence number
    Rollback(u64),
}

/// The change-data-capture interface of a bucket engine.
pub trait DcpEngine: Send + Sync {
    /// Create a CDC session bound to connection `conn`.
    fn open(
        &self,
        conn: u64,
        token: CookieToken,
        name: &str,
        flags: DcpOpenFlags,
    ) -> EngineResult<()>;

    /// Tear down the CDC session for connection `conn`.
    fn close(&self, conn: u64);

    /// Consumer side: ask the producer to add a stream.
    fn add_stream(&self, conn: u64, token: CookieToken, vbucket: u16, flags: u32)
        -> EngineResult<()>;

    /// Close one stream within the session.
    fn close_stream(
        &self,
        conn: u64,
        token: CookieToken,
        vbucket: u16,
        stream_id: Option<u16>,
    ) -> EngineResult<()>;

    /// Producer side: begin streaming a vbucket. A `stream_id` attached
    /// to the request is echoed on every message of the stream.
    #[allow(clippy::too_many_arguments)]
    fn stream_req(
        &self,
        conn: u64,
        token: CookieToken,
        vbucket: u16,
        flags: u32,
        start_seqno: u64,
        end_seqno: u64,
        vbucket_uuid: u64,
        snap_start: u64,
        snap_end: u64,
        stream_id: Option<u16>,
    ) -> EngineResult<StreamReqOutcome>;

    /// Fetch the failover log for a vbucket.
    fn get_failover_log(
        &self,
        conn: u64,
        token: CookieToken,
        vbucket: u16,
    ) -> EngineResult<Vec<(u64, u64)>>;

    /// Drive the producer: encode pending messages through `producers`.
    fn step(
        &self,
        conn: u64,
        producers: &mut dyn DcpMessageProducers,
    ) -> EngineResult<StepOutcome>;

    /// Handle a response frame the peer sent on the CDC connection.
    fn response_handler(&self, conn: u64, status: Status, opaque: u32) -> EngineResult<()>;

    /// Session-level control key/value.
    fn control(&self, conn: u64, token: CookieToken, key: &[u8], value: &[u8])
        -> EngineResult<()>;

    /// Flow-control acknowledgement of consumed bytes.
    fn buffer_acknowledgement(&self, conn: u64, vbucket: u16, bytes: u32) -> EngineResult<()>;

    /// Keep-alive from the peer.
    fn noop(&self, conn: u64, opaque: u32) -> EngineResult<()>;

    /// Durable-write sequence acknowledgement from a replica.
    fn seqno_acknowledged(
        &self,
        conn: u64,
        vbucket: u16,
        prepared_seqno: u64,
    ) -> EngineResult<()>;
}

/// Producer callbacks the engine invokes from [`DcpEngine::step`] to emit
/// wire messages. Implemented by the connection-facing shim.
#[allow(clippy::too_many_arguments)]
pub trait DcpMessageProducers {
    /// Stream accepted / rejected notification for an add-stream request.
    fn add_stream_rsp(&mut self, opaque: u32, stream_opaque: u32, status: Status)
        -> EngineResult<()>;

    /// Marker announcing a snapshot range.
    fn marker(
        &mut self,
        opaque: u32,
        vbucket: u16,
        start_seqno: u64,
        end_seqno: u64,
        flags: u32,
        stream_id: Option<u16>,
    ) -> EngineResult<()>;

    /// A document mutation.
    fn mutation(
        &mut self,
        opaque: u32,
        item: Item,
        vbucket: u16,
        lock_time: u32,
        nru: u8,
        meta: Bytes,
        stream_id: Option<u16>,
    ) -> EngineResult<()>;

    /// A document deletion (v1 framing).
    fn deletion(
        &mut self,
        opaque: u32,
        item: Item,
        vbucket: u16,
        meta: Bytes,
        stream_id: Option<u16>,
    ) -> EngineResult<()>;

    /// A document deletion (v2 framing with delete time).
    fn deletion_v2(
        &mut self,
        opaque: u32,
        item: Item,
        vbucket: u16,
        delete_time: u32,
        stream_id: Option<u16>,
    ) -> EngineResult<()>;

    /// A document expiration.
    fn expiration(
        &mut self,
        opaque: u32,
        item: Item,
        vbucket: u16,
        delete_time: u32,
        stream_id: Option<u16>,
    ) -> EngineResult<()>;

    /// A durable-write prepare.
    fn prepare(
        &mut self,
        opaque: u32,
        item: Item,
        vbucket: u16,
        lock_time: u32,
        nru: u8,
        document_state_deleted: bool,
        level: u8,
        stream_id: Option<u16>,
    ) -> EngineResult<()>;

    /// Acknowledge a prepared seqno back to the producer peer.
    fn seqno_acknowledged(
        &mut self,
        opaque: u32,
        vbucket: u16,
        prepared_seqno: u64,
    ) -> EngineResult<()>;

    /// A durable-write commit.
    fn commit(
        &mut self,
        opaque: u32,
        vbucket: u16,
        key: &[u8],
        prepared_seqno: u64,
        commit_seqno: u64,
    ) -> EngineResult<()>;

    /// A durable-write abort.
    fn abort(
        &mut self,
        opaque: u32,
        vbucket: u16,
        key: &[u8],
        prepared_seqno: u64,
        abort_seqno: u64,
    ) -> EngineResult<()>;

    /// End of a stream.
    fn stream_end(
        &mut self,
        opaque: u32,
        vbucket: u16,
        flags: u32,
        stream_id: Option<u16>,
    ) -> EngineResult<()>;

    /// vbucket state change notification.
    fn set_vbucket_state(&mut self, opaque: u32, vbucket: u16, state: u8) -> EngineResult<()>;

    /// Keep-alive probe.
    fn noop(&mut self, opaque: u32) -> EngineResult<()>;

    /// Flow-control acknowledgement.
    fn buffer_acknowledgement(&mut self, opaque: u32, vbucket: u16, bytes: u32)
        -> EngineResult<()>;

    /// Session control message.
    fn control(&mut self, opaque: u32, key: &[u8], value: &[u8]) -> EngineResult<()>;

    /// Collection / scope system event.
    fn system_event(
        &mut self,
        opaque: u32,
        vbucket: u16,
        event: u32,
        by_seqno: u64,
        version: u8,
        key: &[u8],
        event_data: &[u8],
        stream_id: Option<u16>,
    ) -> EngineResult<()>;
}

/// A bucket engine: the KV interface plus (optionally) the CDC interface.
pub struct EngineHandle {
    /// Key-value operations
    pub kv: Arc<dyn KvEngine>,
    /// CDC operations, when the engine supports streaming
    pub dcp: Option<Arc<dyn DcpEngine>>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("dcp", &self.dcp.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(EngineError::KeyNotFound.to_status(), Status::KeyEnoent);
        assert_eq!(EngineError::AccessDenied.to_status(), Status::Eaccess);
        assert_eq!(EngineError::LockedTmpFail.to_status(), Status::Etmpfail);
        assert_eq!(
            EngineError::CollectionsManifestIsAhead.to_status(),
            Status::NoCollectionsManifest
        );
        assert_eq!(
            EngineError::SyncWriteInProgress.to_status(),
            Status::SyncWriteInProgress
        );
    }

    #[test]
    fn fatal_codes() {
        assert!(EngineError::Disconnect.is_fatal());
        assert!(EngineError::Failed.is_fatal());
        assert!(!EngineError::TempFail.is_fatal());
    }

    #[test]
    fn open_flags() {
        assert!(DcpOpenFlags(0x01).is_producer());
        assert!(!DcpOpenFlags(0x00).is_producer());
        assert!(DcpOpenFlags(0x21).include_delete_times());
    }
}
