//! In-memory bucket engine.
//!
//! A sharded hash map with CAS, per-document locks, tombstones and a
//! snapshot-based CDC producer. This is the engine the server binary and
//! the integration tests run against; it completes everything
//! synchronously and never returns `WouldBlock`.

use super::{
    CookieToken, DcpEngine, DcpMessageProducers, DcpOpenFlags, EngineError, EngineResult, Item,
    ItemMeta, KvEngine, StatCallback, StepOutcome, StoreSemantics, StreamReqOutcome,
};
use crate::protocol::{Datatype, DurabilityRequirement, Status};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const SHARD_COUNT: usize = 16;

/// Relative expiry values above this are treated as absolute timestamps.
const RELATIVE_EXPIRY_LIMIT: u32 = 60 * 60 * 24 * 30;

/// Default and maximum lock durations for `get_locked`.
const DEFAULT_LOCK_SECONDS: u32 = 15;
const MAX_LOCK_SECONDS: u32 = 30;

/// Upper bound on privileged (xattr) bytes in an allocation.
const PRIVILEGED_BYTES_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone)]
struct StoredDoc {
    value: Bytes,
    meta: ItemMeta,
    locked_until: Option<Instant>,
}

impl StoredDoc {
    fn is_locked(&self) -> bool {
        self.locked_until.is_some_and(|until| until > Instant::now())
    }

    fn is_expired(&self, now: u32) -> bool {
        !self.meta.deleted && self.meta.exptime != 0 && self.meta.exptime <= now
    }
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn absolute_exptime(exptime: u32) -> u32 {
    if exptime == 0 || exptime > RELATIVE_EXPIRY_LIMIT {
        exptime
    } else {
        now_secs().saturating_add(exptime)
    }
}

#[derive(Debug)]
enum DcpMessage {
    Marker {
        start: u64,
        end: u64,
    },
    Mutation(Item),
    Deletion {
        item: Item,
        delete_time: u32,
    },
    StreamEnd,
}

#[derive(Debug)]
struct ActiveStream {
    vbucket: u16,
    opaque: u32,
    stream_id: Option<u16>,
    pending: VecDeque<DcpMessage>,
}

#[derive(Debug)]
struct DcpSession {
    #[allow(dead_code)]
    name: String,
    flags: DcpOpenFlags,
    streams: VecDeque<ActiveStream>,
}

/// The in-memory engine.
pub struct MemoryEngine {
    shards: Vec<RwLock<HashMap<Bytes, StoredDoc>>>,
    cas_counter: AtomicU64,
    seqno_counter: AtomicU64,
    vbucket_uuid: u64,
    dcp_sessions: Mutex<HashMap<u64, DcpSession>>,
}

impl MemoryEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            shards,
            cas_counter: AtomicU64::new(1),
            seqno_counter: AtomicU64::new(0),
            vbucket_uuid: 0xcafe_f00d,
            dcp_sessions: Mutex::new(HashMap::new()),
        }
    }

    fn shard(&self, key: &[u8]) -> &RwLock<HashMap<Bytes, StoredDoc>> {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for byte in key {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        &self.shards[(hash as usize) % SHARD_COUNT]
    }

    fn next_cas(&self) -> u64 {
        self.cas_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn next_seqno(&self) -> u64 {
        self.seqno_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn high_seqno(&self) -> u64 {
        self.seqno_counter.load(Ordering::Relaxed)
    }

    /// Number of live (non-tombstone, non-expired) documents.
    pub fn document_count(&self) -> usize {
        let now = now_secs();
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .values()
                    .filter(|doc| !doc.meta.deleted && !doc.is_expired(now))
                    .count()
            })
            .sum()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KvEngine for MemoryEngine {
    fn get(&self, _token: CookieToken, key: &[u8], _vbucket: u16) -> EngineResult<Item> {
        let shard = self.shard(key).read();
        let doc = shard.get(key).ok_or(EngineError::KeyNotFound)?;
        if doc.meta.deleted || doc.is_expired(now_secs()) {
            return Err(EngineError::KeyNotFound);
        }
        Ok(Item {
            key: Bytes::copy_from_slice(key),
            value: doc.value.clone(),
            meta: doc.meta,
        })
    }

    fn get_and_touch(
        &self,
        _token: CookieToken,
        key: &[u8],
        _vbucket: u16,
        exptime: u32,
    ) -> EngineResult<Item> {
        let mut shard = self.shard(key).write();
        let doc = shard.get_mut(key).ok_or(EngineError::KeyNotFound)?;
        if doc.meta.deleted || doc.is_expired(now_secs()) {
            return Err(EngineError::KeyNotFound);
        }
        if doc.is_locked() {
            return Err(EngineError::Locked);
        }
        doc.meta.exptime = absolute_exptime(exptime);
        doc.meta.cas = self.next_cas();
        Ok(Item {
            key: Bytes::copy_from_slice(key),
            value: doc.value.clone(),
            meta: doc.meta,
        })
    }

    fn touch(
        &self,
        token: CookieToken,
        key: &[u8],
        vbucket: u16,
        exptime: u32,
    ) -> EngineResult<ItemMeta> {
        self.get_and_touch(token, key, vbucket, exptime).map(|item| item.meta)
    }

    fn get_locked(
        &self,
        _token: CookieToken,
        key: &[u8],
        _vbucket: u16,
        lock_time: u32,
    ) -> EngineResult<Item> {
        let mut shard = self.shard(key).write();
        let doc = shard.get_mut(key).ok_or(EngineError::KeyNotFound)?;
        if doc.meta.deleted || doc.is_expired(now_secs()) {
            return Err(EngineError::KeyNotFound);
        }
        if doc.is_locked() {
            return Err(EngineError::LockedTmpFail);
        }
        let lock_time = match lock_time {
            0 => DEFAULT_LOCK_SECONDS,
            t => t.min(MAX_LOCK_SECONDS),
        };
        doc.locked_until = Some(Instant::now() + Duration::from_secs(u64::from(lock_time)));
        doc.meta.cas = self.next_cas();
        Ok(Item {
            key: Bytes::copy_from_slice(key),
            value: doc.value.clone(),
            meta: doc.meta,
        })
    }

    fn unlock(&self, _token: CookieToken, key: &[u8], _vbucket: u16, cas: u64) -> EngineResult<()> {
        let mut shard = self.shard(key).write();
        let doc = shard.get_mut(key).ok_or(EngineError::KeyNotFound)?;
        if !doc.is_locked() {
            return Err(EngineError::TempFail);
        }
        if doc.meta.cas != cas {
            return Err(EngineError::Locked);
        }
        doc.locked_until = None;
        Ok(())
    }

    fn get_meta(&self, _token: CookieToken, key: &[u8], _vbucket: u16) -> EngineResult<ItemMeta> {
        let shard = self.shard(key).read();
        let doc = shard.get(key).ok_or(EngineError::KeyNotFound)?;
        Ok(doc.meta)
    }

    fn store(
        &self,
        _token: CookieToken,
        item: &Item,
        cas: u64,
        semantics: StoreSemantics,
        _durability: Option<DurabilityRequirement>,
        _vbucket: u16,
    ) -> EngineResult<ItemMeta> {
        let mut shard = self.shard(&item.key).write();
        let existing = shard.get(&item.key);
        let live = existing
            .filter(|doc| !doc.meta.deleted && !doc.is_expired(now_secs()));

        match semantics {
            StoreSemantics::Add => {
                if live.is_some() {
                    return Err(EngineError::KeyExists);
                }
            }
            StoreSemantics::Replace => {
                if live.is_none() {
                    return Err(EngineError::KeyNotFound);
                }
            }
            StoreSemantics::Set => {}
        }

        if let Some(doc) = live {
            if doc.is_locked() && doc.meta.cas != cas {
                return Err(EngineError::Locked);
            }
            if cas != 0 && doc.meta.cas != cas {
                return Err(EngineError::KeyExists);
            }
        } else if cas != 0 {
            // CAS against a missing document can never match.
            return Err(EngineError::KeyNotFound);
        }

        let rev_seqno = existing.map(|doc| doc.meta.rev_seqno + 1).unwrap_or(1);
        let meta = ItemMeta {
            cas: self.next_cas(),
            flags: item.meta.flags,
            exptime: absolute_exptime(item.meta.exptime),
            seqno: self.next_seqno(),
            rev_seqno,
            vbucket_uuid: self.vbucket_uuid,
            datatype: item.meta.datatype,
            deleted: false,
        };
        shard.insert(
            item.key.clone(),
            StoredDoc {
                value: item.value.clone(),
                meta,
                locked_until: None,
            },
        );
        Ok(meta)
    }

    fn remove(
        &self,
        _token: CookieToken,
        key: &[u8],
        _vbucket: u16,
        cas: u64,
        _durability: Option<DurabilityRequirement>,
    ) -> EngineResult<ItemMeta> {
        let mut shard = self.shard(key).write();
        let doc = shard.get_mut(key).ok_or(EngineError::KeyNotFound)?;
        if doc.meta.deleted || doc.is_expired(now_secs()) {
            return Err(EngineError::KeyNotFound);
        }
        if doc.is_locked() && doc.meta.cas != cas {
            return Err(EngineError::Locked);
        }
        if cas != 0 && doc.meta.cas != cas {
            return Err(EngineError::KeyExists);
        }
        doc.value = Bytes::new();
        doc.meta.deleted = true;
        doc.meta.cas = self.next_cas();
        doc.meta.seqno = self.next_seqno();
        doc.meta.rev_seqno += 1;
        doc.meta.datatype = Datatype::RAW;
        doc.locked_until = None;
        Ok(doc.meta)
    }

    fn allocate(
        &self,
        _token: CookieToken,
        key: &[u8],
        nbytes: usize,
        priv_bytes: usize,
        flags: u32,
        exptime: u32,
        datatype: Datatype,
        _vbucket: u16,
    ) -> EngineResult<Item> {
        if priv_bytes > PRIVILEGED_BYTES_LIMIT {
            return Err(EngineError::TooBig);
        }
        let _ = nbytes;
        Ok(Item {
            key: Bytes::copy_from_slice(key),
            value: Bytes::new(),
            meta: ItemMeta {
                flags,
                exptime: absolute_exptime(exptime),
                datatype,
                ..ItemMeta::default()
            },
        })
    }

    fn flush(&self, _token: CookieToken) -> EngineResult<()> {
        for shard in &self.shards {
            shard.write().clear();
        }
        Ok(())
    }

    fn stats(
        &self,
        _token: CookieToken,
        group: &str,
        emit: &mut StatCallback<'_>,
    ) -> EngineResult<()> {
        match group {
            "" => {
                emit("curr_items", &self.document_count().to_string());
                emit("high_seqno", &self.high_seqno().to_string());
                emit("vb_uuid", &self.vbucket_uuid.to_string());
            }
            _ => return Err(EngineError::KeyNotFound),
        }
        Ok(())
    }

    fn get_random_document(&self, _token: CookieToken) -> EngineResult<Item> {
        let now = now_secs();
        for shard in &self.shards {
            let shard = shard.read();
            if let Some((key, doc)) = shard
                .iter()
                .find(|(_, doc)| !doc.meta.deleted && !doc.is_expired(now))
            {
                return Ok(Item {
                    key: key.clone(),
                    value: doc.value.clone(),
                    meta: doc.meta,
                });
            }
        }
        Err(EngineError::KeyNotFound)
    }
}

impl DcpEngine for MemoryEngine {
    fn open(
        &self,
        conn: u64,
        _token: CookieToken,
        name: &str,
        flags: DcpOpenFlags,
    ) -> EngineResult<()> {
        self.dcp_sessions.lock().insert(
            conn,
            DcpSession {
                name: name.to_string(),
                flags,
                streams: VecDeque::new(),
            },
        );
        Ok(())
    }

    fn close(&self, conn: u64) {
        self.dcp_sessions.lock().remove(&conn);
    }

    fn add_stream(
        &self,
        _conn: u64,
        _token: CookieToken,
        _vbucket: u16,
        _flags: u32,
    ) -> EngineResult<()> {
        // Consumer-side streaming is not part of this engine.
        Err(EngineError::NotSupported)
    }

    fn close_stream(
        &self,
        conn: u64,
        _token: CookieToken,
        vbucket: u16,
        stream_id: Option<u16>,
    ) -> EngineResult<()> {
        let mut sessions = self.dcp_sessions.lock();
        let session = sessions.get_mut(&conn).ok_or(EngineError::KeyNotFound)?;
        let before = session.streams.len();
        session
            .streams
            .retain(|s| !(s.vbucket == vbucket && s.stream_id == stream_id));
        if session.streams.len() == before {
            return Err(EngineError::KeyNotFound);
        }
        Ok(())
    }

    fn stream_req(
        &self,
        conn: u64,
        _token: CookieToken,
        vbucket: u16,
        _flags: u32,
        start_seqno: u64,
        end_seqno: u64,
        _vbucket_uuid: u64,
        _snap_start: u64,
        _snap_end: u64,
        stream_id: Option<u16>,
    ) -> EngineResult<StreamReqOutcome> {
        let high = self.high_seqno();
        if start_seqno > high {
            return Ok(StreamReqOutcome::Rollback(high));
        }

        // Snapshot every document with a seqno inside the requested window.
        let end = end_seqno.min(high);
        let mut docs: Vec<(Bytes, StoredDoc)> = Vec::new();
        for shard in &self.shards {
            for (key, doc) in shard.read().iter() {
                if doc.meta.seqno > start_seqno && doc.meta.seqno <= end {
                    docs.push((key.clone(), doc.clone()));
                }
            }
        }
        docs.sort_by_key(|(_, doc)| doc.meta.seqno);

        let mut pending = VecDeque::with_capacity(docs.len() + 2);
        pending.push_back(DcpMessage::Marker {
            start: start_seqno,
            end,
        });
        for (key, doc) in docs {
            let item = Item {
                key,
                value: doc.value.clone(),
                meta: doc.meta,
            };
            if doc.meta.deleted {
                pending.push_back(DcpMessage::Deletion {
                    item,
                    delete_time: now_secs(),
                });
            } else {
                pending.push_back(DcpMessage::Mutation(item));
            }
        }
        pending.push_back(DcpMessage::StreamEnd);

        let mut sessions = self.dcp_sessions.lock();
        let session = sessions.get_mut(&conn).ok_or(EngineError::NoBucket)?;
        session.streams.push_back(ActiveStream {
            vbucket,
            opaque: 0,
            stream_id,
            pending,
        });

        Ok(StreamReqOutcome::Accepted {
            failover_log: vec![(self.vbucket_uuid, 0)],
        })
    }

    fn get_failover_log(
        &self,
        _conn: u64,
        _token: CookieToken,
        _vbucket: u16,
    ) -> EngineResult<Vec<(u64, u64)>> {
        Ok(vec![(self.vbucket_uuid, 0)])
    }

    fn step(
        &self,
        conn: u64,
        producers: &mut dyn DcpMessageProducers,
    ) -> EngineResult<StepOutcome> {
        let (message, vbucket, opaque, stream_id, include_delete_times, drained) = {
            let mut sessions = self.dcp_sessions.lock();
            let session = sessions.get_mut(&conn).ok_or(EngineError::NoBucket)?;
            let include_delete_times = session.flags.include_delete_times();
            let Some(stream) = session.streams.front_mut() else {
                return Ok(StepOutcome::Idle);
            };
            let Some(message) = stream.pending.pop_front() else {
                session.streams.pop_front();
                return Ok(StepOutcome::More);
            };
            let drained = stream.pending.is_empty();
            (
                message,
                stream.vbucket,
                stream.opaque,
                stream.stream_id,
                include_delete_times,
                drained,
            )
        };

        match message {
            DcpMessage::Marker { start, end } => {
                producers.marker(opaque, vbucket, start, end, 0x01, stream_id)?;
            }
            DcpMessage::Mutation(item) => {
                producers.mutation(opaque, item, vbucket, 0, 0, Bytes::new(), stream_id)?;
            }
            DcpMessage::Deletion { item, delete_time } => {
                if include_delete_times {
                    producers.deletion_v2(opaque, item, vbucket, delete_time, stream_id)?;
                } else {
                    producers.deletion(opaque, item, vbucket, Bytes::new(), stream_id)?;
                }
            }
            DcpMessage::StreamEnd => {
                producers.stream_end(opaque, vbucket, 0, stream_id)?;
            }
        }

        if drained {
            let mut sessions = self.dcp_sessions.lock();
            if let Some(session) = sessions.get_mut(&conn) {
                if session
                    .streams
                    .front()
                    .is_some_and(|s| s.pending.is_empty())
                {
                    session.streams.pop_front();
                }
            }
        }
        Ok(StepOutcome::More)
    }

    fn response_handler(&self, _conn: u64, _status: Status, _opaque: u32) -> EngineResult<()> {
        Ok(())
    }

    fn control(
        &self,
        conn: u64,
        _token: CookieToken,
        _key: &[u8],
        _value: &[u8],
    ) -> EngineResult<()> {
        if self.dcp_sessions.lock().contains_key(&conn) {
            Ok(())
        } else {
            Err(EngineError::NoBucket)
        }
    }

    fn buffer_acknowledgement(&self, _conn: u64, _vbucket: u16, _bytes: u32) -> EngineResult<()> {
        Ok(())
    }

    fn noop(&self, _conn: u64, _opaque: u32) -> EngineResult<()> {
        Ok(())
    }

    fn seqno_acknowledged(
        &self,
        _conn: u64,
        _vbucket: u16,
        _prepared_seqno: u64,
    ) -> EngineResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CookieToken {
        CookieToken {
            worker: 0,
            connection: 1,
            slot: 0,
        }
    }

    fn item(key: &[u8], value: &[u8]) -> Item {
        Item {
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
            meta: ItemMeta::default(),
        }
    }

    #[test]
    fn set_then_get() {
        let engine = MemoryEngine::new();
        let meta = engine
            .store(token(), &item(b"k", b"v"), 0, StoreSemantics::Set, None, 0)
            .unwrap();
        assert!(meta.cas != 0);

        let fetched = engine.get(token(), b"k", 0).unwrap();
        assert_eq!(&fetched.value[..], b"v");
        assert_eq!(fetched.meta.cas, meta.cas);
    }

    #[test]
    fn add_fails_on_existing() {
        let engine = MemoryEngine::new();
        engine
            .store(token(), &item(b"k", b"v"), 0, StoreSemantics::Set, None, 0)
            .unwrap();
        assert_eq!(
            engine.store(token(), &item(b"k", b"w"), 0, StoreSemantics::Add, None, 0),
            Err(EngineError::KeyExists)
        );
    }

    #[test]
    fn replace_fails_on_missing() {
        let engine = MemoryEngine::new();
        assert_eq!(
            engine.store(token(), &item(b"k", b"v"), 0, StoreSemantics::Replace, None, 0),
            Err(EngineError::KeyNotFound)
        );
    }

    #[test]
    fn cas_mismatch() {
        let engine = MemoryEngine::new();
        let meta = engine
            .store(token(), &item(b"k", b"v"), 0, StoreSemantics::Set, None, 0)
            .unwrap();
        assert_eq!(
            engine.store(
                token(),
                &item(b"k", b"w"),
                meta.cas + 100,
                StoreSemantics::Set,
                None,
                0
            ),
            Err(EngineError::KeyExists)
        );
        assert!(engine
            .store(token(), &item(b"k", b"w"), meta.cas, StoreSemantics::Set, None, 0)
            .is_ok());
    }

    #[test]
    fn remove_leaves_tombstone_meta() {
        let engine = MemoryEngine::new();
        engine
            .store(token(), &item(b"k", b"v"), 0, StoreSemantics::Set, None, 0)
            .unwrap();
        let tombstone = engine.remove(token(), b"k", 0, 0, None).unwrap();
        assert!(tombstone.deleted);
        assert_eq!(engine.get(token(), b"k", 0), Err(EngineError::KeyNotFound));
        let meta = engine.get_meta(token(), b"k", 0).unwrap();
        assert!(meta.deleted);
    }

    #[test]
    fn lock_blocks_plain_store() {
        let engine = MemoryEngine::new();
        engine
            .store(token(), &item(b"k", b"v"), 0, StoreSemantics::Set, None, 0)
            .unwrap();
        let locked = engine.get_locked(token(), b"k", 0, 15).unwrap();

        assert_eq!(
            engine.store(token(), &item(b"k", b"w"), 0, StoreSemantics::Set, None, 0),
            Err(EngineError::Locked)
        );
        // Second lock attempt is a temporary failure.
        assert_eq!(
            engine.get_locked(token(), b"k", 0, 15),
            Err(EngineError::LockedTmpFail)
        );
        // Unlock with the lock CAS releases it.
        engine.unlock(token(), b"k", 0, locked.meta.cas).unwrap();
        assert!(engine
            .store(token(), &item(b"k", b"w"), 0, StoreSemantics::Set, None, 0)
            .is_ok());
    }

    #[test]
    fn allocate_rejects_oversized_priv_bytes() {
        let engine = MemoryEngine::new();
        assert_eq!(
            engine
                .allocate(
                    token(),
                    b"k",
                    16,
                    PRIVILEGED_BYTES_LIMIT + 1,
                    0,
                    0,
                    Datatype::RAW,
                    0
                )
                .unwrap_err(),
            EngineError::TooBig
        );
    }

    #[test]
    fn stream_req_beyond_high_seqno_rolls_back() {
        let engine = MemoryEngine::new();
        engine.open(9, token(), "probe", DcpOpenFlags(1)).unwrap();
        match engine
            .stream_req(9, token(), 0, 0, 100, 200, 0, 0, 0, None)
            .unwrap()
        {
            StreamReqOutcome::Rollback(seqno) => assert_eq!(seqno, 0),
            other => panic!("expected rollback, got {other:?}"),
        }
    }
}
