//! Subdocument executors.
//!
//! Operate on paths inside a JSON document without shipping the whole
//! document to the client. Lookups parse the stored value and extract the
//! addressed element; mutations rewrite the document and re-store it
//! under CAS, retrying the read-modify-write on races. Extended
//! attributes live in a length-prefixed section ahead of the body when
//! the datatype carries the xattr bit; xattr-flagged operations address
//! that section instead of the body.

use super::context::{CommandContext, CAS_RETRY_LIMIT};
use super::get::kv_engine;
use super::mutation::mutation_extras;
use crate::engine::{EngineError, EngineResult, Item, ItemMeta, StoreSemantics};
use crate::protocol::{ClientOpcode, Datatype, Status};
use crate::server::connection::Connection;
use crate::server::cookie::Cookie;
use bytes::Bytes;
use serde_json::Value;
use std::collections::BTreeMap;

// Per-path operation flags.
const FLAG_MKDIR_P: u8 = 0x01;
const FLAG_XATTR: u8 = 0x04;

// Whole-document flags.
const DOC_FLAG_MKDOC: u8 = 0x01;
const DOC_FLAG_ADD: u8 = 0x02;
const DOC_FLAG_ACCESS_DELETED: u8 = 0x04;

/// A subdocument-level failure, carrying its wire status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubdocFailure(Status);

type SubdocResult<T> = Result<T, SubdocFailure>;

// === Path parsing ===

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(i64),
}

fn parse_path(path: &str) -> SubdocResult<Vec<Segment>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let mut segments = Vec::new();
    let mut rest = path;

    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped
                .find(']')
                .ok_or(SubdocFailure(Status::SubdocPathEinval))?;
            let index: i64 = stripped[..end]
                .parse()
                .map_err(|_| SubdocFailure(Status::SubdocPathEinval))?;
            segments.push(Segment::Index(index));
            rest = &stripped[end + 1..];
            rest = rest.strip_prefix('.').unwrap_or(rest);
            continue;
        }

        let split = rest
            .char_indices()
            .find(|(_, c)| *c == '.' || *c == '[')
            .map(|(i, c)| (i, c));
        match split {
            Some((i, '.')) => {
                if i == 0 {
                    return Err(SubdocFailure(Status::SubdocPathEinval));
                }
                segments.push(Segment::Key(rest[..i].to_string()));
                rest = &rest[i + 1..];
                if rest.is_empty() {
                    return Err(SubdocFailure(Status::SubdocPathEinval));
                }
            }
            Some((i, '[')) => {
                if i == 0 {
                    return Err(SubdocFailure(Status::SubdocPathEinval));
                }
                segments.push(Segment::Key(rest[..i].to_string()));
                rest = &rest[i..];
            }
            _ => {
                segments.push(Segment::Key(rest.to_string()));
                rest = "";
            }
        }
    }
    Ok(segments)
}

// === Navigation ===

fn lookup<'a>(doc: &'a Value, path: &[Segment]) -> SubdocResult<&'a Value> {
    let mut current = doc;
    for segment in path {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map
                .get(key)
                .ok_or(SubdocFailure(Status::SubdocPathEnoent))?,
            (Segment::Index(index), Value::Array(items)) => {
                let i = resolve_index(*index, items.len(), false)?;
                items
                    .get(i)
                    .ok_or(SubdocFailure(Status::SubdocPathEnoent))?
            }
            _ => return Err(SubdocFailure(Status::SubdocPathMismatch)),
        };
    }
    Ok(current)
}

fn resolve_index(index: i64, len: usize, insert: bool) -> SubdocResult<usize> {
    let bound = if insert { len as i64 } else { len as i64 - 1 };
    let resolved = if index < 0 {
        len as i64 + index + if insert { 1 } else { 0 }
    } else {
        index
    };
    if resolved < 0 || resolved > bound {
        return Err(SubdocFailure(Status::SubdocPathEnoent));
    }
    Ok(resolved as usize)
}

/// Walk to the parent of the addressed element, creating intermediate
/// objects when `create_parents` is set.
fn navigate_parent<'a>(
    doc: &'a mut Value,
    path: &[Segment],
    create_parents: bool,
) -> SubdocResult<&'a mut Value> {
    let mut current = doc;
    for segment in &path[..path.len() - 1] {
        current = match segment {
            Segment::Key(key) => {
                let map = current
                    .as_object_mut()
                    .ok_or(SubdocFailure(Status::SubdocPathMismatch))?;
                if !map.contains_key(key) {
                    if !create_parents {
                        return Err(SubdocFailure(Status::SubdocPathEnoent));
                    }
                    map.insert(key.clone(), Value::Object(Default::default()));
                }
                map.get_mut(key)
                    .ok_or(SubdocFailure(Status::SubdocPathEnoent))?
            }
            Segment::Index(index) => {
                let items = current
                    .as_array_mut()
                    .ok_or(SubdocFailure(Status::SubdocPathMismatch))?;
                let i = resolve_index(*index, items.len(), false)?;
                &mut items[i]
            }
        };
    }
    Ok(current)
}

// === Mutations on a parsed document ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutationKind {
    DictAdd,
    DictUpsert,
    Delete,
    Replace,
    ArrayPushLast,
    ArrayPushFirst,
    ArrayInsert,
    ArrayAddUnique,
    Counter,
}

impl MutationKind {
    fn from_opcode(opcode: ClientOpcode) -> Option<Self> {
        Some(match opcode {
            ClientOpcode::SubdocDictAdd => Self::DictAdd,
            ClientOpcode::SubdocDictUpsert => Self::DictUpsert,
            ClientOpcode::SubdocDelete => Self::Delete,
            ClientOpcode::SubdocReplace => Self::Replace,
            ClientOpcode::SubdocArrayPushLast => Self::ArrayPushLast,
            ClientOpcode::SubdocArrayPushFirst => Self::ArrayPushFirst,
            ClientOpcode::SubdocArrayInsert => Self::ArrayInsert,
            ClientOpcode::SubdocArrayAddUnique => Self::ArrayAddUnique,
            ClientOpcode::SubdocCounter => Self::Counter,
            _ => return None,
        })
    }
}

fn parse_fragment(raw: &[u8]) -> SubdocResult<Value> {
    serde_json::from_slice(raw).map_err(|_| SubdocFailure(Status::SubdocValueCantinsert))
}

/// Apply one mutation; returns the fragment to report (counters report
/// the new value).
fn apply_mutation(
    doc: &mut Value,
    kind: MutationKind,
    path: &[Segment],
    raw_value: &[u8],
    create_parents: bool,
) -> SubdocResult<Option<Value>> {
    if path.is_empty() {
        return Err(SubdocFailure(Status::SubdocPathEinval));
    }
    let parent = navigate_parent(doc, path, create_parents)?;
    let last = &path[path.len() - 1];

    match kind {
        MutationKind::DictAdd | MutationKind::DictUpsert => {
            let value = parse_fragment(raw_value)?;
            let Segment::Key(key) = last else {
                return Err(SubdocFailure(Status::SubdocPathMismatch));
            };
            let map = parent
                .as_object_mut()
                .ok_or(SubdocFailure(Status::SubdocPathMismatch))?;
            if kind == MutationKind::DictAdd && map.contains_key(key) {
                return Err(SubdocFailure(Status::SubdocPathEexists));
            }
            map.insert(key.clone(), value);
            Ok(None)
        }
        MutationKind::Delete => match (last, parent) {
            (Segment::Key(key), Value::Object(map)) => {
                map.remove(key)
                    .ok_or(SubdocFailure(Status::SubdocPathEnoent))?;
                Ok(None)
            }
            (Segment::Index(index), Value::Array(items)) => {
                let i = resolve_index(*index, items.len(), false)?;
                items.remove(i);
                Ok(None)
            }
            _ => Err(SubdocFailure(Status::SubdocPathMismatch)),
        },
        MutationKind::Replace => {
            let value = parse_fragment(raw_value)?;
            let target = match (last, parent) {
                (Segment::Key(key), Value::Object(map)) => map
                    .get_mut(key)
                    .ok_or(SubdocFailure(Status::SubdocPathEnoent))?,
                (Segment::Index(index), Value::Array(items)) => {
                    let i = resolve_index(*index, items.len(), false)?;
                    &mut items[i]
                }
                _ => return Err(SubdocFailure(Status::SubdocPathMismatch)),
            };
            *target = value;
            Ok(None)
        }
        MutationKind::ArrayPushLast | MutationKind::ArrayPushFirst => {
            let value = parse_fragment(raw_value)?;
            let array = array_at(parent, last, create_parents)?;
            if kind == MutationKind::ArrayPushLast {
                array.push(value);
            } else {
                array.insert(0, value);
            }
            Ok(None)
        }
        MutationKind::ArrayInsert => {
            let value = parse_fragment(raw_value)?;
            let Segment::Index(index) = last else {
                return Err(SubdocFailure(Status::SubdocPathEinval));
            };
            let items = parent
                .as_array_mut()
                .ok_or(SubdocFailure(Status::SubdocPathMismatch))?;
            let i = resolve_index(*index, items.len(), true)?;
            items.insert(i, value);
            Ok(None)
        }
        MutationKind::ArrayAddUnique => {
            let value = parse_fragment(raw_value)?;
            if value.is_object() || value.is_array() {
                return Err(SubdocFailure(Status::SubdocValueCantinsert));
            }
            let array = array_at(parent, last, create_parents)?;
            if array.contains(&value) {
                return Err(SubdocFailure(Status::SubdocPathEexists));
            }
            array.push(value);
            Ok(None)
        }
        MutationKind::Counter => {
            let delta = std::str::from_utf8(raw_value)
                .ok()
                .and_then(|text| text.trim().parse::<i64>().ok())
                .ok_or(SubdocFailure(Status::SubdocDeltaEinval))?;
            if delta == 0 {
                return Err(SubdocFailure(Status::SubdocDeltaEinval));
            }
            let Segment::Key(key) = last else {
                return Err(SubdocFailure(Status::SubdocPathMismatch));
            };
            let map = parent
                .as_object_mut()
                .ok_or(SubdocFailure(Status::SubdocPathMismatch))?;
            let current = match map.get(key) {
                Some(value) => value
                    .as_i64()
                    .ok_or(SubdocFailure(Status::SubdocPathMismatch))?,
                None => 0,
            };
            let updated = current
                .checked_add(delta)
                .ok_or(SubdocFailure(Status::SubdocNumErange))?;
            map.insert(key.clone(), Value::from(updated));
            Ok(Some(Value::from(updated)))
        }
    }
}

/// Address an array for a push, creating it when allowed.
fn array_at<'a>(
    parent: &'a mut Value,
    last: &Segment,
    create: bool,
) -> SubdocResult<&'a mut Vec<Value>> {
    let Segment::Key(key) = last else {
        // Pushing onto a nested array element, e.g. `a[0]`.
        let Segment::Index(index) = last else {
            return Err(SubdocFailure(Status::SubdocPathEinval));
        };
        let items = parent
            .as_array_mut()
            .ok_or(SubdocFailure(Status::SubdocPathMismatch))?;
        let i = resolve_index(*index, items.len(), false)?;
        return items[i]
            .as_array_mut()
            .ok_or(SubdocFailure(Status::SubdocPathMismatch));
    };
    let map = parent
        .as_object_mut()
        .ok_or(SubdocFailure(Status::SubdocPathMismatch))?;
    if !map.contains_key(key) {
        if !create {
            return Err(SubdocFailure(Status::SubdocPathEnoent));
        }
        map.insert(key.clone(), Value::Array(Vec::new()));
    }
    map.get_mut(key)
        .and_then(Value::as_array_mut)
        .ok_or(SubdocFailure(Status::SubdocPathMismatch))
}

// === Extended attribute section codec ===

/// Split a stored value into its xattr map and body per the xattr
/// datatype framing: a 4-byte total length, then `(pair length, key NUL
/// value NUL)` entries.
fn split_xattrs(value: &[u8], datatype: Datatype) -> SubdocResult<(BTreeMap<String, Value>, Bytes)> {
    if !datatype.is_xattr() {
        return Ok((BTreeMap::new(), Bytes::copy_from_slice(value)));
    }
    if value.len() < 4 {
        return Err(SubdocFailure(Status::XattrEinval));
    }
    let total = u32::from_be_bytes([value[0], value[1], value[2], value[3]]) as usize;
    if value.len() < 4 + total {
        return Err(SubdocFailure(Status::XattrEinval));
    }

    let mut xattrs = BTreeMap::new();
    let mut cursor = &value[4..4 + total];
    while !cursor.is_empty() {
        if cursor.len() < 4 {
            return Err(SubdocFailure(Status::XattrEinval));
        }
        let pair_len = u32::from_be_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]) as usize;
        cursor = &cursor[4..];
        if cursor.len() < pair_len {
            return Err(SubdocFailure(Status::XattrEinval));
        }
        let pair = &cursor[..pair_len];
        cursor = &cursor[pair_len..];

        let mut fields = pair.split(|byte| *byte == 0);
        let key = fields.next().ok_or(SubdocFailure(Status::XattrEinval))?;
        let raw = fields.next().ok_or(SubdocFailure(Status::XattrEinval))?;
        let key = String::from_utf8(key.to_vec())
            .map_err(|_| SubdocFailure(Status::XattrEinval))?;
        let parsed =
            serde_json::from_slice(raw).map_err(|_| SubdocFailure(Status::XattrEinval))?;
        xattrs.insert(key, parsed);
    }

    Ok((xattrs, Bytes::copy_from_slice(&value[4 + total..])))
}

fn join_xattrs(xattrs: &BTreeMap<String, Value>, body: &[u8]) -> (Bytes, bool) {
    if xattrs.is_empty() {
        return (Bytes::copy_from_slice(body), false);
    }
    let mut section = Vec::new();
    for (key, value) in xattrs {
        let raw = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
        let pair_len = key.len() + raw.len() + 2;
        section.extend_from_slice(&(pair_len as u32).to_be_bytes());
        section.extend_from_slice(key.as_bytes());
        section.push(0);
        section.extend_from_slice(&raw);
        section.push(0);
    }

    let mut out = Vec::with_capacity(4 + section.len() + body.len());
    out.extend_from_slice(&(section.len() as u32).to_be_bytes());
    out.extend_from_slice(&section);
    out.extend_from_slice(body);
    (Bytes::from(out), true)
}

// === Request decoding ===

struct SubdocRequest {
    path: String,
    value_offset: usize,
    flags: u8,
    doc_flags: u8,
    expiry: u32,
}

impl SubdocRequest {
    fn decode(cookie: &Cookie) -> SubdocResult<Self> {
        let frame = cookie.request();
        let extras = frame.extras();
        let path_len = usize::from(u16::from_be_bytes([extras[0], extras[1]]));
        let flags = extras[2];
        let (expiry, doc_flags) = match extras.len() {
            3 => (0, 0),
            4 => (0, extras[3]),
            7 => (
                u32::from_be_bytes([extras[3], extras[4], extras[5], extras[6]]),
                0,
            ),
            8 => (
                u32::from_be_bytes([extras[3], extras[4], extras[5], extras[6]]),
                extras[7],
            ),
            _ => return Err(SubdocFailure(Status::Einval)),
        };

        let body = frame.value();
        if path_len > body.len() {
            return Err(SubdocFailure(Status::Einval));
        }
        let path = std::str::from_utf8(&body[..path_len])
            .map_err(|_| SubdocFailure(Status::SubdocPathEinval))?
            .to_string();

        Ok(Self {
            path,
            value_offset: path_len,
            flags,
            doc_flags,
            expiry,
        })
    }

    fn is_xattr(&self) -> bool {
        self.flags & FLAG_XATTR != 0
    }

    fn create_parents(&self) -> bool {
        // Creating the document implies creating the path to the element.
        self.flags & FLAG_MKDIR_P != 0 || self.doc_flags & DOC_FLAG_MKDOC != 0
    }
}

// === Lookup executor ===

pub(super) fn lookup_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = kv_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let frame = cookie.request().clone();
    let opcode = cookie.opcode();

    let request = match SubdocRequest::decode(cookie) {
        Ok(request) => request,
        Err(SubdocFailure(status)) => return respond_subdoc_error(cookie, conn, status),
    };

    let item = engine.get(token, frame.key(), frame.header.vbucket_or_status)?;
    let result = run_lookup(&request, &item, opcode);
    match result {
        Ok(fragment) => cookie.send_response(
            conn,
            Status::Success,
            &[],
            &[],
            &fragment,
            Datatype::JSON,
            item.meta.cas,
        ),
        Err(SubdocFailure(status)) => {
            cookie.cas = item.meta.cas;
            respond_subdoc_error(cookie, conn, status)
        }
    }
}

fn run_lookup(
    request: &SubdocRequest,
    item: &Item,
    opcode: Option<ClientOpcode>,
) -> SubdocResult<Vec<u8>> {
    let (xattrs, body) = split_xattrs(&item.value, item.meta.datatype)?;

    let doc: Value = if request.is_xattr() {
        Value::Object(xattrs.into_iter().collect())
    } else {
        serde_json::from_slice(&body).map_err(|_| SubdocFailure(Status::SubdocDocNotJson))?
    };
    let path = parse_path(&request.path)?;
    let target = lookup(&doc, &path)?;

    match opcode {
        Some(ClientOpcode::SubdocExists) => Ok(Vec::new()),
        Some(ClientOpcode::SubdocGetCount) => {
            let count = match target {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                _ => return Err(SubdocFailure(Status::SubdocPathMismatch)),
            };
            Ok(count.to_string().into_bytes())
        }
        _ => serde_json::to_vec(target).map_err(|_| SubdocFailure(Status::SubdocDocNotJson)),
    }
}

// === Mutation context ===

enum SubdocState {
    GetItem,
    StoreItem {
        item: Item,
        cas: u64,
        semantics: StoreSemantics,
        fragment: Option<Value>,
    },
}

pub(super) struct SubdocMutationContext {
    state: SubdocState,
    retries: u32,
}

impl SubdocMutationContext {
    fn new() -> Self {
        Self {
            state: SubdocState::GetItem,
            retries: 0,
        }
    }

    /// Release per-attempt resources and restart after a CAS race.
    fn reset(&mut self) {
        self.state = SubdocState::GetItem;
    }
}

impl CommandContext for SubdocMutationContext {
    fn step(&mut self, cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
        let engine = kv_engine(conn)?;
        let token = conn.token_for(cookie.slot());
        let frame = cookie.request().clone();
        let vbucket = frame.header.vbucket_or_status;
        let opcode = cookie.opcode();

        let request = match SubdocRequest::decode(cookie) {
            Ok(request) => request,
            Err(SubdocFailure(status)) => return respond_subdoc_error(cookie, conn, status),
        };
        let Some(kind) = opcode.and_then(MutationKind::from_opcode) else {
            return Err(EngineError::Invalid);
        };

        loop {
            match &self.state {
                SubdocState::GetItem => {
                    let existing = match engine.get(token, frame.key(), vbucket) {
                        Ok(item) => {
                            if request.doc_flags & DOC_FLAG_ADD != 0 {
                                return Err(EngineError::KeyExists);
                            }
                            Some(item)
                        }
                        Err(EngineError::KeyNotFound)
                            if request.doc_flags & (DOC_FLAG_MKDOC | DOC_FLAG_ADD) != 0 =>
                        {
                            None
                        }
                        Err(e) => return Err(e),
                    };

                    let outcome = build_mutation(&request, existing.as_ref(), kind, &frame);
                    match outcome {
                        Ok((item, cas, semantics, fragment)) => {
                            self.state = SubdocState::StoreItem {
                                item,
                                cas,
                                semantics,
                                fragment,
                            };
                        }
                        Err(SubdocFailure(status)) => {
                            cookie.cas =
                                existing.map(|item| item.meta.cas).unwrap_or_default();
                            return respond_subdoc_error(cookie, conn, status);
                        }
                    }
                }
                SubdocState::StoreItem {
                    item,
                    cas,
                    semantics,
                    fragment,
                } => {
                    let request_cas = frame.header.cas;
                    let effective_cas = if request_cas != 0 { request_cas } else { *cas };
                    match engine.store(
                        token,
                        item,
                        effective_cas,
                        *semantics,
                        cookie.durability,
                        vbucket,
                    ) {
                        Ok(meta) => {
                            let body = fragment
                                .as_ref()
                                .map(|value| serde_json::to_vec(value).unwrap_or_default())
                                .unwrap_or_default();
                            let extras = mutation_extras(conn, &meta);
                            return cookie.send_response(
                                conn,
                                Status::Success,
                                &extras,
                                &[],
                                &body,
                                if body.is_empty() {
                                    Datatype::RAW
                                } else {
                                    Datatype::JSON
                                },
                                meta.cas,
                            );
                        }
                        Err(EngineError::KeyExists) | Err(EngineError::KeyNotFound)
                            if request_cas == 0 =>
                        {
                            self.retries += 1;
                            if self.retries > CAS_RETRY_LIMIT {
                                return Err(EngineError::TempFail);
                            }
                            self.reset();
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

type MutationPlan = (Item, u64, StoreSemantics, Option<Value>);

fn build_mutation(
    request: &SubdocRequest,
    existing: Option<&Item>,
    kind: MutationKind,
    frame: &crate::protocol::Frame,
) -> SubdocResult<MutationPlan> {
    let (mut xattrs, body) = match existing {
        Some(item) => split_xattrs(&item.value, item.meta.datatype)?,
        None => (BTreeMap::new(), Bytes::from_static(b"{}")),
    };

    let raw_value = &frame.value()[request.value_offset..];
    let path = parse_path(&request.path)?;

    let (new_value, fragment, datatype) = if request.is_xattr() {
        let mut doc = Value::Object(xattrs.clone().into_iter().collect());
        let fragment = apply_mutation(&mut doc, kind, &path, raw_value, request.create_parents())?;
        xattrs = doc
            .as_object()
            .map(|map| map.clone().into_iter().collect())
            .unwrap_or_default();
        let (joined, has_xattrs) = join_xattrs(&xattrs, &body);
        let mut datatype = existing
            .map(|item| item.meta.datatype)
            .unwrap_or(Datatype::JSON);
        if has_xattrs {
            datatype = datatype.union(Datatype::XATTR);
        }
        (joined, fragment, datatype)
    } else {
        let mut doc: Value =
            serde_json::from_slice(&body).map_err(|_| SubdocFailure(Status::SubdocDocNotJson))?;
        let fragment = apply_mutation(&mut doc, kind, &path, raw_value, request.create_parents())?;
        let serialized =
            serde_json::to_vec(&doc).map_err(|_| SubdocFailure(Status::SubdocDocNotJson))?;
        let (joined, has_xattrs) = join_xattrs(&xattrs, &serialized);
        let mut datatype = Datatype::JSON;
        if has_xattrs {
            datatype = datatype.union(Datatype::XATTR);
        }
        (joined, fragment, datatype)
    };

    let (cas, semantics, meta) = match existing {
        Some(item) => (item.meta.cas, StoreSemantics::Set, item.meta),
        None => (
            0,
            StoreSemantics::Add,
            ItemMeta {
                exptime: request.expiry,
                ..ItemMeta::default()
            },
        ),
    };

    let item = Item {
        key: Bytes::copy_from_slice(frame.key()),
        value: new_value,
        meta: ItemMeta {
            datatype,
            exptime: if request.expiry != 0 {
                request.expiry
            } else {
                meta.exptime
            },
            ..meta
        },
    };
    Ok((item, cas, semantics, fragment))
}

fn respond_subdoc_error(
    cookie: &mut Cookie,
    conn: &mut Connection,
    status: Status,
) -> EngineResult<()> {
    cookie.send_status(conn, status)
}

pub(super) fn mutation_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    super::run_context(cookie, conn, |_cookie, _conn| {
        Ok(Box::new(SubdocMutationContext::new()))
    })
}

// === Multi-path operations ===

struct MultiSpec {
    opcode: u8,
    flags: u8,
    path: String,
    value: Vec<u8>,
}

fn parse_multi_specs(body: &[u8], mutations: bool) -> SubdocResult<Vec<MultiSpec>> {
    let mut specs = Vec::new();
    let mut cursor = body;
    while !cursor.is_empty() {
        let header_len = if mutations { 8 } else { 4 };
        if cursor.len() < header_len {
            return Err(SubdocFailure(Status::Einval));
        }
        let opcode = cursor[0];
        let flags = cursor[1];
        let path_len = usize::from(u16::from_be_bytes([cursor[2], cursor[3]]));
        let value_len = if mutations {
            u32::from_be_bytes([cursor[4], cursor[5], cursor[6], cursor[7]]) as usize
        } else {
            0
        };
        cursor = &cursor[header_len..];

        if cursor.len() < path_len + value_len {
            return Err(SubdocFailure(Status::Einval));
        }
        let path = std::str::from_utf8(&cursor[..path_len])
            .map_err(|_| SubdocFailure(Status::SubdocPathEinval))?
            .to_string();
        let value = cursor[path_len..path_len + value_len].to_vec();
        cursor = &cursor[path_len + value_len..];

        specs.push(MultiSpec {
            opcode,
            flags,
            path,
            value,
        });
    }
    if specs.is_empty() {
        return Err(SubdocFailure(Status::Einval));
    }
    Ok(specs)
}

fn multi_doc_flags(frame: &crate::protocol::Frame) -> (u32, u8) {
    let extras = frame.extras();
    match extras.len() {
        1 => (0, extras[0]),
        4 => (
            u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]),
            0,
        ),
        5 => (
            u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]),
            extras[4],
        ),
        _ => (0, 0),
    }
}

pub(super) fn multi_lookup_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = kv_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let frame = cookie.request().clone();

    let specs = match parse_multi_specs(frame.value(), false) {
        Ok(specs) => specs,
        Err(SubdocFailure(status)) => return respond_subdoc_error(cookie, conn, status),
    };

    let item = engine.get(token, frame.key(), frame.header.vbucket_or_status)?;
    let (xattrs, body) = match split_xattrs(&item.value, item.meta.datatype) {
        Ok(split) => split,
        Err(SubdocFailure(status)) => return respond_subdoc_error(cookie, conn, status),
    };
    let doc: Option<Value> = serde_json::from_slice(&body).ok();
    let xattr_doc = Value::Object(xattrs.into_iter().collect());

    let mut response = Vec::new();
    let mut any_failed = false;
    for spec in &specs {
        let result = (|| -> SubdocResult<Vec<u8>> {
            let source = if spec.flags & FLAG_XATTR != 0 {
                &xattr_doc
            } else {
                doc.as_ref()
                    .ok_or(SubdocFailure(Status::SubdocDocNotJson))?
            };
            let path = parse_path(&spec.path)?;
            let target = lookup(source, &path)?;
            match ClientOpcode::from_u8(spec.opcode) {
                Some(ClientOpcode::SubdocExists) => Ok(Vec::new()),
                Some(ClientOpcode::SubdocGetCount) => {
                    let count = match target {
                        Value::Array(items) => items.len(),
                        Value::Object(map) => map.len(),
                        _ => return Err(SubdocFailure(Status::SubdocPathMismatch)),
                    };
                    Ok(count.to_string().into_bytes())
                }
                Some(ClientOpcode::SubdocGet) | Some(ClientOpcode::Get) => {
                    serde_json::to_vec(target)
                        .map_err(|_| SubdocFailure(Status::SubdocDocNotJson))
                }
                _ => Err(SubdocFailure(Status::SubdocInvalidCombo)),
            }
        })();

        let (status, payload) = match result {
            Ok(payload) => (Status::Success, payload),
            Err(SubdocFailure(status)) => {
                any_failed = true;
                (status, Vec::new())
            }
        };
        response.extend_from_slice(&(status as u16).to_be_bytes());
        response.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        response.extend_from_slice(&payload);
    }

    let status = if any_failed {
        Status::SubdocMultiPathFailure
    } else {
        Status::Success
    };
    cookie.send_response(
        conn,
        status,
        &[],
        &[],
        &response,
        Datatype::RAW,
        item.meta.cas,
    )
}

pub(super) fn multi_mutation_executor(
    cookie: &mut Cookie,
    conn: &mut Connection,
) -> EngineResult<()> {
    super::run_context(cookie, conn, |_cookie, _conn| {
        Ok(Box::new(MultiMutationContext { retries: 0 }))
    })
}

struct MultiMutationContext {
    retries: u32,
}

impl CommandContext for MultiMutationContext {
    fn step(&mut self, cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
        let engine = kv_engine(conn)?;
        let token = conn.token_for(cookie.slot());
        let frame = cookie.request().clone();
        let vbucket = frame.header.vbucket_or_status;
        let (expiry, doc_flags) = multi_doc_flags(&frame);

        let specs = match parse_multi_specs(frame.value(), true) {
            Ok(specs) => specs,
            Err(SubdocFailure(status)) => return respond_subdoc_error(cookie, conn, status),
        };

        loop {
            let existing = match engine.get(token, frame.key(), vbucket) {
                Ok(item) => {
                    if doc_flags & DOC_FLAG_ADD != 0 {
                        return Err(EngineError::KeyExists);
                    }
                    Some(item)
                }
                Err(EngineError::KeyNotFound)
                    if doc_flags & (DOC_FLAG_MKDOC | DOC_FLAG_ADD) != 0 =>
                {
                    None
                }
                Err(e) => return Err(e),
            };

            let (mut xattrs, body) = match existing
                .as_ref()
                .map(|item| split_xattrs(&item.value, item.meta.datatype))
                .unwrap_or_else(|| Ok((BTreeMap::new(), Bytes::from_static(b"{}"))))
            {
                Ok(split) => split,
                Err(SubdocFailure(status)) => return respond_subdoc_error(cookie, conn, status),
            };

            let mut doc: Value = match serde_json::from_slice(&body) {
                Ok(doc) => doc,
                Err(_) => return respond_subdoc_error(cookie, conn, Status::SubdocDocNotJson),
            };
            let mut xattr_doc = Value::Object(xattrs.clone().into_iter().collect());

            // Apply every operation; the first failure aborts the whole
            // mutation and reports the failing index.
            let mut results: Vec<(u8, Value)> = Vec::new();
            let mut failure: Option<(u8, Status)> = None;
            for (index, spec) in specs.iter().enumerate() {
                let Some(kind) = ClientOpcode::from_u8(spec.opcode)
                    .and_then(MutationKind::from_opcode)
                else {
                    failure = Some((index as u8, Status::SubdocInvalidCombo));
                    break;
                };
                let target = if spec.flags & FLAG_XATTR != 0 {
                    &mut xattr_doc
                } else {
                    &mut doc
                };
                let create = spec.flags & FLAG_MKDIR_P != 0 || doc_flags & DOC_FLAG_MKDOC != 0;
                match parse_path(&spec.path)
                    .and_then(|path| apply_mutation(target, kind, &path, &spec.value, create))
                {
                    Ok(Some(fragment)) => results.push((index as u8, fragment)),
                    Ok(None) => {}
                    Err(SubdocFailure(status)) => {
                        failure = Some((index as u8, status));
                        break;
                    }
                }
            }

            if let Some((index, status)) = failure {
                let mut body = Vec::with_capacity(3);
                body.push(index);
                body.extend_from_slice(&(status as u16).to_be_bytes());
                return cookie.send_response(
                    conn,
                    Status::SubdocMultiPathFailure,
                    &[],
                    &[],
                    &body,
                    Datatype::RAW,
                    existing.map(|item| item.meta.cas).unwrap_or_default(),
                );
            }

            xattrs = xattr_doc
                .as_object()
                .map(|map| map.clone().into_iter().collect())
                .unwrap_or_default();
            let serialized = match serde_json::to_vec(&doc) {
                Ok(serialized) => serialized,
                Err(_) => return respond_subdoc_error(cookie, conn, Status::SubdocDocNotJson),
            };
            let (value, has_xattrs) = join_xattrs(&xattrs, &serialized);
            let mut datatype = Datatype::JSON;
            if has_xattrs {
                datatype = datatype.union(Datatype::XATTR);
            }

            let (cas, semantics, old_meta) = match existing.as_ref() {
                Some(item) => (item.meta.cas, StoreSemantics::Set, item.meta),
                None => (0, StoreSemantics::Add, ItemMeta::default()),
            };
            let item = Item {
                key: Bytes::copy_from_slice(frame.key()),
                value,
                meta: ItemMeta {
                    datatype,
                    exptime: if expiry != 0 { expiry } else { old_meta.exptime },
                    ..old_meta
                },
            };

            let request_cas = frame.header.cas;
            let effective_cas = if request_cas != 0 { request_cas } else { cas };
            match engine.store(token, &item, effective_cas, semantics, cookie.durability, vbucket)
            {
                Ok(meta) => {
                    // Successful mutation: per-op results only for ops
                    // that produced a fragment (counters).
                    let mut body = Vec::new();
                    for (index, fragment) in results {
                        let payload = serde_json::to_vec(&fragment).unwrap_or_default();
                        body.push(index);
                        body.extend_from_slice(&(Status::Success as u16).to_be_bytes());
                        body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                        body.extend_from_slice(&payload);
                    }
                    let extras = mutation_extras(conn, &meta);
                    return cookie.send_response(
                        conn,
                        Status::Success,
                        &extras,
                        &[],
                        &body,
                        Datatype::RAW,
                        meta.cas,
                    );
                }
                Err(EngineError::KeyExists) | Err(EngineError::KeyNotFound)
                    if request_cas == 0 =>
                {
                    self.retries += 1;
                    if self.retries > CAS_RETRY_LIMIT {
                        return Err(EngineError::TempFail);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(text: &str) -> Vec<Segment> {
        parse_path(text).unwrap()
    }

    #[test]
    fn path_parsing() {
        assert_eq!(path("a"), vec![Segment::Key("a".into())]);
        assert_eq!(
            path("a.b.c"),
            vec![
                Segment::Key("a".into()),
                Segment::Key("b".into()),
                Segment::Key("c".into())
            ]
        );
        assert_eq!(
            path("a[3]"),
            vec![Segment::Key("a".into()), Segment::Index(3)]
        );
        assert_eq!(
            path("a[-1].b"),
            vec![
                Segment::Key("a".into()),
                Segment::Index(-1),
                Segment::Key("b".into())
            ]
        );
        assert!(parse_path("a..b").is_err());
        assert!(parse_path("a[x]").is_err());
        assert!(parse_path(".a").is_err());
    }

    #[test]
    fn lookup_paths() {
        let doc = json!({"x": {"y": [1, 2, 3]}});
        assert_eq!(lookup(&doc, &path("x.y[0]")).unwrap(), &json!(1));
        assert_eq!(lookup(&doc, &path("x.y[-1]")).unwrap(), &json!(3));
        assert_eq!(
            lookup(&doc, &path("x.z")).unwrap_err(),
            SubdocFailure(Status::SubdocPathEnoent)
        );
        assert_eq!(
            lookup(&doc, &path("x.y.z")).unwrap_err(),
            SubdocFailure(Status::SubdocPathMismatch)
        );
    }

    #[test]
    fn dict_add_and_upsert() {
        let mut doc = json!({"a": 1});
        apply_mutation(&mut doc, MutationKind::DictAdd, &path("b"), b"2", false).unwrap();
        assert_eq!(doc, json!({"a": 1, "b": 2}));

        // Add refuses to overwrite, upsert does not.
        assert_eq!(
            apply_mutation(&mut doc, MutationKind::DictAdd, &path("b"), b"3", false).unwrap_err(),
            SubdocFailure(Status::SubdocPathEexists)
        );
        apply_mutation(&mut doc, MutationKind::DictUpsert, &path("b"), b"3", false).unwrap();
        assert_eq!(doc, json!({"a": 1, "b": 3}));
    }

    #[test]
    fn counter_creates_and_adds() {
        let mut doc = json!({});
        let fragment =
            apply_mutation(&mut doc, MutationKind::Counter, &path("x.y"), b"1", true).unwrap();
        assert_eq!(fragment, Some(json!(1)));
        assert_eq!(doc, json!({"x": {"y": 1}}));

        let fragment =
            apply_mutation(&mut doc, MutationKind::Counter, &path("x.y"), b"41", true).unwrap();
        assert_eq!(fragment, Some(json!(42)));
    }

    #[test]
    fn counter_overflow_is_erange() {
        let mut doc = json!({"n": i64::MAX});
        assert_eq!(
            apply_mutation(&mut doc, MutationKind::Counter, &path("n"), b"1", false).unwrap_err(),
            SubdocFailure(Status::SubdocNumErange)
        );
    }

    #[test]
    fn array_operations() {
        let mut doc = json!({"a": [1, 3]});
        apply_mutation(&mut doc, MutationKind::ArrayPushLast, &path("a"), b"4", false).unwrap();
        apply_mutation(&mut doc, MutationKind::ArrayPushFirst, &path("a"), b"0", false).unwrap();
        apply_mutation(&mut doc, MutationKind::ArrayInsert, &path("a[2]"), b"2", false).unwrap();
        assert_eq!(doc, json!({"a": [0, 1, 2, 3, 4]}));

        assert_eq!(
            apply_mutation(&mut doc, MutationKind::ArrayAddUnique, &path("a"), b"2", false)
                .unwrap_err(),
            SubdocFailure(Status::SubdocPathEexists)
        );
        apply_mutation(&mut doc, MutationKind::ArrayAddUnique, &path("a"), b"9", false).unwrap();
        assert_eq!(doc, json!({"a": [0, 1, 2, 3, 4, 9]}));
    }

    #[test]
    fn delete_and_replace() {
        let mut doc = json!({"a": {"b": 1}, "c": [1, 2]});
        apply_mutation(&mut doc, MutationKind::Delete, &path("a.b"), b"", false).unwrap();
        apply_mutation(&mut doc, MutationKind::Replace, &path("c[0]"), b"9", false).unwrap();
        assert_eq!(doc, json!({"a": {}, "c": [9, 2]}));
    }

    #[test]
    fn xattr_round_trip() {
        let mut xattrs = BTreeMap::new();
        xattrs.insert("meta".to_string(), json!({"rev": 7}));
        let (joined, has) = join_xattrs(&xattrs, b"{\"v\":1}");
        assert!(has);

        let (parsed, body) =
            split_xattrs(&joined, Datatype::JSON.union(Datatype::XATTR)).unwrap();
        assert_eq!(parsed.get("meta"), Some(&json!({"rev": 7})));
        assert_eq!(&body[..], b"{\"v\":1}");
    }

    #[test]
    fn multi_spec_parsing() {
        // One lookup spec: SubdocGet "a.b"
        let mut body = Vec::new();
        body.push(ClientOpcode::SubdocGet as u8);
        body.push(0);
        body.extend_from_slice(&3u16.to_be_bytes());
        body.extend_from_slice(b"a.b");
        let specs = parse_multi_specs(&body, false).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].path, "a.b");

        assert!(parse_multi_specs(&[], false).is_err());
        assert!(parse_multi_specs(&[0xc5, 0], false).is_err());
    }
}
