//! Store executors: set, add, replace and their quiet variants.

use super::get::kv_engine;
use crate::engine::{EngineResult, Item, ItemMeta, StoreSemantics};
use crate::protocol::{ClientOpcode, Datatype, Status};
use crate::server::connection::Connection;
use crate::server::cookie::Cookie;
use bytes::Bytes;

/// Response extras for mutations when the client negotiated mutation
/// sequence numbers: vbucket uuid followed by the mutation seqno.
pub(super) fn mutation_extras(conn: &Connection, meta: &ItemMeta) -> Vec<u8> {
    if !conn.features().mutation_seqno {
        return Vec::new();
    }
    let mut extras = Vec::with_capacity(16);
    extras.extend_from_slice(&meta.vbucket_uuid.to_be_bytes());
    extras.extend_from_slice(&meta.seqno.to_be_bytes());
    extras
}

pub(super) fn mutation_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = kv_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let request = cookie.request().clone();
    let extras = request.extras();
    let flags = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);
    let exptime = u32::from_be_bytes([extras[4], extras[5], extras[6], extras[7]]);

    let (semantics, quiet) = match cookie.opcode() {
        Some(ClientOpcode::Set) => (StoreSemantics::Set, false),
        Some(ClientOpcode::Setq) => (StoreSemantics::Set, true),
        Some(ClientOpcode::Add) => (StoreSemantics::Add, false),
        Some(ClientOpcode::Addq) => (StoreSemantics::Add, true),
        Some(ClientOpcode::Replace) => (StoreSemantics::Replace, false),
        Some(ClientOpcode::Replaceq) => (StoreSemantics::Replace, true),
        _ => (StoreSemantics::Set, false),
    };

    let item = Item {
        key: Bytes::copy_from_slice(request.key()),
        value: request.value_bytes(),
        meta: ItemMeta {
            flags,
            exptime,
            datatype: Datatype::from_bits(request.header.datatype)
                .intersect(conn.permitted_datatypes()),
            ..ItemMeta::default()
        },
    };

    let meta = engine.store(
        token,
        &item,
        request.header.cas,
        semantics,
        cookie.durability,
        request.header.vbucket_or_status,
    )?;

    if quiet {
        return Ok(());
    }
    let extras = mutation_extras(conn, &meta);
    cookie.send_response(
        conn,
        Status::Success,
        &extras,
        &[],
        &[],
        Datatype::RAW,
        meta.cas,
    )
}
