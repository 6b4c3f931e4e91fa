//! Retrieval executors: get family, touch, locks, metadata.

use crate::engine::{EngineError, EngineResult, Item, KvEngine};
use crate::protocol::{ClientOpcode, Datatype, Status};
use crate::server::connection::Connection;
use crate::server::cookie::Cookie;
use std::sync::Arc;

/// Resolve the KV engine for the connection's bucket, failing with
/// `NoBucket` on the sentinel.
pub(super) fn kv_engine(conn: &Connection) -> EngineResult<Arc<dyn KvEngine>> {
    conn.bucket()
        .engine()
        .map(|engine| engine.kv.clone())
        .ok_or(EngineError::NoBucket)
}

fn send_item(
    cookie: &mut Cookie,
    conn: &mut Connection,
    item: &Item,
    include_key: bool,
) -> EngineResult<()> {
    let extras = item.meta.flags.to_be_bytes();
    let key: &[u8] = if include_key { &item.key } else { &[] };
    cookie.send_response(
        conn,
        Status::Success,
        &extras,
        key,
        &item.value,
        item.meta.datatype,
        item.meta.cas,
    )
}

pub(super) fn get_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = kv_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let request = cookie.request().clone();
    let opcode = cookie.opcode();

    match engine.get(token, request.key(), request.header.vbucket_or_status) {
        Ok(item) => {
            let include_key = matches!(
                opcode,
                Some(ClientOpcode::Getk) | Some(ClientOpcode::Getkq)
            );
            send_item(cookie, conn, &item, include_key)
        }
        Err(EngineError::KeyNotFound)
            if opcode.is_some_and(ClientOpcode::is_quiet) =>
        {
            // Quiet gets swallow the miss.
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub(super) fn touch_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = kv_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let request = cookie.request().clone();
    let extras = request.extras();
    let exptime = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);

    let meta = engine.touch(token, request.key(), request.header.vbucket_or_status, exptime)?;
    cookie.send_response(conn, Status::Success, &[], &[], &[], Datatype::RAW, meta.cas)
}

pub(super) fn gat_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = kv_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let request = cookie.request().clone();
    let extras = request.extras();
    let exptime = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);

    match engine.get_and_touch(
        token,
        request.key(),
        request.header.vbucket_or_status,
        exptime,
    ) {
        Ok(item) => send_item(cookie, conn, &item, false),
        Err(EngineError::KeyNotFound)
            if cookie.opcode() == Some(ClientOpcode::Gatq) =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub(super) fn get_locked_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = kv_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let request = cookie.request().clone();
    let lock_time = if request.header.extras_len == 4 {
        let extras = request.extras();
        u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
    } else {
        0
    };

    let item = engine.get_locked(
        token,
        request.key(),
        request.header.vbucket_or_status,
        lock_time,
    )?;
    send_item(cookie, conn, &item, false)
}

pub(super) fn unlock_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = kv_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let request = cookie.request().clone();

    engine.unlock(
        token,
        request.key(),
        request.header.vbucket_or_status,
        request.header.cas,
    )?;
    cookie.send_status(conn, Status::Success)
}

pub(super) fn get_meta_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = kv_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let request = cookie.request().clone();
    let version = if request.header.extras_len == 1 {
        request.extras()[0]
    } else {
        1
    };

    match engine.get_meta(token, request.key(), request.header.vbucket_or_status) {
        Ok(meta) => {
            let mut extras = Vec::with_capacity(21);
            extras.extend_from_slice(&u32::from(meta.deleted).to_be_bytes());
            extras.extend_from_slice(&meta.flags.to_be_bytes());
            extras.extend_from_slice(&meta.exptime.to_be_bytes());
            extras.extend_from_slice(&meta.seqno.to_be_bytes());
            if version == 2 {
                extras.push(meta.datatype.bits());
            }
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
        Err(EngineError::KeyNotFound)
            if cookie.opcode() == Some(ClientOpcode::GetqMeta) =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub(super) fn get_random_key_executor(
    cookie: &mut Cookie,
    conn: &mut Connection,
) -> EngineResult<()> {
    let engine = kv_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let item = engine.get_random_document(token)?;
    send_item(cookie, conn, &item, true)
}
