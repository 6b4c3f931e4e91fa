//! CDC session executors: open, stream management, flow control.
//!
//! These handle the request side of a CDC conversation. The producer
//! data path (mutations, markers, stream-end) flows the other way,
//! through the producer shim invoked from the `ship_log` state.

use crate::engine::{DcpEngine, DcpOpenFlags, EngineError, EngineResult, StreamReqOutcome};
use crate::protocol::{Datatype, Status};
use crate::security::Privilege;
use crate::server::connection::{Connection, DcpState, PrivilegeOutcome};
use crate::server::cookie::Cookie;
use std::sync::Arc;
use tracing::{debug, info};

fn dcp_engine(conn: &Connection) -> EngineResult<Arc<dyn DcpEngine>> {
    conn.bucket()
        .engine()
        .and_then(|engine| engine.dcp.clone())
        .ok_or(EngineError::NotSupported)
}

pub(super) fn open_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let request = cookie.request().clone();
    let extras = request.extras();
    let flags = DcpOpenFlags(u32::from_be_bytes([
        extras[4], extras[5], extras[6], extras[7],
    ]));
    let name = String::from_utf8_lossy(request.key()).into_owned();

    // The privilege depends on the requested role, so the check happens
    // here rather than in the static chain.
    let required = if flags.is_producer() {
        Privilege::DcpProducer
    } else {
        Privilege::DcpConsumer
    };
    match conn.check_privilege(required) {
        PrivilegeOutcome::Granted => {}
        PrivilegeOutcome::Denied => {
            cookie.set_error_context(format!("no access to privilege {required:?}"));
            return Err(EngineError::AccessDenied);
        }
        PrivilegeOutcome::Stale => return Err(EngineError::AuthStale),
    }

    let engine = dcp_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    engine.open(conn.id(), token, &name, flags)?;

    conn.set_dcp(DcpState {
        producer: flags.is_producer(),
        flags,
    });
    // Replication traffic gets the large work budget.
    conn.set_priority(crate::server::config::ConnectionPriority::High);
    info!(
        "{}: CDC session \"{name}\" opened ({})",
        conn.id(),
        if flags.is_producer() {
            "producer"
        } else {
            "consumer"
        }
    );
    cookie.send_status(conn, Status::Success)
}

pub(super) fn add_stream_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = dcp_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let request = cookie.request().clone();
    let extras = request.extras();
    let flags = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);

    engine.add_stream(conn.id(), token, request.header.vbucket_or_status, flags)?;
    cookie.send_status(conn, Status::Success)
}

pub(super) fn close_stream_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = dcp_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let request = cookie.request().clone();
    let stream_id = cookie.stream_id;

    engine.close_stream(conn.id(), token, request.header.vbucket_or_status, stream_id)?;
    cookie.send_status(conn, Status::Success)
}

pub(super) fn stream_req_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = dcp_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let request = cookie.request().clone();
    let extras = request.extras();

    let flags = u32::from_be_bytes(extras[0..4].try_into().unwrap_or_default());
    let start_seqno = u64::from_be_bytes(extras[8..16].try_into().unwrap_or_default());
    let end_seqno = u64::from_be_bytes(extras[16..24].try_into().unwrap_or_default());
    let vbucket_uuid = u64::from_be_bytes(extras[24..32].try_into().unwrap_or_default());
    let snap_start = u64::from_be_bytes(extras[32..40].try_into().unwrap_or_default());
    let snap_end = u64::from_be_bytes(extras[40..48].try_into().unwrap_or_default());

    let outcome = engine.stream_req(
        conn.id(),
        token,
        request.header.vbucket_or_status,
        flags,
        start_seqno,
        end_seqno,
        vbucket_uuid,
        snap_start,
        snap_end,
        cookie.stream_id,
    )?;

    match outcome {
        StreamReqOutcome::Accepted { failover_log } => {
            debug!(
                "{}: stream request vb {} [{start_seqno}, {end_seqno}] accepted",
                conn.id(),
                request.header.vbucket_or_status
            );
            let body = encode_failover_log(&failover_log);
            cookie.send_response(conn, Status::Success, &[], &[], &body, Datatype::RAW, 0)
        }
        StreamReqOutcome::Rollback(seqno) => {
            debug!(
                "{}: stream request vb {} requires rollback to {seqno}",
                conn.id(),
                request.header.vbucket_or_status
            );
            cookie.send_response(
                conn,
                Status::Rollback,
                &[],
                &[],
                &seqno.to_be_bytes(),
                Datatype::RAW,
                0,
            )
        }
    }
}

pub(super) fn get_failover_log_executor(
    cookie: &mut Cookie,
    conn: &mut Connection,
) -> EngineResult<()> {
    let engine = dcp_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let request = cookie.request().clone();

    let log = engine.get_failover_log(conn.id(), token, request.header.vbucket_or_status)?;
    let body = encode_failover_log(&log);
    cookie.send_response(conn, Status::Success, &[], &[], &body, Datatype::RAW, 0)
}

fn encode_failover_log(log: &[(u64, u64)]) -> Vec<u8> {
    let mut body = Vec::with_capacity(log.len() * 16);
    for (uuid, seqno) in log {
        body.extend_from_slice(&uuid.to_be_bytes());
        body.extend_from_slice(&seqno.to_be_bytes());
    }
    body
}

pub(super) fn control_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = dcp_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let request = cookie.request().clone();

    engine.control(conn.id(), token, request.key(), request.value())?;
    cookie.send_status(conn, Status::Success)
}

pub(super) fn buffer_ack_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = dcp_engine(conn)?;
    let request = cookie.request().clone();
    let extras = request.extras();
    let bytes = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);

    // Flow-control acknowledgements are one-way.
    engine.buffer_acknowledgement(conn.id(), request.header.vbucket_or_status, bytes)?;
    let _ = cookie;
    Ok(())
}

pub(super) fn noop_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = dcp_engine(conn)?;
    engine.noop(conn.id(), cookie.opaque())?;
    cookie.send_status(conn, Status::Success)
}

pub(super) fn seqno_ack_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = dcp_engine(conn)?;
    let request = cookie.request().clone();
    let extras = request.extras();
    let prepared_seqno = u64::from_be_bytes(extras[0..8].try_into().unwrap_or_default());

    engine.seqno_acknowledged(conn.id(), request.header.vbucket_or_status, prepared_seqno)?;
    let _ = cookie;
    Ok(())
}

/// Data messages (mutation, deletion, markers, durability events) arrive
/// as requests only on consumer sessions, which this engine does not
/// provide.
pub(super) fn consumer_message_executor(
    cookie: &mut Cookie,
    conn: &mut Connection,
) -> EngineResult<()> {
    let _ = cookie;
    let _ = conn;
    Err(EngineError::NotSupported)
}
