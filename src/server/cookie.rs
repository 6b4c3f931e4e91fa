//! Per-in-flight-request context.
//!
//! A cookie is created when a request is parsed and lives until its
//! response has been queued (unordered mode) or the connection advances
//! to the next request (ordered mode). It carries the captured packet,
//! the CAS to inject into the response, diagnostic error context, the
//! stateful command context of multi-step executors, and the blocked
//! flag tying it to a pending-I/O completion.

use super::connection::Connection;
use crate::commands::CommandContext;
use crate::engine::{EngineError, EngineResult};
use crate::protocol::{
    encode_raw_frame_info, ClientOpcode, Datatype, DurabilityRequirement, Frame, ResponseBuilder,
    Status,
};
use bytes::{Bytes, BytesMut};
use serde_json::json;
use std::time::Instant;
use uuid::Uuid;

/// Response frame-info id carrying the server-side processing duration.
const SERVER_DURATION_FRAME_INFO: u16 = 0;

/// What to do with an engine error on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Send a response with this status and carry on
    Respond(Status),
    /// The client cannot handle the status; terminate the connection
    Disconnect,
}

/// Per-request state bound to a connection.
pub struct Cookie {
    slot: u8,
    frame: Frame,
    received: Instant,
    /// CAS injected into the response when the executor passes zero
    pub cas: u64,
    /// Status of the last pending-I/O completion
    pub ai_status: Option<EngineResult<()>>,
    /// True while waiting for an engine completion
    pub blocked: bool,
    /// Stateful executor for multi-step commands
    pub context: Option<Box<dyn CommandContext>>,
    /// Reorder permission from the frame infos
    pub reorder: bool,
    /// Durability requirement from the frame infos
    pub durability: Option<DurabilityRequirement>,
    /// Stream id from the frame infos
    pub stream_id: Option<u16>,
    /// Tracing context blob from the frame infos
    pub tracing_context: Option<Vec<u8>>,
    /// Engine-owned opaque storage
    pub engine_storage: Option<Box<dyn std::any::Any + Send>>,
    error_context: Option<String>,
    event_id: Option<Uuid>,
    error_extras: Option<serde_json::Value>,
    refcount: u8,
    response_queued: bool,
}

impl Cookie {
    /// Create a cookie for a parsed request.
    ///
    /// With `copy` the packet body is copied into a private buffer;
    /// otherwise the cookie shares the receive buffer's storage until the
    /// packet is consumed.
    pub fn new(slot: u8, mut frame: Frame, copy: bool) -> Self {
        if copy {
            frame.body = Bytes::copy_from_slice(&frame.body);
        }
        Self {
            slot,
            frame,
            received: Instant::now(),
            cas: 0,
            ai_status: None,
            blocked: false,
            context: None,
            reorder: false,
            durability: None,
            stream_id: None,
            tracing_context: None,
            engine_storage: None,
            error_context: None,
            event_id: None,
            error_extras: None,
            refcount: 1,
            response_queued: false,
        }
    }

    /// Slot index within the connection.
    #[inline]
    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// The captured request packet.
    #[inline]
    pub fn request(&self) -> &Frame {
        &self.frame
    }

    /// The request opcode, when it is on the implemented surface.
    pub fn opcode(&self) -> Option<ClientOpcode> {
        ClientOpcode::from_u8(self.frame.header.opcode)
    }

    /// Opaque correlation token of the request.
    #[inline]
    pub fn opaque(&self) -> u32 {
        self.frame.header.opaque
    }

    /// True once a response has been queued for this request.
    #[inline]
    pub fn response_queued(&self) -> bool {
        self.response_queued
    }

    /// Time elapsed since the request was parsed.
    pub fn elapsed_us(&self) -> u64 {
        self.received.elapsed().as_micros().min(u128::from(u64::MAX)) as u64
    }

    /// Attach a human-readable error context to the response.
    pub fn set_error_context(&mut self, context: impl Into<String>) {
        self.error_context = Some(context.into());
    }

    /// Attach an event reference (e.g. an audit record id).
    pub fn set_event_id(&mut self, id: Uuid) {
        self.event_id = Some(id);
    }

    /// Attach extra fields merged into the error JSON object.
    pub fn set_error_json_extras(&mut self, extras: serde_json::Value) {
        self.error_extras = Some(extras);
    }

    /// Increment the reference count; saturates at 255.
    pub fn incr_refcount(&mut self) {
        assert!(self.refcount > 0, "cookie refcount wrapped");
        self.refcount = self.refcount.saturating_add(1);
    }

    /// Decrement the reference count; returns true when it reaches zero.
    pub fn decr_refcount(&mut self) -> bool {
        assert!(self.refcount > 0, "cookie refcount wrapped");
        if self.refcount < u8::MAX {
            self.refcount -= 1;
        }
        self.refcount == 0
    }

    /// Current reference count.
    #[inline]
    pub fn refcount(&self) -> u8 {
        self.refcount
    }

    /// Decide how an engine error is surfaced on this connection.
    ///
    /// Auth and privilege statuses require negotiated extended error
    /// codes; durability in-progress statuses degrade to a temporary
    /// failure; collection statuses degrade to invalid-arguments when the
    /// client is not collection-aware.
    pub fn error_disposition(&self, error: EngineError, conn: &Connection) -> ErrorDisposition {
        if error.is_fatal() {
            return ErrorDisposition::Disconnect;
        }
        let xerror = conn.features().xerror;
        let collections = conn.features().collections;
        match error {
            EngineError::AccessDenied | EngineError::AuthStale | EngineError::NoBucket
                if !xerror =>
            {
                ErrorDisposition::Disconnect
            }
            EngineError::SyncWriteInProgress | EngineError::SyncWriteReCommitInProgress
                if !xerror =>
            {
                ErrorDisposition::Respond(Status::Etmpfail)
            }
            EngineError::UnknownCollection | EngineError::CollectionsManifestIsAhead
                if !collections =>
            {
                ErrorDisposition::Respond(Status::Einval)
            }
            other => ErrorDisposition::Respond(other.to_status()),
        }
    }

    /// Assemble and queue a response frame on the connection.
    ///
    /// For non-benign statuses carrying an error context or event id the
    /// payload is replaced by `{"error":{"context":...,"ref":...}}` with
    /// the JSON datatype bit set.
    #[allow(clippy::too_many_arguments)]
    pub fn send_response(
        &mut self,
        conn: &mut Connection,
        status: Status,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
        datatype: Datatype,
        cas: u64,
    ) -> EngineResult<()> {
        let error_body;
        let (value, datatype) = if !status.keeps_payload()
            && (self.error_context.is_some()
                || self.event_id.is_some()
                || self.error_extras.is_some())
        {
            error_body = self.error_json();
            (error_body.as_slice(), Datatype::JSON)
        } else {
            (value, datatype)
        };

        let cas = if cas != 0 { cas } else { self.cas };
        let permitted = conn.permitted_datatypes();

        let mut builder = ResponseBuilder::raw_opcode(self.frame.header.opcode)
            .status(status)
            .opaque(self.frame.header.opaque)
            .cas(cas)
            .datatype(datatype.intersect(permitted))
            .extras(extras)
            .key(key)
            .value(value);

        if conn.features().tracing {
            let mut payload = BytesMut::with_capacity(2);
            let micros = self.elapsed_us().min(u64::from(u16::MAX)) as u16;
            payload.extend_from_slice(&micros.to_be_bytes());
            let mut framing = BytesMut::new();
            encode_raw_frame_info(&mut framing, SERVER_DURATION_FRAME_INFO, &payload);
            builder = builder.raw_framing_extras(&framing);
        }

        let mut packet = BytesMut::new();
        builder.build(&mut packet);

        conn.copy_to_output_stream(&packet)
            .map_err(|_| EngineError::Disconnect)?;
        self.response_queued = true;
        Ok(())
    }

    /// Queue a bare status response with no payload.
    pub fn send_status(&mut self, conn: &mut Connection, status: Status) -> EngineResult<()> {
        self.send_response(conn, status, &[], &[], &[], Datatype::RAW, 0)
    }

    fn error_json(&self) -> Vec<u8> {
        let mut error = serde_json::Map::new();
        if let Some(ref context) = self.error_context {
            error.insert("context".to_string(), json!(context));
        }
        if let Some(event_id) = self.event_id {
            error.insert("ref".to_string(), json!(event_id.to_string()));
        }
        if let Some(serde_json::Value::Object(extras)) = self.error_extras.clone() {
            for (key, value) in extras {
                error.entry(key).or_insert(value);
            }
        }
        serde_json::to_vec(&json!({ "error": error })).unwrap_or_else(|_| b"{}".to_vec())
    }

    /// Compact diagnostic representation used when an executor fails
    /// unexpectedly and the connection dumps its in-flight requests.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "slot": self.slot,
            "opcode": self.frame.header.opcode,
            "opaque": self.frame.header.opaque,
            "blocked": self.blocked,
            "reorder": self.reorder,
            "refcount": self.refcount,
            "response_queued": self.response_queued,
            "age_us": self.elapsed_us(),
            "error_context": self.error_context,
        })
    }
}

impl std::fmt::Debug for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cookie")
            .field("slot", &self.slot)
            .field("opcode", &self.frame.header.opcode)
            .field("opaque", &self.frame.header.opaque)
            .field("blocked", &self.blocked)
            .field("refcount", &self.refcount)
            .finish()
    }
}
