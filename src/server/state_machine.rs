//! The connection state machine.
//!
//! Drives one connection through its lifecycle: TLS establishment, packet
//! accumulation, validation, execution, response transmission, and the
//! close protocol. Full-duplex CDC producer connections replace the idle
//! `waiting` state with `ship_log`, which concurrently accepts client
//! acknowledgements and pushes producer output.
//!
//! Handlers suspend only at explicit await points: waiting for input,
//! waiting for an engine completion, or yielding after exhausting the
//! work budget.

use super::connection::{Connection, InputEvent};
use super::cookie::{Cookie, ErrorDisposition};
use super::reactor::ConnSignal;
use crate::commands;
use crate::dcp::ProducerShim;
use crate::engine::{DcpEngine, EngineError, StepOutcome};
use crate::protocol::{
    decode_frame_infos, ClientOpcode, FrameInfo, Magic, ServerOpcode, Status,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Interval at which a blocked transmit re-checks the stall watchdog.
const TRANSMIT_TICK: Duration = Duration::from_secs(1);

/// Poll interval for the CDC producer when it reports idle.
const SHIP_LOG_IDLE_TICK: Duration = Duration::from_millis(100);

/// States of the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// TLS accept and certificate identity resolution
    TlsInit,
    /// Reset per-request state and decide what to do next
    NewCmd,
    /// Idle: drain server events, then wait for input
    Waiting,
    /// Accumulate the packet header
    ReadPacketHeader,
    /// Interpret the packet header
    ParseCmd,
    /// Accumulate the packet body
    ReadPacketBody,
    /// Validate the packet and build the cookie
    Validate,
    /// Run the command executor
    Execute,
    /// Transmit queued output
    SendData,
    /// Wait for the send queue to drain
    DrainSendBuffer,
    /// Full-duplex CDC: pump producer output and client acks
    ShipLog,
    /// Begin the close protocol
    Closing,
    /// Deferred close: wait for in-flight work and unsent bytes
    PendingClose,
    /// Final resource release
    ImmediateClose,
    /// Terminal sentinel
    Destroyed,
}

struct StateMachine {
    state: State,
    write_and_go: State,
    current_slot: u8,
}

/// Run a connection to completion.
pub async fn drive(conn: &mut Connection) {
    // Plain connections fall straight through tls_init.
    let mut sm = StateMachine {
        state: State::TlsInit,
        write_and_go: State::NewCmd,
        current_slot: 0,
    };

    while sm.state != State::Destroyed {
        let start = Instant::now();
        let state = sm.state;
        step(&mut sm, conn).await;
        trace!("{}: {state:?} -> {:?}", conn.id(), sm.state);

        let micros = start.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
        conn.server_ctx().mailboxes[token_worker(conn)]
            .stats
            .record_sched_time(micros);
    }
}

fn token_worker(conn: &Connection) -> usize {
    conn.token_for(0).worker
}

/// How many cookies may be open at once: one in ordered mode, the
/// configured window when unordered execution was negotiated.
fn max_in_flight(conn: &Connection) -> usize {
    if conn.features().unordered_execution {
        conn.server_ctx().settings.max_in_flight
    } else {
        1
    }
}

async fn step(sm: &mut StateMachine, conn: &mut Connection) {
    match sm.state {
        State::TlsInit => conn_tls_init(sm, conn).await,
        State::NewCmd => conn_new_cmd(sm, conn).await,
        State::Waiting => conn_waiting(sm, conn).await,
        State::ReadPacketHeader => conn_read_packet(sm, conn).await,
        State::ParseCmd => conn_parse_cmd(sm, conn),
        State::ReadPacketBody => conn_read_packet(sm, conn).await,
        State::Validate => conn_validate(sm, conn),
        State::Execute => conn_execute(sm, conn).await,
        State::SendData => conn_send_data(sm, conn).await,
        State::DrainSendBuffer => conn_drain_send_buffer(sm, conn).await,
        State::ShipLog => conn_ship_log(sm, conn).await,
        State::Closing => conn_closing(sm, conn),
        State::PendingClose => conn_pending_close(sm, conn).await,
        State::ImmediateClose => conn_immediate_close(sm, conn),
        State::Destroyed => {}
    }
}

// === TLS ===

#[cfg(feature = "tls")]
async fn conn_tls_init(sm: &mut StateMachine, conn: &mut Connection) {
    let Some(pending) = conn.take_pending_tls() else {
        sm.state = State::NewCmd;
        return;
    };
    let Some(stream) = conn.take_plain_stream() else {
        sm.state = State::Closing;
        return;
    };

    let acceptor = tokio_rustls::TlsAcceptor::from(pending.config);
    match acceptor.accept(stream).await {
        Ok(tls_stream) => {
            // Resolve the client certificate to an identity before any
            // command is processed.
            let identity = {
                let (_, session) = tls_stream.get_ref();
                session.peer_certificates().and_then(|certs| {
                    certs.first().and_then(|cert| {
                        crate::security::tls_config::subject_common_name(cert.as_ref())
                    })
                })
            };
            conn.set_transport(super::connection::Transport::Tls(Box::new(tls_stream)));

            if let Some(user) = identity.or(pending.cert_user) {
                let identity = crate::security::Identity {
                    user,
                    domain: crate::security::Domain::Local,
                };
                debug!("{}: client certificate maps to {identity}", conn.id());
                conn.authenticate(identity);
            }
            sm.state = State::NewCmd;
        }
        Err(e) => {
            warn!("{}: TLS handshake failed: {e}", conn.id());
            sm.state = State::Closing;
        }
    }
}

#[cfg(not(feature = "tls"))]
async fn conn_tls_init(sm: &mut StateMachine, conn: &mut Connection) {
    sm.state = if conn.take_pending_tls().is_some() {
        // A TLS seed reached a build without TLS support.
        State::Closing
    } else {
        State::NewCmd
    };
}

// === Command intake ===

async fn conn_new_cmd(sm: &mut StateMachine, conn: &mut Connection) {
    if bucket_dying(conn) {
        sm.state = State::Closing;
        return;
    }

    conn.shrink_buffers();
    conn.begin_request();
    sm.write_and_go = if conn.is_dcp_producer() {
        State::ShipLog
    } else {
        State::NewCmd
    };

    // Back off the CPU after servicing the budgeted number of requests so
    // other connections on this worker get scheduled.
    if conn.maybe_yield() {
        tokio::task::yield_now().await;
        conn.reset_budget();
    }

    // Unordered execution: keep one slot free for the next request; when
    // every slot is taken, wait for a completion first.
    while conn.cookies.outstanding() >= max_in_flight(conn) {
        if !await_one_completion(conn).await {
            sm.state = State::Closing;
            return;
        }
    }

    match conn.is_packet_available() {
        Ok(true) => sm.state = State::ParseCmd,
        Ok(false) => {
            sm.state = if conn.is_dcp_producer() {
                State::ShipLog
            } else {
                State::Waiting
            }
        }
        Err(_) => sm.state = State::Closing,
    }
}

async fn conn_waiting(sm: &mut StateMachine, conn: &mut Connection) {
    if conn.has_server_events() {
        if conn.process_server_event() {
            // Pushed a message; flush it before sleeping.
            sm.write_and_go = State::Waiting;
            sm.state = State::SendData;
        } else {
            // The event could not progress; drain output and retry.
            sm.state = State::SendData;
            sm.write_and_go = State::Waiting;
        }
        return;
    }
    sm.state = State::ReadPacketHeader;
}

async fn conn_read_packet(sm: &mut StateMachine, conn: &mut Connection) {
    // Idle reaping: internal and CDC connections are exempt, as are
    // identities holding the idle-connection privilege.
    let idle_timeout = conn.server_ctx().settings.idle_timeout_secs;
    let reapable = idle_timeout > 0 && !conn.is_system() && conn.dcp().is_none();
    let event = if reapable {
        conn.wait_input_for(Duration::from_secs(idle_timeout)).await
    } else {
        conn.wait_input().await
    };

    match event {
        InputEvent::Data(_) => match conn.is_packet_available() {
            Ok(true) => sm.state = State::ParseCmd,
            Ok(false) => {
                // Partial packet: in the header phase drop back to
                // waiting, in the body phase keep reading.
                if sm.state == State::ReadPacketHeader {
                    sm.state = State::Waiting;
                }
            }
            Err(_) => sm.state = State::Closing,
        },
        InputEvent::Closed => {
            debug!("{}: connection closed by peer", conn.id());
            sm.state = State::Closing;
        }
        InputEvent::ReadError(e) => {
            debug!("{}: read error: {e}", conn.id());
            sm.state = State::Closing;
        }
        InputEvent::Signal(signal) => {
            if !handle_signal(sm, conn, signal) {
                sm.state = State::Closing;
            } else if sm.state == State::ReadPacketHeader && conn.has_server_events() {
                sm.state = State::Waiting;
            }
        }
        InputEvent::TimedOut => {
            if conn.check_privilege(crate::security::Privilege::IdleConnection)
                != crate::server::connection::PrivilegeOutcome::Granted
            {
                debug!("{}: idle timeout; closing", conn.id());
                sm.state = State::Closing;
            }
        }
    }
}

fn conn_parse_cmd(sm: &mut StateMachine, conn: &mut Connection) {
    match conn.is_packet_available() {
        Ok(true) => sm.state = State::Validate,
        Ok(false) => sm.state = State::ReadPacketBody,
        Err(_) => sm.state = State::Closing,
    }
}

// === Validation ===

fn conn_validate(sm: &mut StateMachine, conn: &mut Connection) {
    let frame = match conn.next_frame() {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            sm.state = State::Waiting;
            return;
        }
        Err(e) => {
            warn!("{}: unparseable packet: {e}", conn.id());
            sm.state = State::Closing;
            return;
        }
    };

    match frame.header.magic {
        Magic::ClientRequest | Magic::AltClientRequest => {}
        Magic::ServerResponse => {
            handle_server_response(conn, &frame);
            sm.state = State::NewCmd;
            return;
        }
        Magic::ClientResponse | Magic::AltClientResponse => {
            handle_client_response(conn, &frame);
            sm.state = State::NewCmd;
            return;
        }
        Magic::ServerRequest => {
            // Clients never send server-requests.
            warn!("{}: unexpected server-request from client", conn.id());
            sm.state = State::Closing;
            return;
        }
    }

    // Capture the packet. The body is copied when other requests may
    // still borrow the receive buffer (unordered mode keeps cookies past
    // the next parse).
    let copy = conn.features().unordered_execution;
    let Some(slot) = conn.cookies.alloc(frame, copy) else {
        // The in-flight guard in new_cmd keeps a slot free.
        error!("{}: no free cookie slot", conn.id());
        sm.state = State::Closing;
        return;
    };
    sm.current_slot = slot;

    let mut cookie = match conn.cookies.take(slot) {
        Some(cookie) => cookie,
        None => {
            sm.state = State::Closing;
            return;
        }
    };

    // Frame infos first: a malformed framing section is a protocol
    // violation that terminates the connection after the error response.
    if let Err(e) = apply_frame_infos(&mut cookie) {
        debug!("{}: bad framing extras: {e}", conn.id());
        cookie.set_error_context(e.to_string());
        let _ = cookie.send_status(conn, Status::Einval);
        sm.state = State::SendData;
        sm.write_and_go = State::Closing;
        return;
    }

    // Reorder permission requires negotiation and a reorder-safe opcode;
    // otherwise the tag is ignored.
    if cookie.reorder {
        let eligible = conn.features().unordered_execution
            && cookie
                .opcode()
                .is_some_and(ClientOpcode::reorder_supported);
        cookie.reorder = eligible;
    }

    if let Err(failure) = commands::validate(cookie.request(), conn) {
        debug!(
            "{}: validation failed for opcode {:#04x}: {}",
            conn.id(),
            cookie.request().header.opcode,
            failure.context
        );
        if !failure.context.is_empty() {
            cookie.set_error_context(failure.context.clone());
        }
        let _ = cookie.send_status(conn, failure.status);
        sm.state = State::SendData;
        sm.write_and_go = if failure.fatal {
            State::Closing
        } else if conn.is_dcp_producer() {
            State::ShipLog
        } else {
            State::NewCmd
        };
        return;
    }

    conn.cookies.restore(cookie);
    sm.state = State::Execute;
}

fn apply_frame_infos(cookie: &mut Cookie) -> Result<(), crate::error::ProtocolError> {
    let frame = cookie.request().clone();
    decode_frame_infos(frame.framing_extras(), |info| {
        match info {
            FrameInfo::Reorder => cookie.reorder = true,
            FrameInfo::Durability(req) => cookie.durability = Some(req),
            FrameInfo::DcpStreamId(sid) => cookie.stream_id = Some(sid),
            FrameInfo::OpenTracingContext(blob) => cookie.tracing_context = Some(blob),
        }
        Ok(())
    })
}

// === Execution ===

async fn conn_execute(sm: &mut StateMachine, conn: &mut Connection) {
    if bucket_dying(conn) {
        sm.state = State::Closing;
        return;
    }

    let slot = sm.current_slot;
    let Some(cookie) = conn.cookies.take(slot) else {
        sm.state = State::Closing;
        return;
    };

    // A non-reorderable command is a barrier: every earlier command must
    // complete before it runs.
    if !cookie.reorder && conn.cookies.outstanding() > 0 {
        conn.cookies.restore(cookie);
        while conn.cookies.outstanding() > 1 {
            if !await_one_completion(conn).await {
                sm.state = State::Closing;
                return;
            }
        }
        let Some(cookie) = conn.cookies.take(slot) else {
            sm.state = State::Closing;
            return;
        };
        execute_cookie(sm, conn, cookie).await;
        return;
    }

    execute_cookie(sm, conn, cookie).await;
}

async fn execute_cookie(sm: &mut StateMachine, conn: &mut Connection, mut cookie: Cookie) {
    let worker = token_worker(conn);
    conn.server_ctx().mailboxes[worker]
        .stats
        .requests
        .fetch_add(1, Ordering::Relaxed);
    conn.stats.requests += 1;

    loop {
        let result = catch_unwind(AssertUnwindSafe(|| commands::execute(&mut cookie, conn)));
        let result = match result {
            Ok(result) => result,
            Err(_) => {
                // An executor failure outside the engine error contract:
                // log a compact dump of the in-flight requests and close.
                error!(
                    "{}: executor panicked; cookies: {}",
                    conn.id(),
                    conn.dump_cookies()
                );
                sm.state = State::Closing;
                return;
            }
        };

        match result {
            Ok(()) => {
                let quit = matches!(
                    cookie.opcode(),
                    Some(ClientOpcode::Quit) | Some(ClientOpcode::Quitq)
                );
                let had_response = cookie.response_queued();
                // Slot freed by dropping the cookie.
                drop(cookie);
                if quit {
                    sm.state = State::SendData;
                    sm.write_and_go = State::Closing;
                } else if had_response || conn.pending_output() > 0 {
                    sm.state = State::SendData;
                } else {
                    sm.state = sm.write_and_go;
                }
                return;
            }
            Err(EngineError::WouldBlock) => {
                cookie.blocked = true;
                if cookie.reorder {
                    // Park the cookie; its completion is picked up at the
                    // next idle boundary while later requests proceed.
                    conn.cookies.restore(cookie);
                    sm.state = State::SendData;
                    return;
                }
                // Ordered mode: the connection sleeps until the matching
                // completion arrives, then the context resumes.
                let slot = cookie.slot();
                conn.cookies.restore(cookie);
                if !await_completion_for(conn, slot).await {
                    sm.state = State::Closing;
                    return;
                }
                match conn.cookies.take(slot) {
                    Some(resumed) => cookie = resumed,
                    None => {
                        sm.state = State::Closing;
                        return;
                    }
                }
            }
            Err(e) => {
                match cookie.error_disposition(e, conn) {
                    ErrorDisposition::Respond(status) => {
                        let _ = cookie.send_status(conn, status);
                        drop(cookie);
                        sm.state = State::SendData;
                    }
                    ErrorDisposition::Disconnect => {
                        debug!("{}: disconnecting on {e}", conn.id());
                        sm.state = State::Closing;
                    }
                }
                return;
            }
        }
    }
}

// === Completion plumbing ===

/// Wait until any blocked cookie completes (resuming it); false on
/// shutdown or channel loss.
async fn await_one_completion(conn: &mut Connection) -> bool {
    loop {
        match conn.wait_input().await {
            InputEvent::Signal(ConnSignal::IoComplete { slot, status }) => {
                return resume_blocked(conn, slot, status);
            }
            InputEvent::Signal(ConnSignal::ServerEvent(event)) => {
                conn.enqueue_server_event(event);
            }
            InputEvent::Signal(ConnSignal::Wake) => {}
            InputEvent::Signal(ConnSignal::Shutdown) | InputEvent::Closed => return false,
            InputEvent::ReadError(_) => return false,
            // Socket data buffers in the parser until we come back.
            InputEvent::Data(_) | InputEvent::TimedOut => {}
        }
    }
}

/// Wait for the completion of one specific slot (ordered mode).
async fn await_completion_for(conn: &mut Connection, slot: u8) -> bool {
    loop {
        match conn.wait_input().await {
            InputEvent::Signal(ConnSignal::IoComplete {
                slot: done,
                status,
            }) => {
                if done == slot {
                    if let Some(cookie) = conn.cookies.take(done) {
                        let mut cookie = cookie;
                        cookie.blocked = false;
                        cookie.ai_status = Some(status);
                        conn.cookies.restore(cookie);
                    }
                    return true;
                }
                if !resume_blocked(conn, done, status) {
                    return false;
                }
            }
            InputEvent::Signal(ConnSignal::ServerEvent(event)) => {
                conn.enqueue_server_event(event);
            }
            InputEvent::Signal(ConnSignal::Wake) => {}
            InputEvent::Signal(ConnSignal::Shutdown) | InputEvent::Closed => return false,
            InputEvent::ReadError(_) => return false,
            InputEvent::Data(_) | InputEvent::TimedOut => {}
        }
    }
}

/// Resume a parked reorder cookie after its completion arrived. Returns
/// false when the error disposition demands a disconnect.
fn resume_blocked(
    conn: &mut Connection,
    slot: u8,
    status: crate::engine::EngineResult<()>,
) -> bool {
    let Some(mut cookie) = conn.cookies.take(slot) else {
        return true;
    };
    cookie.blocked = false;
    cookie.ai_status = Some(status);

    let result = commands::execute(&mut cookie, conn);
    match result {
        Ok(()) => true,
        Err(EngineError::WouldBlock) => {
            cookie.blocked = true;
            conn.cookies.restore(cookie);
            true
        }
        Err(e) => match cookie.error_disposition(e, conn) {
            ErrorDisposition::Respond(status) => {
                let _ = cookie.send_status(conn, status);
                true
            }
            ErrorDisposition::Disconnect => false,
        },
    }
}

/// Dispatch a signal outside the execute path. Returns false when the
/// connection must close.
fn handle_signal(sm: &mut StateMachine, conn: &mut Connection, signal: ConnSignal) -> bool {
    match signal {
        ConnSignal::IoComplete { slot, status } => {
            if !resume_blocked(conn, slot, status) {
                return false;
            }
            if conn.pending_output() > 0 {
                sm.write_and_go = sm.state;
                sm.state = State::SendData;
            }
            true
        }
        ConnSignal::ServerEvent(event) => {
            conn.enqueue_server_event(event);
            true
        }
        ConnSignal::Wake => true,
        ConnSignal::Shutdown => false,
    }
}

// === Peer responses (duplex) ===

fn handle_server_response(conn: &mut Connection, frame: &crate::protocol::Frame) {
    let status = Status::Success as u16 == frame.header.vbucket_or_status;
    match ServerOpcode::from_u8(frame.header.opcode) {
        Some(ServerOpcode::Authenticate) => {
            let wire_status = if status {
                Status::Success
            } else {
                Status::AuthError
            };
            conn.server_ctx().auth.response_received(
                frame.header.opaque,
                wire_status,
                frame.value(),
            );
        }
        Some(ServerOpcode::ClustermapChangeNotification)
        | Some(ServerOpcode::ActiveExternalUsers) => {
            // Acknowledgement only; nothing to route.
        }
        None => {
            warn!(
                "{}: server-response with unknown opcode {:#04x}",
                conn.id(),
                frame.header.opcode
            );
        }
    }
}

fn handle_client_response(conn: &mut Connection, frame: &crate::protocol::Frame) {
    // Responses on a client connection only occur on CDC sessions, where
    // the peer acknowledges messages we produced.
    if conn.dcp().is_none() {
        warn!("{}: unexpected response packet from client", conn.id());
        return;
    }
    let id = conn.id();
    if let Some(engine) = conn.bucket().engine() {
        if let Some(dcp) = engine.dcp.clone() {
            let status =
                Status::from_u16(frame.header.vbucket_or_status).unwrap_or(Status::Einternal);
            let _ = dcp.response_handler(id, status, frame.header.opaque);
        }
    }
}

// === Transmission ===

async fn conn_send_data(sm: &mut StateMachine, conn: &mut Connection) {
    loop {
        if conn.pending_output() == 0 {
            sm.state = State::DrainSendBuffer;
            return;
        }

        let grace = conn
            .server_ctx()
            .settings
            .stall_timeout(conn.bucket().is_ready());
        if conn.watchdog.observe(conn.pending_output(), grace) {
            warn!("{}: send queue stalled; terminating", conn.id());
            sm.state = State::Closing;
            return;
        }

        match tokio::time::timeout(TRANSMIT_TICK, conn.write_some()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("{}: write error: {e}", conn.id());
                sm.state = State::Closing;
                return;
            }
            // Timed out: loop to re-check the watchdog.
            Err(_) => {}
        }
    }
}

async fn conn_drain_send_buffer(sm: &mut StateMachine, conn: &mut Connection) {
    if conn.pending_output() > 0 {
        sm.state = State::SendData;
        return;
    }
    sm.state = sm.write_and_go;
    if sm.state == State::NewCmd && conn.is_dcp_producer() {
        sm.state = State::ShipLog;
    }
}

// === Full-duplex CDC ===

async fn conn_ship_log(sm: &mut StateMachine, conn: &mut Connection) {
    if bucket_dying(conn) {
        sm.state = State::Closing;
        return;
    }

    if conn.has_server_events() && conn.process_server_event() && conn.pending_output() > 0 {
        sm.write_and_go = State::ShipLog;
        sm.state = State::SendData;
        return;
    }

    // Handle anything the client pipelined at us (acks, buffer
    // acknowledgements, control messages).
    match conn.is_packet_available() {
        Ok(true) => {
            sm.state = State::ParseCmd;
            return;
        }
        Ok(false) => {}
        Err(_) => {
            sm.state = State::Closing;
            return;
        }
    }

    // Pump the producer.
    let Some(dcp) = conn
        .bucket()
        .engine()
        .and_then(|engine| engine.dcp.clone())
    else {
        sm.state = State::Closing;
        return;
    };

    let id = conn.id();
    let outcome = {
        let mut shim = ProducerShim::new(conn);
        dcp.step(id, &mut shim)
    };

    match outcome {
        Ok(StepOutcome::More) => {
            if conn.pending_output() > 0 {
                sm.write_and_go = State::ShipLog;
                sm.state = State::SendData;
            }
        }
        Ok(StepOutcome::Idle) => {
            // Nothing to ship: sleep until client bytes, a signal, or the
            // poll tick.
            match conn.wait_input_for(SHIP_LOG_IDLE_TICK).await {
                InputEvent::Data(_) | InputEvent::TimedOut => {}
                InputEvent::Closed => sm.state = State::Closing,
                InputEvent::ReadError(e) => {
                    debug!("{}: read error in ship_log: {e}", conn.id());
                    sm.state = State::Closing;
                }
                InputEvent::Signal(signal) => {
                    if !handle_signal(sm, conn, signal) {
                        sm.state = State::Closing;
                    }
                }
            }
        }
        Err(e) => {
            debug!("{}: producer step failed: {e}", conn.id());
            sm.state = State::Closing;
        }
    }
}

// === Close protocol ===

fn conn_closing(sm: &mut StateMachine, conn: &mut Connection) {
    conn.disable_reads();
    if close_finalizable(conn) {
        sm.state = State::ImmediateClose;
    } else {
        sm.state = State::PendingClose;
    }
}

/// A close may finalize when no cookie is blocked and either the send
/// queue is empty or termination has been forced.
fn close_finalizable(conn: &Connection) -> bool {
    if conn.cookies.any_blocked() {
        return false;
    }
    if conn.watchdog.termination_requested() {
        return true;
    }
    conn.pending_output() == 0
}

async fn conn_pending_close(sm: &mut StateMachine, conn: &mut Connection) {
    if close_finalizable(conn) {
        sm.state = State::ImmediateClose;
        return;
    }

    // Try to flush what we owe the client, with the watchdog as the
    // emergency exit.
    if conn.pending_output() > 0 {
        let grace = conn
            .server_ctx()
            .settings
            .stall_timeout(conn.bucket().is_ready());
        if conn.watchdog.observe(conn.pending_output(), grace) {
            sm.state = State::ImmediateClose;
            return;
        }
        match tokio::time::timeout(TRANSMIT_TICK, conn.write_some()).await {
            Ok(Ok(_)) | Err(_) => {}
            Ok(Err(_)) => {
                conn.watchdog.force();
            }
        }
        return;
    }

    // Blocked cookies remain; wait for their completions.
    match conn.wait_input_for(TRANSMIT_TICK).await {
        InputEvent::Signal(ConnSignal::IoComplete { slot, status }) => {
            if let Some(mut cookie) = conn.cookies.take(slot) {
                cookie.blocked = false;
                cookie.ai_status = Some(status);
                // The response is not wanted any more; the cookie is
                // dropped without resuming the executor.
            }
        }
        InputEvent::Signal(_) | InputEvent::Data(_) | InputEvent::TimedOut => {}
        InputEvent::Closed | InputEvent::ReadError(_) => {
            conn.watchdog.force();
        }
    }
}

fn conn_immediate_close(sm: &mut StateMachine, conn: &mut Connection) {
    conn.clear_output();
    debug!(
        "{}: closed ({} bytes in, {} bytes out, {} requests)",
        conn.id(),
        conn.stats.bytes_in,
        conn.stats.bytes_out,
        conn.stats.requests
    );
    sm.state = State::Destroyed;
}

fn bucket_dying(conn: &Connection) -> bool {
    let bucket = conn.bucket();
    !bucket.is_no_bucket() && !bucket.is_ready()
}
