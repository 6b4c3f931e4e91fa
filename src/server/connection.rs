//! Connection handling for individual clients.
//!
//! A connection owns its socket (plain or TLS), the streaming packet
//! parser, the vectored output queue, the negotiated feature set, the
//! authenticated identity with its privilege context, the in-flight
//! cookies, and the FIFO of pending server events. All mutation happens
//! on the worker reactor the connection is pinned to; the only
//! cross-thread paths are the signal channel and the worker's pending-I/O
//! mailbox.

use super::config::ConnectionPriority;
use super::context::ServerContext;
use super::cookie::Cookie;
use super::reactor::{ConnSignal, SignalSender};
use super::sendbuf::{ChainRejected, OutputQueue, ReleaseFn};
use super::server_event::ServerEvent;
use crate::engine::{Bucket, CookieToken, DcpOpenFlags};
use crate::error::{Error, ProtocolError};
use crate::protocol::{Datatype, Feature, Frame, PacketParser};
use crate::security::{AuditEvent, AuditEventType, Identity, Privilege, PrivilegeContext};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Read chunk size for socket reads.
const READ_CHUNK: usize = 16 * 1024;

/// The byte transport under a connection.
pub enum Transport {
    /// Plain TCP
    Plain(TcpStream),
    /// TLS over TCP
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// Temporarily detached for a TLS handshake
    Detached,
}

impl Transport {
    async fn read_chunk(&mut self, parser: &mut PacketParser) -> std::io::Result<usize> {
        let buf = parser.buffer_mut();
        buf.reserve(READ_CHUNK);
        match self {
            Transport::Plain(stream) => stream.read_buf(buf).await,
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => stream.read_buf(buf).await,
            Transport::Detached => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(_) => f.write_str("Transport::Plain"),
            #[cfg(feature = "tls")]
            Transport::Tls(_) => f.write_str("Transport::Tls"),
            Transport::Detached => f.write_str("Transport::Detached"),
        }
    }
}

/// Features negotiated in the HELO handshake.
#[derive(Debug, Clone, Copy, Default)]
#[allow(missing_docs)]
pub struct FeatureSet {
    pub mutation_seqno: bool,
    pub xerror: bool,
    pub tcp_nodelay: bool,
    pub unordered_execution: bool,
    pub tracing: bool,
    pub collections: bool,
    pub duplex: bool,
    pub snappy: bool,
    pub json: bool,
    pub xattr: bool,
    pub clustermap_notification: bool,
    pub alt_request: bool,
    pub sync_replication: bool,
    pub select_bucket: bool,
}

impl FeatureSet {
    /// Record a negotiated feature.
    pub fn enable(&mut self, feature: Feature) {
        match feature {
            Feature::MutationSeqno => self.mutation_seqno = true,
            Feature::Xerror => self.xerror = true,
            Feature::TcpNodelay => self.tcp_nodelay = true,
            Feature::TcpDelay => self.tcp_nodelay = false,
            Feature::UnorderedExecution => self.unordered_execution = true,
            Feature::Tracing => self.tracing = true,
            Feature::Collections => self.collections = true,
            Feature::Duplex => self.duplex = true,
            Feature::Snappy => self.snappy = true,
            Feature::Json => self.json = true,
            Feature::Xattr => self.xattr = true,
            Feature::ClustermapChangeNotification => self.clustermap_notification = true,
            Feature::AltRequestSupport => self.alt_request = true,
            Feature::SyncReplication => self.sync_replication = true,
            Feature::SelectBucket => self.select_bucket = true,
            Feature::Tls => {}
        }
    }
}

/// Fixed-size cookie slots within a connection. Ordered connections only
/// ever use slot 0; unordered execution opens additional slots.
#[derive(Debug)]
pub struct CookieSlots {
    slots: Vec<Option<Cookie>>,
}

impl CookieSlots {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    /// Place a new cookie in the first free slot.
    pub fn alloc(&mut self, frame: Frame, copy: bool) -> Option<u8> {
        let index = self.slots.iter().position(Option::is_none)?;
        self.slots[index] = Some(Cookie::new(index as u8, frame, copy));
        Some(index as u8)
    }

    /// Remove a cookie for execution; restore it afterwards if it stays
    /// in flight.
    pub fn take(&mut self, slot: u8) -> Option<Cookie> {
        self.slots.get_mut(usize::from(slot))?.take()
    }

    /// Put a cookie back in its slot.
    pub fn restore(&mut self, cookie: Cookie) {
        let slot = usize::from(cookie.slot());
        debug_assert!(self.slots[slot].is_none());
        self.slots[slot] = Some(cookie);
    }

    /// Number of cookies in flight.
    pub fn outstanding(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// True when any cookie is waiting for an engine completion.
    pub fn any_blocked(&self) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|cookie| cookie.blocked)
    }

    /// Iterate the in-flight cookies.
    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.slots.iter().flatten()
    }
}

/// Watchdog detecting a send queue that stopped draining.
#[derive(Debug)]
pub struct SendQueueWatchdog {
    last_size: usize,
    since: Instant,
    term: bool,
}

impl SendQueueWatchdog {
    fn new() -> Self {
        Self {
            last_size: 0,
            since: Instant::now(),
            term: false,
        }
    }

    /// Observe the current queue size. Returns true (and latches the
    /// termination flag) when the queue has been non-empty and unchanged
    /// for longer than `grace`.
    pub fn observe(&mut self, size: usize, grace: Duration) -> bool {
        if size == 0 || size != self.last_size {
            self.last_size = size;
            self.since = Instant::now();
            return self.term;
        }
        if self.since.elapsed() > grace {
            self.term = true;
        }
        self.term
    }

    /// True once a stall has been detected.
    #[inline]
    pub fn termination_requested(&self) -> bool {
        self.term
    }

    /// Force termination regardless of queue progress.
    pub fn force(&mut self) {
        self.term = true;
    }
}

/// Per-connection counters.
#[derive(Debug, Default)]
pub struct ConnStats {
    /// Bytes received
    pub bytes_in: u64,
    /// Bytes sent
    pub bytes_out: u64,
    /// Voluntary yields after exhausting the work budget
    pub yields: u64,
    /// Requests executed
    pub requests: u64,
}

/// CDC session state for a connection that issued a CDC open.
#[derive(Debug, Clone, Copy)]
pub struct DcpState {
    /// Producer or consumer session
    pub producer: bool,
    /// Flags from the open request
    pub flags: DcpOpenFlags,
}

/// What woke a waiting connection.
#[derive(Debug)]
pub enum InputEvent {
    /// Bytes arrived from the socket
    Data(usize),
    /// The peer closed the connection (or the signal channel is gone)
    Closed,
    /// The socket read failed
    ReadError(std::io::Error),
    /// An out-of-band signal arrived
    Signal(ConnSignal),
    /// The bounded wait elapsed
    TimedOut,
}

/// Outcome of a privilege gate, after any rebuilds.
pub use crate::security::rbac::ResolvedPrivilege as PrivilegeOutcome;

/// A connection to a single client.
pub struct Connection {
    id: u64,
    worker: usize,
    peer: SocketAddr,
    system: bool,
    ctx: Arc<ServerContext>,
    transport: Transport,
    parser: PacketParser,
    output: OutputQueue,
    features: FeatureSet,
    identity: Identity,
    authenticated: bool,
    privilege_context: PrivilegeContext,
    privilege_rebuilds: u32,
    bucket: Arc<Bucket>,
    /// In-flight request state
    pub cookies: CookieSlots,
    server_events: VecDeque<Box<dyn ServerEvent>>,
    signals: mpsc::UnboundedReceiver<ConnSignal>,
    signal_tx: SignalSender,
    priority: ConnectionPriority,
    budget: u32,
    /// Send-queue stall watchdog
    pub watchdog: SendQueueWatchdog,
    /// Byte and request counters
    pub stats: ConnStats,
    dcp: Option<DcpState>,
    agent_name: Option<String>,
    reads_disabled: bool,
    pending_tls: Option<PendingTls>,
}

/// Deferred TLS handshake parameters, consumed by the `tls_init` state.
pub struct PendingTls {
    /// Server context to accept with
    #[cfg(feature = "tls")]
    pub config: Arc<tokio_rustls::rustls::ServerConfig>,
    /// User a verified client certificate maps onto
    pub cert_user: Option<String>,
}

impl std::fmt::Debug for PendingTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTls")
            .field("cert_user", &self.cert_user)
            .finish()
    }
}

impl Connection {
    /// Create a connection pinned to worker `worker`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        worker: usize,
        stream: TcpStream,
        peer: SocketAddr,
        system: bool,
        ctx: Arc<ServerContext>,
        signals: mpsc::UnboundedReceiver<ConnSignal>,
        signal_tx: SignalSender,
        pending_tls: Option<PendingTls>,
    ) -> Self {
        debug!("new connection from {peer} (id={id}, worker={worker})");
        let settings = &ctx.settings;
        let parser = PacketParser::new(settings.max_packet_size);
        let output = OutputQueue::new(settings.max_send_queue_size);
        let budget = settings.budget_for(ConnectionPriority::Medium);
        let max_in_flight = settings.max_in_flight;

        // Until authenticated, a connection acts as the "default" user on
        // the default bucket (when either exists).
        let identity = Identity {
            user: "default".to_string(),
            domain: crate::security::Domain::Local,
        };
        let bucket = ctx
            .buckets
            .get("default")
            .unwrap_or_else(|| ctx.buckets.no_bucket());
        bucket.connect();
        let privilege_context = ctx
            .rbac
            .create_context(&identity, bucket.name())
            .unwrap_or_else(|_| PrivilegeContext::empty(ctx.rbac.generation()));

        Self {
            id,
            worker,
            peer,
            system,
            ctx,
            transport: Transport::Plain(stream),
            parser,
            output,
            features: FeatureSet::default(),
            identity,
            authenticated: false,
            privilege_context,
            privilege_rebuilds: 0,
            bucket,
            cookies: CookieSlots::new(max_in_flight),
            server_events: VecDeque::new(),
            signals,
            signal_tx,
            priority: ConnectionPriority::Medium,
            budget,
            watchdog: SendQueueWatchdog::new(),
            stats: ConnStats::default(),
            dcp: None,
            agent_name: None,
            reads_disabled: false,
            pending_tls,
        }
    }

    // === Identity and accessors ===

    /// Connection id, unique for the process lifetime.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer address.
    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// True for connections accepted on a system port.
    #[inline]
    pub fn is_system(&self) -> bool {
        self.system
    }

    /// Shared server context.
    #[inline]
    pub fn server_ctx(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Pending-I/O token for a cookie slot on this connection.
    pub fn token_for(&self, slot: u8) -> CookieToken {
        CookieToken {
            worker: self.worker,
            connection: self.id,
            slot,
        }
    }

    /// Clone of the signal sender, for parties that need to wake this
    /// connection from another thread.
    pub fn signal_sender(&self) -> SignalSender {
        self.signal_tx.clone()
    }

    /// Negotiated features.
    #[inline]
    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    /// Mutable access for the HELO executor.
    #[inline]
    pub fn features_mut(&mut self) -> &mut FeatureSet {
        &mut self.features
    }

    /// Datatype bits the peer understands.
    pub fn permitted_datatypes(&self) -> Datatype {
        let mut bits = 0u8;
        if self.features.json {
            bits |= Datatype::JSON.bits();
        }
        if self.features.snappy {
            bits |= Datatype::SNAPPY.bits();
        }
        if self.features.xattr {
            bits |= Datatype::XATTR.bits();
        }
        Datatype::from_bits(bits)
    }

    /// The authenticated identity.
    #[inline]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// True after successful authentication.
    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Client-supplied agent string from the HELO key.
    pub fn agent_name(&self) -> Option<&str> {
        self.agent_name.as_deref()
    }

    /// Record the agent string.
    pub fn set_agent_name(&mut self, name: String) {
        self.agent_name = Some(name);
    }

    /// CDC session state, if a CDC open succeeded on this connection.
    #[inline]
    pub fn dcp(&self) -> Option<DcpState> {
        self.dcp
    }

    /// Mark the connection as a CDC session.
    pub fn set_dcp(&mut self, state: DcpState) {
        self.dcp = Some(state);
    }

    /// True for full-duplex CDC connections driven by `ship_log`.
    pub fn is_dcp_producer(&self) -> bool {
        self.dcp.is_some_and(|d| d.producer)
    }

    // === Authentication and privileges ===

    /// Install a new identity after authentication and build its
    /// privilege context for the current bucket.
    pub fn authenticate(&mut self, identity: Identity) {
        self.identity = identity;
        self.authenticated = true;
        self.rebuild_privilege_context();
    }

    /// The current privilege context.
    pub fn privilege_context(&self) -> &PrivilegeContext {
        &self.privilege_context
    }

    /// Drop a privilege until the next context rebuild.
    pub fn drop_privilege(&mut self, privilege: Privilege) {
        self.privilege_context.drop_privilege(privilege);
    }

    fn rebuild_privilege_context(&mut self) {
        match self.ctx.rbac.create_context(&self.identity, self.bucket.name()) {
            Ok(context) => self.privilege_context = context,
            Err(_) => {
                // The user vanished from the database; an empty context
                // fails every later check.
                self.privilege_context = PrivilegeContext::empty(self.ctx.rbac.generation());
            }
        }
    }

    /// Reset the per-request privilege rebuild counter.
    pub fn begin_request(&mut self) {
        self.privilege_rebuilds = 0;
    }

    /// Check a privilege, rebuilding a stale context up to the per-request
    /// budget.
    pub fn check_privilege(&mut self, privilege: Privilege) -> PrivilegeOutcome {
        let identity = self.identity.clone();
        let bucket = self.bucket.name().to_string();
        crate::security::rbac::resolve_with_rebuild(
            &mut self.privilege_context,
            privilege,
            &self.ctx.rbac,
            &mut self.privilege_rebuilds,
            |view| {
                view.create_context(&identity, &bucket)
                    .unwrap_or_else(|_| PrivilegeContext::empty(view.generation()))
            },
        )
    }

    // === Bucket binding ===

    /// The bucket this connection operates on.
    #[inline]
    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    /// Rebind to another bucket and rebuild the privilege context.
    pub fn select_bucket(&mut self, bucket: Arc<Bucket>) {
        self.bucket.disconnect();
        bucket.connect();
        self.bucket = bucket;
        self.rebuild_privilege_context();
    }

    // === Input path ===

    /// Read once from the socket into the parser. Returns the number of
    /// bytes received (0 = peer closed).
    pub async fn read_some(&mut self) -> std::io::Result<usize> {
        if self.reads_disabled {
            return Ok(0);
        }
        let n = self.transport.read_chunk(&mut self.parser).await?;
        self.stats.bytes_in += n as u64;
        Ok(n)
    }

    /// Block until either socket bytes or an out-of-band signal arrive.
    ///
    /// This is the reactor's suspension point: the connection gives up
    /// the thread here until there is work for it.
    pub async fn wait_input(&mut self) -> InputEvent {
        let Self {
            transport,
            parser,
            signals,
            reads_disabled,
            stats,
            ..
        } = self;

        if *reads_disabled {
            return match signals.recv().await {
                Some(signal) => InputEvent::Signal(signal),
                None => InputEvent::Closed,
            };
        }

        tokio::select! {
            result = transport.read_chunk(parser) => match result {
                Ok(0) => InputEvent::Closed,
                Ok(n) => {
                    stats.bytes_in += n as u64;
                    InputEvent::Data(n)
                }
                Err(e) => InputEvent::ReadError(e),
            },
            signal = signals.recv() => match signal {
                Some(signal) => InputEvent::Signal(signal),
                None => InputEvent::Closed,
            },
        }
    }

    /// Like [`wait_input`](Self::wait_input) with an upper bound on the
    /// wait, used by the full-duplex CDC loop to poll the producer.
    pub async fn wait_input_for(&mut self, timeout: Duration) -> InputEvent {
        match tokio::time::timeout(timeout, self.wait_input()).await {
            Ok(event) => event,
            Err(_) => InputEvent::TimedOut,
        }
    }


    /// Stop reading from the peer (deferred-close half-close).
    pub fn disable_reads(&mut self) {
        self.reads_disabled = true;
    }

    /// True iff a complete frame is buffered.
    ///
    /// A malformed header raises an audit event and surfaces an error so
    /// the state machine terminates the connection.
    pub fn is_packet_available(&self) -> Result<bool, Error> {
        match self.parser.is_packet_available() {
            Ok(available) => Ok(available),
            Err(e) => {
                let event = AuditEvent::new(
                    AuditEventType::InvalidPacket,
                    format!("invalid packet header: {e}"),
                )
                .peer(self.peer.to_string())
                .user(self.identity.to_string());
                self.ctx.audit.put(event);
                warn!("{}: terminating on invalid packet header: {e}", self.id);
                Err(Error::Protocol(e))
            }
        }
    }

    /// Split off the next complete frame.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        self.parser.next_frame()
    }

    /// Number of buffered input bytes.
    pub fn buffered_input(&self) -> usize {
        self.parser.len()
    }

    /// Shrink oversized buffers between requests.
    pub fn shrink_buffers(&mut self) {
        self.parser.maybe_shrink();
    }

    // === Output path ===

    /// Copy bytes into the send queue.
    pub fn copy_to_output_stream(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.output.copy(bytes).map_err(|size| {
            Error::ResourceLimit(format!(
                "send queue full: {size} bytes exceeds {}",
                self.ctx.settings.max_send_queue_size
            ))
        })?;
        self.stats.bytes_out += bytes.len() as u64;
        Ok(())
    }

    /// Attach an engine-owned buffer to the send queue without copying.
    /// Ownership transfers only when the attach succeeds.
    pub fn chain_data_to_output_stream(
        &mut self,
        data: Bytes,
        release: Option<ReleaseFn>,
    ) -> Result<(), ChainRejected> {
        let len = data.len();
        self.output.chain(data, release)?;
        self.stats.bytes_out += len as u64;
        Ok(())
    }

    /// Bytes queued for sending.
    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    /// Write one chunk of queued output to the socket.
    pub async fn write_some(&mut self) -> std::io::Result<usize> {
        match &mut self.transport {
            Transport::Plain(stream) => self.output.write_some(stream).await,
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => self.output.write_some(stream).await,
            Transport::Detached => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    /// Drop any queued output, running release callbacks.
    pub fn clear_output(&mut self) {
        self.output.clear();
    }

    // === Server events ===

    /// Append an event to the FIFO; it is drained at idle boundaries.
    pub fn enqueue_server_event(&mut self, event: Box<dyn ServerEvent>) {
        self.server_events.push_back(event);
    }

    /// True when events are waiting.
    pub fn has_server_events(&self) -> bool {
        !self.server_events.is_empty()
    }

    /// Run the first pending server event. Returns true if one was
    /// consumed.
    pub fn process_server_event(&mut self) -> bool {
        let Some(mut event) = self.server_events.pop_front() else {
            return false;
        };
        // The event needs `&mut Connection`; it is detached from the
        // queue while it runs.
        if event.execute(self) {
            debug!("{}: pushed server event: {}", self.id, event.description());
            true
        } else {
            self.server_events.push_front(event);
            false
        }
    }

    // === Scheduling ===

    /// Decrement the work budget. Returns true when the connection should
    /// yield back to the event loop.
    pub fn maybe_yield(&mut self) -> bool {
        self.budget = self.budget.saturating_sub(1);
        if self.budget == 0 {
            self.stats.yields += 1;
            return true;
        }
        false
    }

    /// Refill the work budget after re-entering the event loop.
    pub fn reset_budget(&mut self) {
        self.budget = self.ctx.settings.budget_for(self.priority);
    }

    /// Change the scheduling priority, remapping the work budget.
    pub fn set_priority(&mut self, priority: ConnectionPriority) {
        self.priority = priority;
        self.reset_budget();
    }

    /// Current priority.
    pub fn priority(&self) -> ConnectionPriority {
        self.priority
    }

    // === Transport ===

    /// Replace the transport after a TLS handshake.
    pub fn set_transport(&mut self, transport: Transport) {
        self.transport = transport;
    }

    /// Take the deferred TLS handshake parameters, if any.
    pub fn take_pending_tls(&mut self) -> Option<PendingTls> {
        self.pending_tls.take()
    }

    /// Detach the raw TCP stream for a TLS handshake. The transport is
    /// left detached until [`set_transport`](Self::set_transport).
    pub fn take_plain_stream(&mut self) -> Option<TcpStream> {
        match std::mem::replace(&mut self.transport, Transport::Detached) {
            Transport::Plain(stream) => Some(stream),
            other => {
                self.transport = other;
                None
            }
        }
    }

    /// Compact JSON dump of the in-flight cookies, used when an executor
    /// fails unexpectedly.
    pub fn dump_cookies(&self) -> serde_json::Value {
        serde_json::Value::Array(self.cookies.iter().map(Cookie::to_json).collect())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.output.clear();
        self.bucket.disconnect();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("identity", &self.identity)
            .field("bucket", &self.bucket.name())
            .field("in_flight", &self.cookies.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchdog_latches_on_stall() {
        let mut watchdog = SendQueueWatchdog::new();
        assert!(!watchdog.observe(0, Duration::from_millis(10)));
        // Non-empty and unchanged, but inside the grace window.
        assert!(!watchdog.observe(100, Duration::from_secs(60)));
        assert!(!watchdog.observe(100, Duration::from_secs(60)));
        // Same size past a zero grace window latches termination.
        std::thread::sleep(Duration::from_millis(5));
        assert!(watchdog.observe(100, Duration::from_millis(1)));
        assert!(watchdog.termination_requested());
        // The latch survives later progress.
        assert!(watchdog.observe(0, Duration::from_secs(60)));
    }

    #[test]
    fn feature_set_enable() {
        let mut features = FeatureSet::default();
        features.enable(Feature::Xerror);
        features.enable(Feature::Duplex);
        features.enable(Feature::TcpNodelay);
        assert!(features.xerror);
        assert!(features.duplex);
        assert!(features.tcp_nodelay);
        features.enable(Feature::TcpDelay);
        assert!(!features.tcp_nodelay);
        assert!(!features.unordered_execution);
    }
}
