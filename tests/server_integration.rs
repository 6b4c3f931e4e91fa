//! Socket-level integration tests.
//!
//! Each test boots a real server on an ephemeral port with the in-memory
//! engine and drives it over TCP with hand-assembled binary packets.

use atrium::engine::{
    CompressionPolicy, CookieToken, EngineError, EngineHandle, EngineResult, IoCompletionSink,
    Item, ItemMeta, KvEngine, MemoryEngine, StatCallback, StoreSemantics,
};
use atrium::protocol::{
    ClientOpcode, Datatype, DurabilityRequirement, FrameInfo, Magic, RequestBuilder,
    ResponseBuilder, ServerOpcode, Status,
};
use atrium::security::{password_digest, Domain, Privilege, UserEntry};
use atrium::{Server, ServerContext, Settings};
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Binary-protocol client helpers.
mod mcbp {
    use super::*;

    /// A packet read off the wire, split into its sections.
    #[derive(Debug)]
    pub struct Packet {
        pub magic: u8,
        pub opcode: u8,
        pub status_or_vbucket: u16,
        pub datatype: u8,
        pub opaque: u32,
        pub cas: u64,
        pub framing: Vec<u8>,
        pub extras: Vec<u8>,
        pub key: Vec<u8>,
        pub value: Vec<u8>,
    }

    impl Packet {
        pub fn status(&self) -> u16 {
            self.status_or_vbucket
        }
    }

    pub async fn send(stream: &mut TcpStream, builder: RequestBuilder) {
        let mut buf = BytesMut::new();
        builder.build(&mut buf);
        stream.write_all(&buf).await.expect("write failed");
    }

    pub async fn send_raw(stream: &mut TcpStream, bytes: &[u8]) {
        stream.write_all(bytes).await.expect("write failed");
    }

    pub async fn read_packet(stream: &mut TcpStream) -> Packet {
        tokio::time::timeout(Duration::from_secs(5), read_packet_inner(stream))
            .await
            .expect("timed out waiting for a packet")
    }

    async fn read_packet_inner(stream: &mut TcpStream) -> Packet {
        let mut header = [0u8; 24];
        stream
            .read_exact(&mut header)
            .await
            .expect("short read on header");

        let magic = header[0];
        let alt = magic == 0x08 || magic == 0x18;
        let (framing_len, key_len) = if alt {
            (usize::from(header[2]), usize::from(header[3]))
        } else {
            (0, usize::from(u16::from_be_bytes([header[2], header[3]])))
        };
        let extras_len = usize::from(header[4]);
        let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;

        let mut body = vec![0u8; body_len];
        stream
            .read_exact(&mut body)
            .await
            .expect("short read on body");

        let extras_start = framing_len;
        let key_start = extras_start + extras_len;
        let value_start = key_start + key_len;

        Packet {
            magic,
            opcode: header[1],
            status_or_vbucket: u16::from_be_bytes([header[6], header[7]]),
            datatype: header[5],
            opaque: u32::from_be_bytes([header[12], header[13], header[14], header[15]]),
            cas: u64::from_be_bytes([
                header[16], header[17], header[18], header[19], header[20], header[21],
                header[22], header[23],
            ]),
            framing: body[..framing_len].to_vec(),
            extras: body[extras_start..key_start].to_vec(),
            key: body[key_start..value_start].to_vec(),
            value: body[value_start..].to_vec(),
        }
    }

    pub fn hello(features: &[u16], opaque: u32) -> RequestBuilder {
        let mut value = Vec::new();
        for feature in features {
            value.extend_from_slice(&feature.to_be_bytes());
        }
        RequestBuilder::new(ClientOpcode::Hello)
            .key(b"integration-test")
            .value(&value)
            .opaque(opaque)
    }

    pub fn set(key: &[u8], value: &[u8], datatype: Datatype, opaque: u32) -> RequestBuilder {
        let mut extras = [0u8; 8];
        extras[4..8].copy_from_slice(&0u32.to_be_bytes());
        RequestBuilder::new(ClientOpcode::Set)
            .extras(&extras)
            .key(key)
            .value(value)
            .datatype(datatype)
            .opaque(opaque)
    }

    pub fn get(key: &[u8], opaque: u32) -> RequestBuilder {
        RequestBuilder::new(ClientOpcode::Get).key(key).opaque(opaque)
    }
}

async fn start_server() -> (Arc<Server>, TcpStream) {
    let (server, stream, _addr) = start_server_with(Settings::default).await;
    (server, stream)
}

async fn start_server_with(
    make: impl FnOnce() -> Settings,
) -> (Arc<Server>, TcpStream, std::net::SocketAddr) {
    let mut settings = make();
    settings.bind = "127.0.0.1".to_string();
    settings.port = 0;
    settings.worker_threads = 2;

    let server = Arc::new(Server::new(settings).expect("server construction failed"));
    server.register_memory_bucket("default");
    tokio::spawn(server.clone().run());

    let addr = tokio::time::timeout(Duration::from_secs(5), server.local_addr())
        .await
        .expect("server did not bind")
        .expect("no bound address");
    let stream = TcpStream::connect(addr).await.expect("connect failed");
    (server, stream, addr)
}

/// HELO echoes the accepted features, and a stored JSON document comes
/// back with its datatype, CAS and opaque intact.
#[tokio::test]
async fn hello_then_get_ordered() {
    let (_server, mut stream) = start_server().await;

    mcbp::send(
        &mut stream,
        mcbp::hello(&[0x0007 /* xerror */, 0x000b /* json */], 1),
    )
    .await;
    let response = mcbp::read_packet(&mut stream).await;
    assert_eq!(response.status(), Status::Success as u16);
    let mut echoed: Vec<u16> = response
        .value
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    echoed.sort_unstable();
    assert_eq!(echoed, vec![0x0007, 0x000b]);

    mcbp::send(
        &mut stream,
        mcbp::set(b"foo", br#"{"v":1}"#, Datatype::JSON, 2),
    )
    .await;
    let response = mcbp::read_packet(&mut stream).await;
    assert_eq!(response.status(), Status::Success as u16);
    assert_ne!(response.cas, 0);

    mcbp::send(&mut stream, mcbp::get(b"foo", 0xAA)).await;
    let response = mcbp::read_packet(&mut stream).await;
    assert_eq!(response.status(), Status::Success as u16);
    assert_eq!(response.opaque, 0xAA);
    assert_ne!(response.cas, 0);
    assert_eq!(response.datatype & 0x01, 0x01, "json datatype bit");
    assert_eq!(response.value, br#"{"v":1}"#);
    assert_eq!(response.extras.len(), 4, "flags extras");
}

/// Reorder frame infos are ignored when unordered execution was not
/// negotiated: responses arrive in request order, without errors.
#[tokio::test]
async fn reorder_tag_ignored_without_negotiation() {
    let (_server, mut stream) = start_server().await;

    mcbp::send(&mut stream, mcbp::set(b"a", b"1", Datatype::RAW, 1)).await;
    mcbp::read_packet(&mut stream).await;
    mcbp::send(&mut stream, mcbp::set(b"b", b"2", Datatype::RAW, 2)).await;
    mcbp::read_packet(&mut stream).await;

    // Two pipelined gets, both tagged for reorder.
    mcbp::send(
        &mut stream,
        mcbp::get(b"a", 0x10).frame_info(&FrameInfo::Reorder),
    )
    .await;
    mcbp::send(
        &mut stream,
        mcbp::get(b"b", 0x20).frame_info(&FrameInfo::Reorder),
    )
    .await;

    let first = mcbp::read_packet(&mut stream).await;
    let second = mcbp::read_packet(&mut stream).await;
    assert_eq!(first.status(), Status::Success as u16);
    assert_eq!(second.status(), Status::Success as u16);
    assert_eq!(first.opaque, 0x10);
    assert_eq!(second.opaque, 0x20);
    assert_eq!(first.value, b"1");
    assert_eq!(second.value, b"2");
}

/// A privilege database change between requests forces a context rebuild
/// on the next check; the request still succeeds.
#[tokio::test]
async fn privilege_rebuild_after_rbac_change() {
    let (server, mut stream) = start_server().await;

    mcbp::send(&mut stream, mcbp::set(b"k", b"v", Datatype::RAW, 1)).await;
    assert_eq!(
        mcbp::read_packet(&mut stream).await.status(),
        Status::Success as u16
    );

    // Invalidate the view: the connection's snapshot is now stale.
    server.context().rbac.invalidate();

    mcbp::send(&mut stream, mcbp::get(b"k", 2)).await;
    let response = mcbp::read_packet(&mut stream).await;
    assert_eq!(response.status(), Status::Success as u16);
    assert_eq!(response.value, b"v");
}

/// Subdocument counter with create-document semantics: a counter on a
/// missing document materializes `{"x":{"y":1}}`.
#[tokio::test]
async fn subdoc_counter_on_missing_doc_with_mkdoc() {
    let (_server, mut stream) = start_server().await;

    // extras: path len (2), flags (1) = mkdir_p, doc flags (1) = mkdoc
    let path = b"x.y";
    let mut extras = Vec::new();
    extras.extend_from_slice(&(path.len() as u16).to_be_bytes());
    extras.push(0x01); // mkdir_p
    extras.push(0x01); // mkdoc
    let mut body = Vec::new();
    body.extend_from_slice(path);
    body.extend_from_slice(b"1");

    mcbp::send(
        &mut stream,
        RequestBuilder::new(ClientOpcode::SubdocCounter)
            .extras(&extras)
            .key(b"counter-doc")
            .value(&body)
            .opaque(7),
    )
    .await;
    let response = mcbp::read_packet(&mut stream).await;
    assert_eq!(response.status(), Status::Success as u16);
    assert_eq!(response.value, b"1");
    assert_ne!(response.cas, 0);

    // The whole document reflects the created path.
    mcbp::send(&mut stream, mcbp::get(b"counter-doc", 8)).await;
    let response = mcbp::read_packet(&mut stream).await;
    assert_eq!(response.status(), Status::Success as u16);
    let doc: serde_json::Value = serde_json::from_slice(&response.value).unwrap();
    assert_eq!(doc, serde_json::json!({"x": {"y": 1}}));
}

/// A CDC producer stream with a stream id: every message of the stream is
/// framed as an alt request whose first framing extra carries the id.
#[tokio::test]
async fn dcp_mutation_with_stream_id() {
    let (_server, mut stream) = start_server().await;

    // Seed a document before opening the stream.
    mcbp::send(&mut stream, mcbp::set(b"doc", b"payload", Datatype::RAW, 1)).await;
    assert_eq!(
        mcbp::read_packet(&mut stream).await.status(),
        Status::Success as u16
    );

    let mut cdc = TcpStream::connect(stream.peer_addr().unwrap())
        .await
        .expect("connect failed");

    // Open a producer session.
    let mut extras = [0u8; 8];
    extras[4..8].copy_from_slice(&1u32.to_be_bytes()); // producer
    mcbp::send(
        &mut cdc,
        RequestBuilder::new(ClientOpcode::DcpOpen)
            .extras(&extras)
            .key(b"replica-feed")
            .opaque(2),
    )
    .await;
    assert_eq!(
        mcbp::read_packet(&mut cdc).await.status(),
        Status::Success as u16
    );

    // Stream request tagged with stream id 7.
    let mut extras = [0u8; 48];
    extras[16..24].copy_from_slice(&u64::MAX.to_be_bytes()); // end seqno
    mcbp::send(
        &mut cdc,
        RequestBuilder::new(ClientOpcode::DcpStreamReq)
            .extras(&extras)
            .frame_info(&FrameInfo::DcpStreamId(7))
            .opaque(3),
    )
    .await;
    let response = mcbp::read_packet(&mut cdc).await;
    assert_eq!(response.status(), Status::Success as u16);
    assert_eq!(response.opaque, 3);
    assert_eq!(response.value.len() % 16, 0, "failover log entries");

    // Snapshot marker, then the mutation, then stream end; all alt
    // requests carrying the stream id frame info.
    let marker = mcbp::read_packet(&mut cdc).await;
    assert_eq!(marker.magic, Magic::AltClientRequest as u8);
    assert_eq!(marker.opcode, ClientOpcode::DcpSnapshotMarker as u8);
    assert_eq!(marker.framing, vec![0x22, 0x00, 0x07]);
    assert_eq!(marker.extras.len(), 20);

    let mutation = mcbp::read_packet(&mut cdc).await;
    assert_eq!(mutation.magic, Magic::AltClientRequest as u8);
    assert_eq!(mutation.opcode, ClientOpcode::DcpMutation as u8);
    assert_eq!(mutation.framing, vec![0x22, 0x00, 0x07]);
    assert_eq!(mutation.extras.len(), 31);
    assert_eq!(mutation.key, b"doc");
    assert_eq!(mutation.value, b"payload");

    let end = mcbp::read_packet(&mut cdc).await;
    assert_eq!(end.opcode, ClientOpcode::DcpStreamEnd as u8);
}

/// PLAIN authentication against a seeded user; wrong credentials fail
/// with an auth error.
#[tokio::test]
async fn sasl_plain_authentication() {
    let (server, mut stream) = start_server().await;

    let mut entry = UserEntry {
        password_sha256: Some(password_digest("secret")),
        global: vec![Privilege::SelectBucket],
        ..UserEntry::default()
    };
    entry
        .buckets
        .insert("*".to_string(), vec![Privilege::Read, Privilege::Upsert]);
    server.context().rbac.upsert_user("admin", Domain::Local, entry);

    mcbp::send(
        &mut stream,
        RequestBuilder::new(ClientOpcode::SaslAuth)
            .key(b"PLAIN")
            .value(b"\0admin\0secret")
            .opaque(1),
    )
    .await;
    assert_eq!(
        mcbp::read_packet(&mut stream).await.status(),
        Status::Success as u16
    );

    // Wrong password on a fresh connection (with JSON negotiated so the
    // error body keeps its datatype bit).
    let mut other = TcpStream::connect(stream.peer_addr().unwrap())
        .await
        .expect("connect failed");
    mcbp::send(&mut other, mcbp::hello(&[0x000b /* json */], 1)).await;
    mcbp::read_packet(&mut other).await;
    mcbp::send(
        &mut other,
        RequestBuilder::new(ClientOpcode::SaslAuth)
            .key(b"PLAIN")
            .value(b"\0admin\0wrong")
            .opaque(2),
    )
    .await;
    let response = mcbp::read_packet(&mut other).await;
    assert_eq!(response.status(), Status::AuthError as u16);
    // The failure body carries the error context JSON.
    assert_eq!(response.datatype & 0x01, 0x01);
    let body: serde_json::Value = serde_json::from_slice(&response.value).unwrap();
    assert!(body["error"]["context"].is_string());
    assert!(body["error"]["ref"].is_string());
}

/// External authentication: a duplex provider connection answers the
/// forwarded challenge and the suspended client completes.
#[tokio::test]
async fn external_authentication_round_trip() {
    let (server, mut provider) = start_server().await;

    // The provider authenticates with security-management rights.
    let entry = UserEntry {
        password_sha256: Some(password_digest("hunter2")),
        global: vec![Privilege::SecurityManagement],
        ..UserEntry::default()
    };
    server.context().rbac.upsert_user("@auth", Domain::Local, entry);

    mcbp::send(&mut provider, mcbp::hello(&[0x000c /* duplex */], 1)).await;
    mcbp::read_packet(&mut provider).await;
    mcbp::send(
        &mut provider,
        RequestBuilder::new(ClientOpcode::SaslAuth)
            .key(b"PLAIN")
            .value(b"\0@auth\0hunter2")
            .opaque(2),
    )
    .await;
    assert_eq!(
        mcbp::read_packet(&mut provider).await.status(),
        Status::Success as u16
    );
    mcbp::send(
        &mut provider,
        RequestBuilder::new(ClientOpcode::AuthProvider).opaque(3),
    )
    .await;
    assert_eq!(
        mcbp::read_packet(&mut provider).await.status(),
        Status::Success as u16
    );

    // A client tries to authenticate as a user unknown locally.
    let mut client = TcpStream::connect(provider.peer_addr().unwrap())
        .await
        .expect("connect failed");
    mcbp::send(
        &mut client,
        RequestBuilder::new(ClientOpcode::SaslAuth)
            .key(b"PLAIN")
            .value(b"\0joe\0external-pw")
            .opaque(4),
    )
    .await;

    // The provider receives the forwarded request...
    let forwarded = mcbp::read_packet(&mut provider).await;
    assert_eq!(forwarded.magic, Magic::ServerRequest as u8);
    assert_eq!(forwarded.opcode, ServerOpcode::Authenticate as u8);
    let payload: serde_json::Value = serde_json::from_slice(&forwarded.value).unwrap();
    assert_eq!(payload["mechanism"], "PLAIN");
    assert_eq!(payload["step"], false);

    // ...and answers with the user's privilege entry.
    let mut answer = BytesMut::new();
    ResponseBuilder::server(ServerOpcode::Authenticate)
        .opaque(forwarded.opaque)
        .value(br#"{"rbac": {"buckets": {"default": ["Read"]}}}"#)
        .build(&mut answer);
    mcbp::send_raw(&mut provider, &answer).await;

    let response = mcbp::read_packet(&mut client).await;
    assert_eq!(response.status(), Status::Success as u16);
    assert_eq!(response.opaque, 4);
}

/// Counters: create on first increment, then apply deltas; the response
/// body is the 64-bit new value.
#[tokio::test]
async fn arithmetic_counters() {
    let (_server, mut stream) = start_server().await;

    let mut extras = [0u8; 20];
    extras[0..8].copy_from_slice(&5u64.to_be_bytes()); // delta
    extras[8..16].copy_from_slice(&100u64.to_be_bytes()); // initial

    mcbp::send(
        &mut stream,
        RequestBuilder::new(ClientOpcode::Increment)
            .extras(&extras)
            .key(b"hits")
            .opaque(1),
    )
    .await;
    let response = mcbp::read_packet(&mut stream).await;
    assert_eq!(response.status(), Status::Success as u16);
    assert_eq!(response.value, 100u64.to_be_bytes());

    mcbp::send(
        &mut stream,
        RequestBuilder::new(ClientOpcode::Increment)
            .extras(&extras)
            .key(b"hits")
            .opaque(2),
    )
    .await;
    let response = mcbp::read_packet(&mut stream).await;
    assert_eq!(response.value, 105u64.to_be_bytes());

    // A non-numeric document fails with delta-badval.
    mcbp::send(&mut stream, mcbp::set(b"text", b"abc", Datatype::RAW, 3)).await;
    mcbp::read_packet(&mut stream).await;
    mcbp::send(
        &mut stream,
        RequestBuilder::new(ClientOpcode::Increment)
            .extras(&extras)
            .key(b"text")
            .opaque(4),
    )
    .await;
    assert_eq!(
        mcbp::read_packet(&mut stream).await.status(),
        Status::DeltaBadval as u16
    );
}

/// Quiet variants swallow their miss/success responses; a trailing noop
/// delimits the pipeline.
#[tokio::test]
async fn quiet_get_suppresses_miss() {
    let (_server, mut stream) = start_server().await;

    mcbp::send(
        &mut stream,
        RequestBuilder::new(ClientOpcode::Getq).key(b"missing").opaque(1),
    )
    .await;
    mcbp::send(&mut stream, RequestBuilder::new(ClientOpcode::Noop).opaque(2)).await;

    let response = mcbp::read_packet(&mut stream).await;
    assert_eq!(response.opcode, ClientOpcode::Noop as u8);
    assert_eq!(response.opaque, 2);
}

/// Append grows the stored value; delete then makes it a miss.
#[tokio::test]
async fn append_and_delete() {
    let (_server, mut stream) = start_server().await;

    mcbp::send(&mut stream, mcbp::set(b"log", b"one", Datatype::RAW, 1)).await;
    mcbp::read_packet(&mut stream).await;

    mcbp::send(
        &mut stream,
        RequestBuilder::new(ClientOpcode::Append)
            .key(b"log")
            .value(b",two")
            .opaque(2),
    )
    .await;
    assert_eq!(
        mcbp::read_packet(&mut stream).await.status(),
        Status::Success as u16
    );

    mcbp::send(&mut stream, mcbp::get(b"log", 3)).await;
    assert_eq!(mcbp::read_packet(&mut stream).await.value, b"one,two");

    mcbp::send(
        &mut stream,
        RequestBuilder::new(ClientOpcode::Delete).key(b"log").opaque(4),
    )
    .await;
    assert_eq!(
        mcbp::read_packet(&mut stream).await.status(),
        Status::Success as u16
    );

    mcbp::send(&mut stream, mcbp::get(b"log", 5)).await;
    assert_eq!(
        mcbp::read_packet(&mut stream).await.status(),
        Status::KeyEnoent as u16
    );
}

/// Opcodes outside the implemented surface answer with unknown-command.
#[tokio::test]
async fn unknown_opcode() {
    let (_server, mut stream) = start_server().await;

    // 0x40 is outside the dispatch table.
    let mut packet = BytesMut::new();
    packet.extend_from_slice(&[
        0x80, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x09, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ]);
    mcbp::send_raw(&mut stream, &packet).await;

    let response = mcbp::read_packet(&mut stream).await;
    assert_eq!(response.status(), Status::UnknownCommand as u16);
    assert_eq!(response.opaque, 9);
}

/// Version and noop answer without touching the engine.
#[tokio::test]
async fn version_and_noop() {
    let (_server, mut stream) = start_server().await;

    mcbp::send(&mut stream, RequestBuilder::new(ClientOpcode::Version).opaque(1)).await;
    let response = mcbp::read_packet(&mut stream).await;
    assert_eq!(response.status(), Status::Success as u16);
    assert!(!response.value.is_empty());

    mcbp::send(&mut stream, RequestBuilder::new(ClientOpcode::Noop).opaque(2)).await;
    assert_eq!(
        mcbp::read_packet(&mut stream).await.status(),
        Status::Success as u16
    );
}

/// An invalid magic terminates the connection.
#[tokio::test]
async fn invalid_magic_disconnects() {
    let (_server, mut stream) = start_server().await;

    mcbp::send_raw(&mut stream, &[0x42u8; 24]).await;
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("timed out waiting for close");
    assert_eq!(read.unwrap(), 0, "expected EOF after invalid magic");
}

/// Validation failures on known opcodes answer einval and keep the
/// connection when the violation is not a framing error.
#[tokio::test]
async fn validation_error_reports_context() {
    let (_server, mut stream) = start_server().await;

    mcbp::send(&mut stream, mcbp::hello(&[0x000b /* json */], 0)).await;
    mcbp::read_packet(&mut stream).await;

    // Set with missing extras.
    mcbp::send(
        &mut stream,
        RequestBuilder::new(ClientOpcode::Set).key(b"k").value(b"v").opaque(1),
    )
    .await;
    let response = mcbp::read_packet(&mut stream).await;
    assert_eq!(response.status(), Status::Einval as u16);
    let body: serde_json::Value = serde_json::from_slice(&response.value).unwrap();
    assert!(body["error"]["context"]
        .as_str()
        .unwrap()
        .contains("extras"));

    // The connection still works.
    mcbp::send(&mut stream, RequestBuilder::new(ClientOpcode::Noop).opaque(2)).await;
    assert_eq!(
        mcbp::read_packet(&mut stream).await.status(),
        Status::Success as u16
    );
}

/// An engine wrapper that suspends the first fetch of any `slow:` key,
/// completing it from a background thread through the pending-I/O path.
struct BlockingEngine {
    inner: MemoryEngine,
    ctx: OnceLock<Arc<ServerContext>>,
    suspended: Mutex<HashSet<Vec<u8>>>,
}

impl BlockingEngine {
    fn new() -> Self {
        Self {
            inner: MemoryEngine::new(),
            ctx: OnceLock::new(),
            suspended: Mutex::new(HashSet::new()),
        }
    }
}

impl KvEngine for BlockingEngine {
    fn get(&self, token: CookieToken, key: &[u8], vbucket: u16) -> EngineResult<Item> {
        if key.starts_with(b"slow:") && self.suspended.lock().unwrap().insert(key.to_vec()) {
            let ctx = self.ctx.get().expect("context not wired").clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                ctx.notify_io_complete(token, Ok(()));
            });
            return Err(EngineError::WouldBlock);
        }
        self.inner.get(token, key, vbucket)
    }

    fn get_and_touch(
        &self,
        token: CookieToken,
        key: &[u8],
        vbucket: u16,
        exptime: u32,
    ) -> EngineResult<Item> {
        self.inner.get_and_touch(token, key, vbucket, exptime)
    }

    fn touch(
        &self,
        token: CookieToken,
        key: &[u8],
        vbucket: u16,
        exptime: u32,
    ) -> EngineResult<ItemMeta> {
        self.inner.touch(token, key, vbucket, exptime)
    }

    fn get_locked(
        &self,
        token: CookieToken,
        key: &[u8],
        vbucket: u16,
        lock_time: u32,
    ) -> EngineResult<Item> {
        self.inner.get_locked(token, key, vbucket, lock_time)
    }

    fn unlock(&self, token: CookieToken, key: &[u8], vbucket: u16, cas: u64) -> EngineResult<()> {
        self.inner.unlock(token, key, vbucket, cas)
    }

    fn get_meta(&self, token: CookieToken, key: &[u8], vbucket: u16) -> EngineResult<ItemMeta> {
        self.inner.get_meta(token, key, vbucket)
    }

    fn store(
        &self,
        token: CookieToken,
        item: &Item,
        cas: u64,
        semantics: StoreSemantics,
        durability: Option<DurabilityRequirement>,
        vbucket: u16,
    ) -> EngineResult<ItemMeta> {
        self.inner.store(token, item, cas, semantics, durability, vbucket)
    }

    fn remove(
        &self,
        token: CookieToken,
        key: &[u8],
        vbucket: u16,
        cas: u64,
        durability: Option<DurabilityRequirement>,
    ) -> EngineResult<ItemMeta> {
        self.inner.remove(token, key, vbucket, cas, durability)
    }

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
    ) -> EngineResult<Item> {
        self.inner
            .allocate(token, key, nbytes, priv_bytes, flags, exptime, datatype, vbucket)
    }

    fn flush(&self, token: CookieToken) -> EngineResult<()> {
        self.inner.flush(token)
    }

    fn stats(
        &self,
        token: CookieToken,
        group: &str,
        emit: &mut StatCallback<'_>,
    ) -> EngineResult<()> {
        self.inner.stats(token, group, emit)
    }

    fn get_random_document(&self, token: CookieToken) -> EngineResult<Item> {
        self.inner.get_random_document(token)
    }
}

async fn start_blocking_server() -> (Arc<Server>, Arc<BlockingEngine>, TcpStream) {
    let mut settings = Settings::default();
    settings.bind = "127.0.0.1".to_string();
    settings.port = 0;
    settings.worker_threads = 2;

    let server = Arc::new(Server::new(settings).expect("server construction failed"));
    let engine = Arc::new(BlockingEngine::new());
    server.context().buckets.register(
        "default",
        EngineHandle {
            kv: engine.clone(),
            dcp: None,
        },
        CompressionPolicy::Off,
    );
    engine
        .ctx
        .set(server.context().clone())
        .ok()
        .expect("context already set");

    tokio::spawn(server.clone().run());
    let addr = tokio::time::timeout(Duration::from_secs(5), server.local_addr())
        .await
        .expect("server did not bind")
        .expect("no bound address");
    let stream = TcpStream::connect(addr).await.expect("connect failed");
    (server, engine, stream)
}

fn seed(value: &str) -> Bytes {
    Bytes::copy_from_slice(value.as_bytes())
}

/// Ordered mode: a suspended request resumes through the pending-I/O
/// path and its response precedes every later request's.
#[tokio::test]
async fn blocked_cookie_resumes_in_order() {
    let (_server, _engine, mut stream) = start_blocking_server().await;

    mcbp::send(&mut stream, mcbp::set(b"slow:a", b"A", Datatype::RAW, 1)).await;
    mcbp::read_packet(&mut stream).await;
    mcbp::send(&mut stream, mcbp::set(b"b", b"B", Datatype::RAW, 2)).await;
    mcbp::read_packet(&mut stream).await;

    // Both pipelined; the first blocks for ~100ms.
    mcbp::send(&mut stream, mcbp::get(b"slow:a", 0x0a)).await;
    mcbp::send(&mut stream, mcbp::get(b"b", 0x0b)).await;

    let first = mcbp::read_packet(&mut stream).await;
    let second = mcbp::read_packet(&mut stream).await;
    assert_eq!(first.opaque, 0x0a, "ordered mode preserves request order");
    assert_eq!(first.value, seed("A"));
    assert_eq!(second.opaque, 0x0b);
    assert_eq!(second.value, seed("B"));
}

/// Unordered mode: a blocked reorder-tagged request lets later requests
/// pass it; responses are emitted in completion order.
#[tokio::test]
async fn reorder_emits_responses_in_completion_order() {
    let (_server, _engine, mut stream) = start_blocking_server().await;

    mcbp::send(&mut stream, mcbp::hello(&[0x000e /* unordered */], 1)).await;
    mcbp::read_packet(&mut stream).await;

    mcbp::send(&mut stream, mcbp::set(b"slow:x", b"X", Datatype::RAW, 2)).await;
    mcbp::read_packet(&mut stream).await;
    mcbp::send(&mut stream, mcbp::set(b"y", b"Y", Datatype::RAW, 3)).await;
    mcbp::read_packet(&mut stream).await;

    mcbp::send(
        &mut stream,
        mcbp::get(b"slow:x", 0x51).frame_info(&FrameInfo::Reorder),
    )
    .await;
    mcbp::send(
        &mut stream,
        mcbp::get(b"y", 0x52).frame_info(&FrameInfo::Reorder),
    )
    .await;

    // The fast request overtakes the suspended one.
    let first = mcbp::read_packet(&mut stream).await;
    let second = mcbp::read_packet(&mut stream).await;
    assert_eq!(first.opaque, 0x52);
    assert_eq!(first.value, seed("Y"));
    assert_eq!(second.opaque, 0x51);
    assert_eq!(second.value, seed("X"));
}

/// A non-reorderable command is a barrier: it waits for every earlier
/// reorder-tagged request before executing.
#[tokio::test]
async fn non_reorderable_command_is_a_barrier() {
    let (_server, _engine, mut stream) = start_blocking_server().await;

    mcbp::send(&mut stream, mcbp::hello(&[0x000e /* unordered */], 1)).await;
    mcbp::read_packet(&mut stream).await;
    mcbp::send(&mut stream, mcbp::set(b"slow:k", b"K", Datatype::RAW, 2)).await;
    mcbp::read_packet(&mut stream).await;

    mcbp::send(
        &mut stream,
        mcbp::get(b"slow:k", 0x61).frame_info(&FrameInfo::Reorder),
    )
    .await;
    // Set is not on the reorder whitelist: it must not run until the
    // suspended get has completed.
    mcbp::send(&mut stream, mcbp::set(b"after", b"!", Datatype::RAW, 0x62)).await;

    let first = mcbp::read_packet(&mut stream).await;
    let second = mcbp::read_packet(&mut stream).await;
    assert_eq!(first.opaque, 0x61, "barrier waits for earlier requests");
    assert_eq!(second.opaque, 0x62);
    assert_eq!(second.status(), Status::Success as u16);
}

/// Unordered execution negotiated: tagged requests complete and
/// responses correlate by opaque.
#[tokio::test]
async fn unordered_execution_correlates_by_opaque() {
    let (_server, mut stream) = start_server().await;

    mcbp::send(&mut stream, mcbp::hello(&[0x000e /* unordered */], 1)).await;
    mcbp::read_packet(&mut stream).await;

    for (key, opaque) in [(b"u1", 0x100u32), (b"u2", 0x200), (b"u3", 0x300)] {
        mcbp::send(&mut stream, mcbp::set(key, b"x", Datatype::RAW, opaque)).await;
        mcbp::read_packet(&mut stream).await;
    }

    mcbp::send(&mut stream, mcbp::get(b"u1", 1).frame_info(&FrameInfo::Reorder)).await;
    mcbp::send(&mut stream, mcbp::get(b"u2", 2).frame_info(&FrameInfo::Reorder)).await;
    mcbp::send(&mut stream, mcbp::get(b"u3", 3).frame_info(&FrameInfo::Reorder)).await;

    let mut seen = HashMap::new();
    for _ in 0..3 {
        let response = mcbp::read_packet(&mut stream).await;
        assert_eq!(response.status(), Status::Success as u16);
        seen.insert(response.opaque, response.value);
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[&1], b"x");
    assert_eq!(seen[&2], b"x");
    assert_eq!(seen[&3], b"x");
}
