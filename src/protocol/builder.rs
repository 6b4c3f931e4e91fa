//! Request and response writers.
//!
//! Builders collect the header fields and body sections, then emit the
//! packet in wire order. Adding framing extras switches the packet onto
//! the corresponding alt magic. `write_prefix` emits everything except the
//! value bytes so callers can append the value as a separately-owned
//! segment (zero-copy chaining).

use super::{ClientOpcode, Datatype, FrameInfo, Magic, ServerOpcode, Status};
use bytes::BytesMut;

/// Writer for request packets (client or server initiated).
#[derive(Debug)]
pub struct RequestBuilder {
    magic: Magic,
    opcode: u8,
    datatype: Datatype,
    vbucket: u16,
    opaque: u32,
    cas: u64,
    framing_extras: BytesMut,
    extras: BytesMut,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl RequestBuilder {
    /// Start a client request.
    pub fn new(opcode: ClientOpcode) -> Self {
        Self::raw(Magic::ClientRequest, opcode as u8)
    }

    /// Start a server-initiated request.
    pub fn server(opcode: ServerOpcode) -> Self {
        Self::raw(Magic::ServerRequest, opcode as u8)
    }

    fn raw(magic: Magic, opcode: u8) -> Self {
        Self {
            magic,
            opcode,
            datatype: Datatype::RAW,
            vbucket: 0,
            opaque: 0,
            cas: 0,
            framing_extras: BytesMut::new(),
            extras: BytesMut::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    /// Set the vbucket id.
    pub fn vbucket(mut self, vbucket: u16) -> Self {
        self.vbucket = vbucket;
        self
    }

    /// Set the opaque correlation token.
    pub fn opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    /// Set the CAS value.
    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Set the datatype bits.
    pub fn datatype(mut self, datatype: Datatype) -> Self {
        self.datatype = datatype;
        self
    }

    /// Set the extras section.
    pub fn extras(mut self, extras: &[u8]) -> Self {
        self.extras.clear();
        self.extras.extend_from_slice(extras);
        self
    }

    /// Set the key section.
    pub fn key(mut self, key: &[u8]) -> Self {
        self.key.clear();
        self.key.extend_from_slice(key);
        self
    }

    /// Set the value section.
    pub fn value(mut self, value: &[u8]) -> Self {
        self.value.clear();
        self.value.extend_from_slice(value);
        self
    }

    /// Append a frame-info item; the packet becomes an alt request.
    pub fn frame_info(mut self, info: &FrameInfo) -> Self {
        info.encode(&mut self.framing_extras);
        self.magic = Magic::AltClientRequest;
        self
    }

    /// Emit the complete packet into `dst`.
    pub fn build(self, dst: &mut BytesMut) {
        let value = self.into_prefix_with(dst, None);
        dst.extend_from_slice(&value);
    }

    /// Emit the header and all sections except the value. The declared
    /// body length accounts for `value_len` trailing bytes the caller
    /// will append.
    pub fn write_prefix(self, dst: &mut BytesMut, value_len: usize) {
        self.into_prefix_with(dst, Some(value_len));
    }

    fn into_prefix_with(self, dst: &mut BytesMut, chained_value_len: Option<usize>) -> Vec<u8> {
        let value_len = chained_value_len.unwrap_or(self.value.len());
        let body_len = self.framing_extras.len() + self.extras.len() + self.key.len() + value_len;

        super::Header {
            magic: self.magic,
            opcode: self.opcode,
            framing_extras_len: self.framing_extras.len() as u8,
            key_len: self.key.len() as u16,
            extras_len: self.extras.len() as u8,
            datatype: self.datatype.bits(),
            vbucket_or_status: self.vbucket,
            body_len: body_len as u32,
            opaque: self.opaque,
            cas: self.cas,
        }
        .write_to(dst);
        dst.extend_from_slice(&self.framing_extras);
        dst.extend_from_slice(&self.extras);
        dst.extend_from_slice(&self.key);
        self.value
    }
}

/// Writer for response packets.
#[derive(Debug)]
pub struct ResponseBuilder {
    magic: Magic,
    opcode: u8,
    status: Status,
    datatype: Datatype,
    opaque: u32,
    cas: u64,
    framing_extras: BytesMut,
    extras: BytesMut,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl ResponseBuilder {
    /// Start a response to a client request.
    pub fn new(opcode: ClientOpcode) -> Self {
        Self::raw(Magic::ClientResponse, opcode as u8)
    }

    /// Start a response with a raw opcode byte (used when answering
    /// opcodes outside the implemented surface).
    pub fn raw_opcode(opcode: u8) -> Self {
        Self::raw(Magic::ClientResponse, opcode)
    }

    /// Start a response to a server-initiated request.
    pub fn server(opcode: ServerOpcode) -> Self {
        Self::raw(Magic::ServerResponse, opcode as u8)
    }

    fn raw(magic: Magic, opcode: u8) -> Self {
        Self {
            magic,
            opcode,
            status: Status::Success,
            datatype: Datatype::RAW,
            opaque: 0,
            cas: 0,
            framing_extras: BytesMut::new(),
            extras: BytesMut::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    /// Set the response status.
    pub fn status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Set the opaque correlation token (copied from the request).
    pub fn opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    /// Set the CAS value.
    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Set the datatype bits.
    pub fn datatype(mut self, datatype: Datatype) -> Self {
        self.datatype = datatype;
        self
    }

    /// Set the extras section.
    pub fn extras(mut self, extras: &[u8]) -> Self {
        self.extras.clear();
        self.extras.extend_from_slice(extras);
        self
    }

    /// Set the key section.
    pub fn key(mut self, key: &[u8]) -> Self {
        self.key.clear();
        self.key.extend_from_slice(key);
        self
    }

    /// Set the value section.
    pub fn value(mut self, value: &[u8]) -> Self {
        self.value.clear();
        self.value.extend_from_slice(value);
        self
    }

    /// Append a frame-info item; the packet becomes an alt response.
    pub fn frame_info(mut self, info: &FrameInfo) -> Self {
        info.encode(&mut self.framing_extras);
        self.magic = Magic::AltClientResponse;
        self
    }

    /// Append pre-encoded framing extras (response items use their own id
    /// space); the packet becomes an alt response.
    pub fn raw_framing_extras(mut self, framing: &[u8]) -> Self {
        self.framing_extras.extend_from_slice(framing);
        self.magic = Magic::AltClientResponse;
        self
    }

    /// Emit the complete packet into `dst`.
    pub fn build(self, dst: &mut BytesMut) {
        let body_len =
            self.framing_extras.len() + self.extras.len() + self.key.len() + self.value.len();

        super::Header {
            magic: self.magic,
            opcode: self.opcode,
            framing_extras_len: self.framing_extras.len() as u8,
            key_len: self.key.len() as u16,
            extras_len: self.extras.len() as u8,
            datatype: self.datatype.bits(),
            vbucket_or_status: self.status as u16,
            body_len: body_len as u32,
            opaque: self.opaque,
            cas: self.cas,
        }
        .write_to(dst);
        dst.extend_from_slice(&self.framing_extras);
        dst.extend_from_slice(&self.extras);
        dst.extend_from_slice(&self.key);
        dst.extend_from_slice(&self.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, ParseOutcome, HEADER_LEN};

    const MAX: usize = 30 * 1024 * 1024;

    #[test]
    fn build_simple_request() {
        let mut buf = BytesMut::new();
        RequestBuilder::new(ClientOpcode::Get)
            .key(b"foo")
            .opaque(0xaa)
            .build(&mut buf);

        match Frame::parse(&buf, MAX) {
            ParseOutcome::Complete(frame) => {
                assert_eq!(frame.header.magic, Magic::ClientRequest);
                assert_eq!(frame.header.opcode, ClientOpcode::Get as u8);
                assert_eq!(frame.header.opaque, 0xaa);
                assert_eq!(frame.key(), b"foo");
                assert!(frame.value().is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn frame_info_switches_to_alt() {
        let mut buf = BytesMut::new();
        RequestBuilder::new(ClientOpcode::Get)
            .frame_info(&FrameInfo::Reorder)
            .key(b"k")
            .build(&mut buf);

        match Frame::parse(&buf, MAX) {
            ParseOutcome::Complete(frame) => {
                assert_eq!(frame.header.magic, Magic::AltClientRequest);
                assert_eq!(frame.framing_extras(), &[0x00]);
                assert_eq!(frame.key(), b"k");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn write_prefix_accounts_for_chained_value() {
        let mut buf = BytesMut::new();
        RequestBuilder::new(ClientOpcode::DcpMutation)
            .key(b"doc")
            .write_prefix(&mut buf, 5);

        // header + key present, value chained by the caller
        assert_eq!(buf.len(), HEADER_LEN + 3);
        buf.extend_from_slice(b"hello");
        match Frame::parse(&buf, MAX) {
            ParseOutcome::Complete(frame) => {
                assert_eq!(frame.key(), b"doc");
                assert_eq!(frame.value(), b"hello");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn build_response_with_status() {
        let mut buf = BytesMut::new();
        ResponseBuilder::new(ClientOpcode::Get)
            .status(Status::KeyEnoent)
            .opaque(7)
            .build(&mut buf);

        match Frame::parse(&buf, MAX) {
            ParseOutcome::Complete(frame) => {
                assert_eq!(frame.header.magic, Magic::ClientResponse);
                assert_eq!(frame.header.vbucket_or_status, Status::KeyEnoent as u16);
                assert_eq!(frame.header.opaque, 7);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn server_request_magic() {
        let mut buf = BytesMut::new();
        RequestBuilder::server(ServerOpcode::Authenticate)
            .value(b"{}")
            .build(&mut buf);
        assert_eq!(buf[0], Magic::ServerRequest as u8);
        assert_eq!(buf[1], ServerOpcode::Authenticate as u8);
    }
}
