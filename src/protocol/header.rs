//! Fixed packet header parsing and emission.
//!
//! Layout (24 bytes, big-endian):
//!
//! ```text
//! magic(1) | opcode(1) | keylen(2) | extlen(1) | datatype(1) |
//! vbucket-or-status(2) | bodylen(4) | opaque(4) | cas(8)
//! ```
//!
//! On the alt magics the high byte of the keylen field is repurposed as
//! the framing-extras length and the key length shrinks to the low byte.

use super::Magic;
use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 24;

/// Outcome of an incremental parse attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome<T> {
    /// A complete item was decoded
    Complete(T),
    /// More bytes are required
    NeedMore,
    /// The input can never become valid
    Invalid(ProtocolError),
}

/// A decoded fixed header in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Packet family and direction
    pub magic: Magic,
    /// Raw opcode byte; interpretation depends on the magic
    pub opcode: u8,
    /// Length of the framing extras section (alt magics only)
    pub framing_extras_len: u8,
    /// Length of the key section
    pub key_len: u16,
    /// Length of the extras section
    pub extras_len: u8,
    /// Raw datatype bits
    pub datatype: u8,
    /// vbucket id on requests, status code on responses
    pub vbucket_or_status: u16,
    /// Total body length (framing extras + extras + key + value)
    pub body_len: u32,
    /// Correlation token, echoed verbatim in the response
    pub opaque: u32,
    /// Compare-and-swap value; zero means unconstrained / unchanged
    pub cas: u64,
}

impl Header {
    /// Parse a header from the front of `buf`.
    ///
    /// `max_packet_size` bounds the declared total size; a packet whose
    /// body would exceed it is invalid regardless of how many bytes have
    /// arrived so far.
    pub fn parse(buf: &[u8], max_packet_size: usize) -> ParseOutcome<Header> {
        if buf.len() < HEADER_LEN {
            return ParseOutcome::NeedMore;
        }

        let magic = match Magic::from_u8(buf[0]) {
            Some(magic) => magic,
            None => return ParseOutcome::Invalid(ProtocolError::InvalidMagic(buf[0])),
        };

        let (framing_extras_len, key_len) = if magic.is_alt() {
            (buf[2], u16::from(buf[3]))
        } else {
            (0, u16::from_be_bytes([buf[2], buf[3]]))
        };

        let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if body_len as usize > max_packet_size {
            return ParseOutcome::Invalid(ProtocolError::PacketTooLarge {
                len: body_len as usize,
                max: max_packet_size,
            });
        }

        ParseOutcome::Complete(Header {
            magic,
            opcode: buf[1],
            framing_extras_len,
            key_len,
            extras_len: buf[4],
            datatype: buf[5],
            vbucket_or_status: u16::from_be_bytes([buf[6], buf[7]]),
            body_len,
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        })
    }

    /// Total packet size including the header.
    #[inline]
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.body_len as usize
    }

    /// Check that the declared section lengths fit inside the body.
    pub fn validate_sections(&self) -> Result<(), ProtocolError> {
        let framing = usize::from(self.framing_extras_len);
        let extras = usize::from(self.extras_len);
        let key = usize::from(self.key_len);
        let body = self.body_len as usize;
        if framing + extras + key > body {
            return Err(ProtocolError::SectionOverflow {
                framing,
                extras,
                key,
                body,
            });
        }
        Ok(())
    }

    /// Length of the value section.
    #[inline]
    pub fn value_len(&self) -> usize {
        self.body_len as usize
            - usize::from(self.framing_extras_len)
            - usize::from(self.extras_len)
            - usize::from(self.key_len)
    }

    /// Emit the header in wire format.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u8(self.magic as u8);
        dst.put_u8(self.opcode);
        if self.magic.is_alt() {
            dst.put_u8(self.framing_extras_len);
            dst.put_u8(self.key_len as u8);
        } else {
            dst.put_u16(self.key_len);
        }
        dst.put_u8(self.extras_len);
        dst.put_u8(self.datatype);
        dst.put_u16(self.vbucket_or_status);
        dst.put_u32(self.body_len);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
    }
}

/// A complete packet: decoded header plus the body bytes.
///
/// The body is a cheaply-cloneable [`Bytes`] slice, so a frame may either
/// borrow the connection's receive buffer or own a private copy without
/// changing its shape.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded fixed header
    pub header: Header,
    /// Body: framing extras | extras | key | value
    pub body: Bytes,
}

impl Frame {
    /// Parse a full frame from the front of `buf`.
    ///
    /// Needs `HEADER_LEN + bodylen` bytes; validates that the section
    /// lengths fit inside the body.
    pub fn parse(buf: &[u8], max_packet_size: usize) -> ParseOutcome<Frame> {
        let header = match Header::parse(buf, max_packet_size) {
            ParseOutcome::Complete(header) => header,
            ParseOutcome::NeedMore => return ParseOutcome::NeedMore,
            ParseOutcome::Invalid(e) => return ParseOutcome::Invalid(e),
        };
        if buf.len() < header.total_len() {
            return ParseOutcome::NeedMore;
        }
        if let Err(e) = header.validate_sections() {
            return ParseOutcome::Invalid(e);
        }
        let body = Bytes::copy_from_slice(&buf[HEADER_LEN..header.total_len()]);
        ParseOutcome::Complete(Frame { header, body })
    }

    /// Assemble a frame from a decoded header and its body bytes.
    pub fn from_parts(header: Header, body: Bytes) -> Self {
        Frame { header, body }
    }

    /// The framing extras section (empty unless the magic is alt).
    #[inline]
    pub fn framing_extras(&self) -> &[u8] {
        &self.body[..usize::from(self.header.framing_extras_len)]
    }

    /// The extras section.
    #[inline]
    pub fn extras(&self) -> &[u8] {
        let start = usize::from(self.header.framing_extras_len);
        &self.body[start..start + usize::from(self.header.extras_len)]
    }

    /// The key section.
    #[inline]
    pub fn key(&self) -> &[u8] {
        let start =
            usize::from(self.header.framing_extras_len) + usize::from(self.header.extras_len);
        &self.body[start..start + usize::from(self.header.key_len)]
    }

    /// The value section.
    #[inline]
    pub fn value(&self) -> &[u8] {
        let start = usize::from(self.header.framing_extras_len)
            + usize::from(self.header.extras_len)
            + usize::from(self.header.key_len);
        &self.body[start..]
    }

    /// The value section as an owned slice of the body.
    pub fn value_bytes(&self) -> Bytes {
        let start = usize::from(self.header.framing_extras_len)
            + usize::from(self.header.extras_len)
            + usize::from(self.header.key_len);
        self.body.slice(start..)
    }

    /// Serialize the whole packet in wire format.
    pub fn write_to(&self, dst: &mut BytesMut) {
        self.header.write_to(dst);
        dst.extend_from_slice(&self.body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Magic;

    const MAX: usize = 30 * 1024 * 1024;

    fn sample_header() -> Header {
        Header {
            magic: Magic::ClientRequest,
            opcode: 0x00,
            framing_extras_len: 0,
            key_len: 3,
            extras_len: 0,
            datatype: 0,
            vbucket_or_status: 0,
            body_len: 3,
            opaque: 0xdead_beef,
            cas: 0,
        }
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header();
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        match Header::parse(&buf, MAX) {
            ParseOutcome::Complete(parsed) => assert_eq!(parsed, header),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn alt_header_splits_keylen() {
        let header = Header {
            magic: Magic::AltClientRequest,
            framing_extras_len: 5,
            key_len: 7,
            body_len: 12,
            ..sample_header()
        };
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(buf[2], 5);
        assert_eq!(buf[3], 7);
        match Header::parse(&buf, MAX) {
            ParseOutcome::Complete(parsed) => {
                assert_eq!(parsed.framing_extras_len, 5);
                assert_eq!(parsed.key_len, 7);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn short_input_needs_more() {
        let mut buf = BytesMut::new();
        sample_header().write_to(&mut buf);
        assert_eq!(Header::parse(&buf[..10], MAX), ParseOutcome::NeedMore);
    }

    #[test]
    fn bad_magic_is_invalid() {
        let mut buf = BytesMut::new();
        sample_header().write_to(&mut buf);
        buf[0] = 0x42;
        assert!(matches!(
            Header::parse(&buf, MAX),
            ParseOutcome::Invalid(ProtocolError::InvalidMagic(0x42))
        ));
    }

    #[test]
    fn oversized_body_is_invalid() {
        let header = Header {
            body_len: (MAX + 1) as u32,
            ..sample_header()
        };
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert!(matches!(
            Header::parse(&buf, MAX),
            ParseOutcome::Invalid(ProtocolError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn frame_sections() {
        // extras = [1, 2], key = "ab", value = "xyz"
        let header = Header {
            magic: Magic::ClientRequest,
            extras_len: 2,
            key_len: 2,
            body_len: 7,
            ..sample_header()
        };
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        buf.extend_from_slice(&[1, 2, b'a', b'b', b'x', b'y', b'z']);
        match Frame::parse(&buf, MAX) {
            ParseOutcome::Complete(frame) => {
                assert_eq!(frame.extras(), &[1, 2]);
                assert_eq!(frame.key(), b"ab");
                assert_eq!(frame.value(), b"xyz");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn frame_rejects_section_overflow() {
        let header = Header {
            extras_len: 4,
            key_len: 4,
            body_len: 6,
            ..sample_header()
        };
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        buf.extend_from_slice(&[0; 6]);
        assert!(matches!(
            Frame::parse(&buf, MAX),
            ParseOutcome::Invalid(ProtocolError::SectionOverflow { .. })
        ));
    }
}
