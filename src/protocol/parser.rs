//! Streaming packet accumulator.
//!
//! Socket reads land in the parser's buffer; complete frames are split off
//! as cheap [`Bytes`] views without copying. Partial packets stay buffered
//! until the next read.

use super::{Frame, Header, ParseOutcome, HEADER_LEN};
use crate::error::ProtocolError;
use bytes::{Buf, BytesMut};

/// Streaming parser for binary-protocol packets.
#[derive(Debug)]
pub struct PacketParser {
    buffer: BytesMut,
    max_packet_size: usize,
}

impl Default for PacketParser {
    fn default() -> Self {
        Self::new(crate::MAX_PACKET_SIZE)
    }
}

impl PacketParser {
    /// Create a parser enforcing the given maximum packet size.
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_packet_size,
        }
    }

    /// Append raw bytes from the socket.
    #[inline]
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Mutable access to the buffer for direct socket reads.
    #[inline]
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Number of buffered bytes not yet consumed.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True if no bytes are buffered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Peek at the header of the next packet without consuming it.
    pub fn peek_header(&self) -> ParseOutcome<Header> {
        Header::parse(&self.buffer, self.max_packet_size)
    }

    /// True iff a complete frame is buffered.
    ///
    /// An invalid header surfaces as an error so the connection can be
    /// terminated rather than waiting for bytes that will never parse.
    pub fn is_packet_available(&self) -> Result<bool, ProtocolError> {
        match Header::parse(&self.buffer, self.max_packet_size) {
            ParseOutcome::Complete(header) => Ok(self.buffer.len() >= header.total_len()),
            ParseOutcome::NeedMore => Ok(false),
            ParseOutcome::Invalid(e) => Err(e),
        }
    }

    /// Split off the next complete frame, if any.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let header = match Header::parse(&self.buffer, self.max_packet_size) {
            ParseOutcome::Complete(header) => header,
            ParseOutcome::NeedMore => return Ok(None),
            ParseOutcome::Invalid(e) => return Err(e),
        };
        if self.buffer.len() < header.total_len() {
            return Ok(None);
        }
        header.validate_sections()?;

        self.buffer.advance(HEADER_LEN);
        let body = self.buffer.split_to(header.body_len as usize).freeze();
        Ok(Some(Frame::from_parts(header, body)))
    }

    /// Shrink the buffer when its capacity has grown far past its
    /// contents, so one oversized packet does not pin memory forever.
    pub fn maybe_shrink(&mut self) {
        const MIN_CAPACITY: usize = 8 * 1024;
        const SHRINK_RATIO: usize = 4;

        let capacity = self.buffer.capacity();
        let len = self.buffer.len();
        if capacity > MIN_CAPACITY && capacity > len.saturating_mul(SHRINK_RATIO) {
            let mut replacement = BytesMut::with_capacity(len.max(MIN_CAPACITY));
            replacement.extend_from_slice(&self.buffer);
            self.buffer = replacement;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientOpcode, RequestBuilder};

    const MAX: usize = 1024 * 1024;

    fn encoded_get(key: &[u8], opaque: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        RequestBuilder::new(ClientOpcode::Get)
            .key(key)
            .opaque(opaque)
            .build(&mut buf);
        buf
    }

    #[test]
    fn split_across_reads() {
        let packet = encoded_get(b"foo", 1);
        let mut parser = PacketParser::new(MAX);

        parser.extend(&packet[..10]);
        assert!(!parser.is_packet_available().unwrap());
        assert!(parser.next_frame().unwrap().is_none());

        parser.extend(&packet[10..]);
        assert!(parser.is_packet_available().unwrap());
        let frame = parser.next_frame().unwrap().unwrap();
        assert_eq!(frame.key(), b"foo");
        assert!(parser.is_empty());
    }

    #[test]
    fn pipelined_packets() {
        let mut parser = PacketParser::new(MAX);
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&encoded_get(b"a", 1));
        stream.extend_from_slice(&encoded_get(b"b", 2));
        parser.extend(&stream);

        let first = parser.next_frame().unwrap().unwrap();
        let second = parser.next_frame().unwrap().unwrap();
        assert_eq!(first.header.opaque, 1);
        assert_eq!(second.header.opaque, 2);
        assert!(parser.next_frame().unwrap().is_none());
    }

    #[test]
    fn invalid_magic_is_an_error() {
        let mut packet = encoded_get(b"x", 1);
        packet[0] = 0x55;
        let mut parser = PacketParser::new(MAX);
        parser.extend(&packet);
        assert!(parser.is_packet_available().is_err());
        assert!(parser.next_frame().is_err());
    }

    #[test]
    fn oversized_packet_is_an_error() {
        let mut parser = PacketParser::new(32);
        let packet = encoded_get(b"0123456789abcdef0123456789abcdef0", 1);
        parser.extend(&packet);
        assert!(matches!(
            parser.next_frame(),
            Err(ProtocolError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn shrink_after_large_packet() {
        let mut parser = PacketParser::new(MAX);
        let big = vec![0u8; 256 * 1024];
        parser.extend(&big);
        parser.buffer_mut().clear();
        parser.maybe_shrink();
        assert!(parser.buffer_mut().capacity() <= 64 * 1024);
    }
}
