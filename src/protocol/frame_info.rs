//! Frame-info items carried in the framing extras of alt-magic packets.
//!
//! Each item is `(id, payload)` packed with a size-class encoding: the
//! first byte holds the id in the high nibble and the payload length in
//! the low nibble. A nibble of 0xF escapes into the following byte, which
//! carries the remainder after subtracting 0x0F.

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};
use std::time::Duration;

/// Identifiers for the recognized frame-info items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameInfoId {
    /// The request may execute out of order (no payload)
    Reorder = 0,
    /// Durability level, optionally followed by a 16-bit timeout in ms
    DurabilityRequirement = 1,
    /// 2-byte stream id attached to a CDC message
    DcpStreamId = 2,
    /// Opaque tracing context blob
    OpenTracingContext = 3,
}

impl FrameInfoId {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Reorder),
            1 => Some(Self::DurabilityRequirement),
            2 => Some(Self::DcpStreamId),
            3 => Some(Self::OpenTracingContext),
            _ => None,
        }
    }
}

/// Durability level carried in a durability requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DurabilityLevel {
    /// Replicate to a majority of nodes
    Majority = 1,
    /// Majority plus persistence on the active node
    MajorityAndPersistOnMaster = 2,
    /// Persist to a majority of nodes
    PersistToMajority = 3,
}

impl DurabilityLevel {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Majority),
            2 => Some(Self::MajorityAndPersistOnMaster),
            3 => Some(Self::PersistToMajority),
            _ => None,
        }
    }
}

/// A decoded durability requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurabilityRequirement {
    /// Requested level
    pub level: DurabilityLevel,
    /// Optional timeout; `None` uses the engine default
    pub timeout: Option<Duration>,
}

/// A decoded frame-info item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameInfo {
    /// The request may execute out of order
    Reorder,
    /// Durability requirement for the mutation
    Durability(DurabilityRequirement),
    /// Stream id attached to a CDC message
    DcpStreamId(u16),
    /// Opaque tracing context
    OpenTracingContext(Vec<u8>),
}

/// Decode all frame-info items in `framing_extras`, invoking `callback`
/// for each. A buffer overrun or unknown id aborts the walk with an error.
pub fn decode_frame_infos(
    framing_extras: &[u8],
    mut callback: impl FnMut(FrameInfo) -> Result<(), ProtocolError>,
) -> Result<(), ProtocolError> {
    let mut cursor = framing_extras;
    while !cursor.is_empty() {
        let first = cursor[0];
        cursor = &cursor[1..];

        let mut id = u16::from(first >> 4);
        if id == 0x0f {
            let byte = *cursor.first().ok_or(ProtocolError::FrameInfoOverrun)?;
            cursor = &cursor[1..];
            id = u16::from(byte) + 0x0f;
        }

        let mut len = usize::from(first & 0x0f);
        if len == 0x0f {
            let byte = *cursor.first().ok_or(ProtocolError::FrameInfoOverrun)?;
            cursor = &cursor[1..];
            len = usize::from(byte) + 0x0f;
        }

        if cursor.len() < len {
            return Err(ProtocolError::FrameInfoOverrun);
        }
        let payload = &cursor[..len];
        cursor = &cursor[len..];

        let id = FrameInfoId::from_u16(id).ok_or(ProtocolError::UnknownFrameInfo(id))?;
        let info = decode_one(id, payload)?;
        callback(info)?;
    }
    Ok(())
}

fn decode_one(id: FrameInfoId, payload: &[u8]) -> Result<FrameInfo, ProtocolError> {
    let bad_size = |len| ProtocolError::InvalidFrameInfoSize {
        id: id as u16,
        len,
    };
    match id {
        FrameInfoId::Reorder => {
            if !payload.is_empty() {
                return Err(bad_size(payload.len()));
            }
            Ok(FrameInfo::Reorder)
        }
        FrameInfoId::DurabilityRequirement => {
            let level = match payload.len() {
                1 | 3 => {
                    DurabilityLevel::from_u8(payload[0]).ok_or_else(|| bad_size(payload.len()))?
                }
                len => return Err(bad_size(len)),
            };
            let timeout = if payload.len() == 3 {
                let ms = u16::from_be_bytes([payload[1], payload[2]]);
                Some(Duration::from_millis(u64::from(ms)))
            } else {
                None
            };
            Ok(FrameInfo::Durability(DurabilityRequirement {
                level,
                timeout,
            }))
        }
        FrameInfoId::DcpStreamId => {
            if payload.len() != 2 {
                return Err(bad_size(payload.len()));
            }
            Ok(FrameInfo::DcpStreamId(u16::from_be_bytes([
                payload[0], payload[1],
            ])))
        }
        FrameInfoId::OpenTracingContext => {
            if payload.is_empty() {
                return Err(bad_size(0));
            }
            Ok(FrameInfo::OpenTracingContext(payload.to_vec()))
        }
    }
}

/// Encode a single frame-info item into `dst`.
pub fn encode_frame_info(dst: &mut BytesMut, id: FrameInfoId, payload: &[u8]) {
    encode_raw_frame_info(dst, id as u16, payload);
}

/// Encode a frame-info item with a raw id. Response packets use a
/// separate id space from requests (0 there is the server-duration item),
/// so response writers pass ids directly.
pub fn encode_raw_frame_info(dst: &mut BytesMut, id: u16, payload: &[u8]) {
    let len = payload.len();

    let id_nibble = if id < 0x0f { id as u8 } else { 0x0f };
    let len_nibble = if len < 0x0f { len as u8 } else { 0x0f };
    dst.put_u8((id_nibble << 4) | len_nibble);
    if id >= 0x0f {
        dst.put_u8((id - 0x0f) as u8);
    }
    if len >= 0x0f {
        dst.put_u8((len - 0x0f) as u8);
    }
    dst.extend_from_slice(payload);
}

impl FrameInfo {
    /// Encode this item into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            FrameInfo::Reorder => encode_frame_info(dst, FrameInfoId::Reorder, &[]),
            FrameInfo::Durability(req) => {
                let mut payload = [0u8; 3];
                payload[0] = req.level as u8;
                if let Some(timeout) = req.timeout {
                    let ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
                    payload[1..3].copy_from_slice(&ms.to_be_bytes());
                    encode_frame_info(dst, FrameInfoId::DurabilityRequirement, &payload);
                } else {
                    encode_frame_info(dst, FrameInfoId::DurabilityRequirement, &payload[..1]);
                }
            }
            FrameInfo::DcpStreamId(sid) => {
                encode_frame_info(dst, FrameInfoId::DcpStreamId, &sid.to_be_bytes())
            }
            FrameInfo::OpenTracingContext(blob) => {
                encode_frame_info(dst, FrameInfoId::OpenTracingContext, blob)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(buf: &[u8]) -> Result<Vec<FrameInfo>, ProtocolError> {
        let mut out = Vec::new();
        decode_frame_infos(buf, |info| {
            out.push(info);
            Ok(())
        })?;
        Ok(out)
    }

    #[test]
    fn reorder_is_empty() {
        let mut buf = BytesMut::new();
        FrameInfo::Reorder.encode(&mut buf);
        assert_eq!(&buf[..], &[0x00]);
        assert_eq!(decode_all(&buf).unwrap(), vec![FrameInfo::Reorder]);
    }

    #[test]
    fn reorder_with_payload_rejected() {
        // id = 0, len = 1, one payload byte
        assert!(matches!(
            decode_all(&[0x01, 0xaa]),
            Err(ProtocolError::InvalidFrameInfoSize { id: 0, len: 1 })
        ));
    }

    #[test]
    fn durability_one_byte() {
        let infos = decode_all(&[0x11, 0x01]).unwrap();
        assert_eq!(
            infos,
            vec![FrameInfo::Durability(DurabilityRequirement {
                level: DurabilityLevel::Majority,
                timeout: None,
            })]
        );
    }

    #[test]
    fn durability_with_timeout() {
        let infos = decode_all(&[0x13, 0x02, 0x03, 0xe8]).unwrap();
        assert_eq!(
            infos,
            vec![FrameInfo::Durability(DurabilityRequirement {
                level: DurabilityLevel::MajorityAndPersistOnMaster,
                timeout: Some(Duration::from_millis(1000)),
            })]
        );
    }

    #[test]
    fn durability_two_bytes_rejected() {
        assert!(decode_all(&[0x12, 0x01, 0x00]).is_err());
    }

    #[test]
    fn stream_id() {
        let mut buf = BytesMut::new();
        FrameInfo::DcpStreamId(7).encode(&mut buf);
        assert_eq!(&buf[..], &[0x22, 0x00, 0x07]);
        assert_eq!(decode_all(&buf).unwrap(), vec![FrameInfo::DcpStreamId(7)]);
    }

    #[test]
    fn escaped_length() {
        // OpenTracingContext with a 20-byte blob: len nibble escapes.
        let blob = vec![0xabu8; 20];
        let mut buf = BytesMut::new();
        FrameInfo::OpenTracingContext(blob.clone()).encode(&mut buf);
        assert_eq!(buf[0], 0x3f);
        assert_eq!(buf[1], 20 - 0x0f);
        assert_eq!(
            decode_all(&buf).unwrap(),
            vec![FrameInfo::OpenTracingContext(blob)]
        );
    }

    #[test]
    fn unknown_id_rejected() {
        // id nibble 0x4 is unassigned
        assert!(matches!(
            decode_all(&[0x40]),
            Err(ProtocolError::UnknownFrameInfo(4))
        ));
    }

    #[test]
    fn escaped_id_rejected_when_unknown() {
        // id nibble 0xf escapes; 0x01 + 0x0f = 16 which is unassigned
        assert!(matches!(
            decode_all(&[0xf0, 0x01]),
            Err(ProtocolError::UnknownFrameInfo(16))
        ));
    }

    #[test]
    fn truncated_payload_rejected() {
        // DcpStreamId declares 2 bytes but only 1 follows
        assert!(matches!(
            decode_all(&[0x22, 0x00]),
            Err(ProtocolError::FrameInfoOverrun)
        ));
    }

    #[test]
    fn multiple_items() {
        let mut buf = BytesMut::new();
        FrameInfo::Reorder.encode(&mut buf);
        FrameInfo::DcpStreamId(0x1234).encode(&mut buf);
        assert_eq!(
            decode_all(&buf).unwrap(),
            vec![FrameInfo::Reorder, FrameInfo::DcpStreamId(0x1234)]
        );
    }
}
