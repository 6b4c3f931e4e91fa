//! Property-based tests for the wire codec.
//!
//! These verify the round-trip and rejection invariants of the framing
//! layer: every well-formed packet parses back to what was written, the
//! section lengths always fit the declared body, and arbitrary input
//! never panics the parser.

use atrium::protocol::{
    decode_frame_infos, ClientOpcode, DurabilityLevel, DurabilityRequirement, Frame, FrameInfo,
    Header, Magic, PacketParser, ParseOutcome, RequestBuilder, HEADER_LEN,
};
use bytes::BytesMut;
use proptest::prelude::*;
use std::time::Duration;

const MAX: usize = 30 * 1024 * 1024;

fn arb_magic() -> impl Strategy<Value = Magic> {
    prop::sample::select(vec![
        Magic::ClientRequest,
        Magic::ClientResponse,
        Magic::AltClientRequest,
        Magic::AltClientResponse,
        Magic::ServerRequest,
        Magic::ServerResponse,
    ])
}

fn arb_frame_info() -> impl Strategy<Value = FrameInfo> {
    prop_oneof![
        Just(FrameInfo::Reorder),
        prop::sample::select(vec![
            DurabilityLevel::Majority,
            DurabilityLevel::MajorityAndPersistOnMaster,
            DurabilityLevel::PersistToMajority,
        ])
        .prop_flat_map(|level| {
            prop::option::of(0u16..=u16::MAX).prop_map(move |timeout| {
                FrameInfo::Durability(DurabilityRequirement {
                    level,
                    timeout: timeout.map(|ms| Duration::from_millis(u64::from(ms))),
                })
            })
        }),
        any::<u16>().prop_map(FrameInfo::DcpStreamId),
        prop::collection::vec(any::<u8>(), 1..64).prop_map(FrameInfo::OpenTracingContext),
    ]
}

proptest! {
    /// Every header written is parsed back identically.
    #[test]
    fn header_round_trip(
        magic in arb_magic(),
        opcode in any::<u8>(),
        framing_len in 0u8..=255,
        key_len in 0u16..=255,
        extras_len in 0u8..=255,
        datatype in 0u8..=7,
        vbucket in any::<u16>(),
        opaque in any::<u32>(),
        cas in any::<u64>(),
    ) {
        let framing_len = if magic.is_alt() { framing_len } else { 0 };
        let key_len = if magic.is_alt() { key_len & 0xff } else { key_len };
        let body_len = u32::from(framing_len) + u32::from(key_len) + u32::from(extras_len);

        let header = Header {
            magic,
            opcode,
            framing_extras_len: framing_len,
            key_len,
            extras_len,
            datatype,
            vbucket_or_status: vbucket,
            body_len,
            opaque,
            cas,
        };
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        prop_assert_eq!(buf.len(), HEADER_LEN);

        match Header::parse(&buf, MAX) {
            ParseOutcome::Complete(parsed) => prop_assert_eq!(parsed, header),
            other => prop_assert!(false, "unexpected outcome: {:?}", other),
        }
    }

    /// Section accessors cover the body exactly.
    #[test]
    fn frame_sections_partition_body(
        extras in prop::collection::vec(any::<u8>(), 0..32),
        key in prop::collection::vec(any::<u8>(), 0..32),
        value in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut buf = BytesMut::new();
        RequestBuilder::new(ClientOpcode::Set)
            .extras(&extras)
            .key(&key)
            .value(&value)
            .build(&mut buf);

        match Frame::parse(&buf, MAX) {
            ParseOutcome::Complete(frame) => {
                prop_assert_eq!(frame.extras(), &extras[..]);
                prop_assert_eq!(frame.key(), &key[..]);
                prop_assert_eq!(frame.value(), &value[..]);
                let total = frame.framing_extras().len()
                    + frame.extras().len()
                    + frame.key().len()
                    + frame.value().len();
                prop_assert_eq!(total, frame.header.body_len as usize);
            }
            other => prop_assert!(false, "unexpected outcome: {:?}", other),
        }
    }

    /// encode(decode(x)) == x for all well-formed frame-info sequences.
    #[test]
    fn frame_info_round_trip(infos in prop::collection::vec(arb_frame_info(), 0..8)) {
        let mut encoded = BytesMut::new();
        for info in &infos {
            info.encode(&mut encoded);
        }

        let mut decoded = Vec::new();
        decode_frame_infos(&encoded, |info| {
            decoded.push(info);
            Ok(())
        })
        .unwrap();
        prop_assert_eq!(decoded, infos);
    }

    /// The streaming parser never panics on arbitrary input; it either
    /// yields frames or reports an error.
    #[test]
    fn parser_handles_arbitrary_input(chunks in prop::collection::vec(
        prop::collection::vec(any::<u8>(), 0..128), 0..8)
    ) {
        let mut parser = PacketParser::new(4096);
        for chunk in &chunks {
            parser.extend(chunk);
            loop {
                match parser.next_frame() {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(_) => return Ok(()),
                }
            }
        }
    }

    /// Frame-info decoding rejects any truncation of a valid encoding.
    #[test]
    fn truncated_frame_infos_rejected(
        info in arb_frame_info(),
        cut in 1usize..16,
    ) {
        let mut encoded = BytesMut::new();
        info.encode(&mut encoded);
        prop_assume!(cut < encoded.len());
        let truncated = &encoded[..encoded.len() - cut];

        let result = decode_frame_infos(truncated, |_| Ok(()));
        prop_assert!(result.is_err());
    }
}
