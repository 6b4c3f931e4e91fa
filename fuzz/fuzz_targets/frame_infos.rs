//! Fuzz target for frame-info decoding.
//!
//! Arbitrary framing-extras bytes must either decode into recognized
//! items or be rejected; buffer overruns must never read out of bounds.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = atrium::protocol::decode_frame_infos(data, |info| {
        // Re-encoding a decoded item must produce a parseable item.
        let mut buf = bytes::BytesMut::new();
        info.encode(&mut buf);
        atrium::protocol::decode_frame_infos(&buf, |_| Ok(())).expect("re-encode must decode");
        Ok(())
    });
});
