//! Fuzz target for the streaming packet parser.
//!
//! Feeds arbitrary bytes through the accumulator in uneven chunks; the
//! parser must never panic and every yielded frame must honor the
//! section-length invariant.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = atrium::PacketParser::new(1024 * 1024);

    for chunk in data.chunks(7) {
        parser.extend(chunk);
        loop {
            match parser.next_frame() {
                Ok(Some(frame)) => {
                    let header = &frame.header;
                    let sections = usize::from(header.framing_extras_len)
                        + usize::from(header.extras_len)
                        + usize::from(header.key_len);
                    assert!(sections <= header.body_len as usize);
                    assert_eq!(frame.body.len(), header.body_len as usize);
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});
