//! Per-opcode request validation.
//!
//! Validators check the shape of a request — extras size, presence of key
//! and value, CAS restrictions — before any privilege evaluation or
//! engine work. They run after header sanity and frame-info parsing.

use super::ValidationFailure;
use crate::protocol::Frame;
use crate::server::connection::Connection;

#[derive(Clone, Copy, PartialEq)]
enum Extras {
    None,
    Exactly(usize),
    OneOf(&'static [usize]),
}

#[derive(Clone, Copy, PartialEq)]
enum Key {
    Required,
    Absent,
    Any,
}

#[derive(Clone, Copy, PartialEq)]
enum Value {
    Required,
    Absent,
    Any,
}

fn shape(frame: &Frame, extras: Extras, key: Key, value: Value) -> Result<(), ValidationFailure> {
    let extras_len = usize::from(frame.header.extras_len);
    let ok = match extras {
        Extras::None => extras_len == 0,
        Extras::Exactly(n) => extras_len == n,
        Extras::OneOf(choices) => choices.contains(&extras_len),
    };
    if !ok {
        return Err(ValidationFailure::einval(format!(
            "invalid extras size: {extras_len}"
        )));
    }

    let key_len = usize::from(frame.header.key_len);
    match key {
        Key::Required if key_len == 0 => {
            return Err(ValidationFailure::einval("key is required"));
        }
        Key::Absent if key_len != 0 => {
            return Err(ValidationFailure::einval("key must not be present"));
        }
        _ => {}
    }

    let value_len = frame.header.value_len();
    match value {
        Value::Required if value_len == 0 => {
            return Err(ValidationFailure::einval("value is required"));
        }
        Value::Absent if value_len != 0 => {
            return Err(ValidationFailure::einval("value must not be present"));
        }
        _ => {}
    }

    Ok(())
}

fn no_cas(frame: &Frame) -> Result<(), ValidationFailure> {
    if frame.header.cas != 0 {
        return Err(ValidationFailure::einval("cas must not be set"));
    }
    Ok(())
}

// === Data path ===

pub(super) fn get(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Required, Value::Absent)?;
    no_cas(frame)
}

pub(super) fn touch(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::Exactly(4), Key::Required, Value::Absent)
}

pub(super) fn get_locked(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::OneOf(&[0, 4]), Key::Required, Value::Absent)
}

pub(super) fn unlock(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Required, Value::Absent)?;
    if frame.header.cas == 0 {
        return Err(ValidationFailure::einval("unlock requires a cas value"));
    }
    Ok(())
}

pub(super) fn get_meta(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::OneOf(&[0, 1]), Key::Required, Value::Absent)?;
    if frame.header.extras_len == 1 {
        let version = frame.extras()[0];
        if version != 1 && version != 2 {
            return Err(ValidationFailure::einval("invalid meta version"));
        }
    }
    Ok(())
}

pub(super) fn mutation(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::Exactly(8), Key::Required, Value::Any)
}

pub(super) fn append_prepend(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Required, Value::Required)
}

pub(super) fn arithmetic(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::Exactly(20), Key::Required, Value::Absent)?;
    no_cas(frame)
}

pub(super) fn remove(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Required, Value::Absent)
}

// === Handshake and administration ===

pub(super) fn hello(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Any, Value::Any)?;
    if frame.header.value_len() % 2 != 0 {
        return Err(ValidationFailure::einval(
            "hello features must be an even number of bytes",
        ));
    }
    if frame.header.key_len > 200 {
        return Err(ValidationFailure::einval("agent name too long"));
    }
    Ok(())
}

pub(super) fn no_key_no_value(
    frame: &Frame,
    _conn: &Connection,
) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Absent, Value::Absent)
}

pub(super) fn verbosity(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::Exactly(4), Key::Absent, Value::Absent)
}

pub(super) fn stat(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Any, Value::Absent)
}

pub(super) fn flush(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    // Historical clients send a 4-byte delay; a non-zero delay is not
    // supported any more.
    shape(frame, Extras::OneOf(&[0, 4]), Key::Absent, Value::Absent)?;
    if frame.header.extras_len == 4 {
        let extras = frame.extras();
        let delay = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);
        if delay != 0 {
            return Err(ValidationFailure::einval("delayed flush is not supported"));
        }
    }
    Ok(())
}

pub(super) fn sasl_auth(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Required, Value::Any)
}

pub(super) fn ioctl_get(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Required, Value::Absent)
}

pub(super) fn ioctl_set(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Required, Value::Any)
}

pub(super) fn config_validate(
    frame: &Frame,
    _conn: &Connection,
) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Absent, Value::Required)
}

pub(super) fn audit_put(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::Exactly(4), Key::Absent, Value::Required)
}

pub(super) fn select_bucket(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Required, Value::Absent)
}

pub(super) fn set_cluster_config(
    frame: &Frame,
    _conn: &Connection,
) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Any, Value::Required)
}

pub(super) fn set_ctrl_token(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::Exactly(8), Key::Absent, Value::Absent)?;
    let extras = frame.extras();
    let token = u64::from_be_bytes([
        extras[0], extras[1], extras[2], extras[3], extras[4], extras[5], extras[6], extras[7],
    ]);
    if token == 0 {
        return Err(ValidationFailure::einval("control token must not be zero"));
    }
    Ok(())
}

pub(super) fn update_external_user_permissions(
    frame: &Frame,
    _conn: &Connection,
) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Required, Value::Required)
}

pub(super) fn drop_privilege(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Required, Value::Absent)
}

pub(super) fn get_error_map(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Absent, Value::Required)?;
    if frame.header.value_len() != 2 {
        return Err(ValidationFailure::einval(
            "error map request carries a 2-byte version",
        ));
    }
    Ok(())
}

// === CDC ===

pub(super) fn dcp_open(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::Exactly(8), Key::Required, Value::Absent)
}

pub(super) fn dcp_add_stream(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::Exactly(4), Key::Absent, Value::Absent)
}

pub(super) fn no_extras_no_value(
    frame: &Frame,
    _conn: &Connection,
) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Any, Value::Absent)
}

pub(super) fn dcp_stream_req(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::Exactly(48), Key::Absent, Value::Any)
}

pub(super) fn dcp_control(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::None, Key::Required, Value::Required)
}

pub(super) fn dcp_buffer_ack(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::Exactly(4), Key::Absent, Value::Absent)
}

pub(super) fn dcp_seqno_ack(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    shape(frame, Extras::Exactly(8), Key::Absent, Value::Absent)
}

/// Consumer-side CDC messages are accepted structurally and rejected at
/// execution when the engine has no consumer role.
pub(super) fn any(_frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    Ok(())
}

// === Subdocument ===

fn subdoc_extras(frame: &Frame, choices: &'static [usize]) -> Result<(), ValidationFailure> {
    shape(frame, Extras::OneOf(choices), Key::Required, Value::Any)
}

pub(super) fn subdoc_lookup(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    // pathlen(2) + flags(1) [+ doc_flags(1)]
    subdoc_extras(frame, &[3, 4])?;
    subdoc_path_fits(frame)
}

pub(super) fn subdoc_mutation(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    // pathlen(2) + flags(1) [+ expiry(4)] [+ doc_flags(1)]
    subdoc_extras(frame, &[3, 4, 7, 8])?;
    subdoc_path_fits(frame)
}

pub(super) fn subdoc_multi(frame: &Frame, _conn: &Connection) -> Result<(), ValidationFailure> {
    // [expiry(4)] [+ doc_flags(1)]
    shape(
        frame,
        Extras::OneOf(&[0, 1, 4, 5]),
        Key::Required,
        Value::Required,
    )
}

fn subdoc_path_fits(frame: &Frame) -> Result<(), ValidationFailure> {
    let extras = frame.extras();
    let path_len = usize::from(u16::from_be_bytes([extras[0], extras[1]]));
    if path_len > frame.header.value_len() {
        return Err(ValidationFailure::einval("path exceeds the request body"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientOpcode, Frame, ParseOutcome, RequestBuilder};
    use bytes::BytesMut;

    fn build(builder: RequestBuilder) -> Frame {
        let mut buf = BytesMut::new();
        builder.build(&mut buf);
        match Frame::parse(&buf, 1024 * 1024) {
            ParseOutcome::Complete(frame) => frame,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn get_requires_key() {
        let frame = build(RequestBuilder::new(ClientOpcode::Get));
        let failure = get_shape_error(&frame);
        assert!(failure.context.contains("key"));
    }

    fn get_shape_error(frame: &Frame) -> ValidationFailure {
        shape(frame, Extras::None, Key::Required, Value::Absent).unwrap_err()
    }

    #[test]
    fn mutation_extras_size() {
        let frame = build(
            RequestBuilder::new(ClientOpcode::Set)
                .key(b"k")
                .extras(&[0; 8])
                .value(b"v"),
        );
        assert!(shape(&frame, Extras::Exactly(8), Key::Required, Value::Any).is_ok());

        let frame = build(RequestBuilder::new(ClientOpcode::Set).key(b"k").value(b"v"));
        assert!(shape(&frame, Extras::Exactly(8), Key::Required, Value::Any).is_err());
    }

    #[test]
    fn hello_value_must_be_even() {
        let dummy_conn_check = |frame: &Frame| {
            if frame.header.value_len() % 2 != 0 {
                Err(())
            } else {
                Ok(())
            }
        };
        let frame = build(RequestBuilder::new(ClientOpcode::Hello).value(&[0, 1, 2]));
        assert!(dummy_conn_check(&frame).is_err());
        let frame = build(RequestBuilder::new(ClientOpcode::Hello).value(&[0, 1, 0, 3]));
        assert!(dummy_conn_check(&frame).is_ok());
    }

    #[test]
    fn flush_rejects_delay() {
        let frame = build(
            RequestBuilder::new(ClientOpcode::Flush).extras(&1u32.to_be_bytes()),
        );
        // Shape passes, the delay check fails.
        assert!(shape(&frame, Extras::OneOf(&[0, 4]), Key::Absent, Value::Absent).is_ok());
        let extras = frame.extras();
        let delay = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);
        assert_ne!(delay, 0);
    }
}
