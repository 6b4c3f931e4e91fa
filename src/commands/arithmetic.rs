//! Increment / decrement executor.
//!
//! Counters are stored as ASCII decimal strings. The context reads the
//! document, applies the delta (or creates the counter from the request's
//! initial value) and re-stores under CAS; a CAS race restarts the
//! sequence up to the retry budget.

use super::context::{CommandContext, CAS_RETRY_LIMIT};
use super::get::kv_engine;
use super::mutation::mutation_extras;
use crate::engine::{EngineError, EngineResult, Item, ItemMeta, StoreSemantics};
use crate::protocol::{ClientOpcode, Datatype, Status};
use crate::server::connection::Connection;
use crate::server::cookie::Cookie;
use bytes::Bytes;

/// Expiration sentinel meaning "do not create the counter".
const NO_CREATE: u32 = 0xffff_ffff;

enum ArithmeticState {
    GetItem,
    CreateNewItem,
    StoreNewItem {
        value: u64,
        cas: u64,
        semantics: StoreSemantics,
        exptime: u32,
    },
}

pub(super) struct ArithmeticContext {
    state: ArithmeticState,
    increment: bool,
    quiet: bool,
    delta: u64,
    initial: u64,
    expiration: u32,
    retries: u32,
}

impl ArithmeticContext {
    fn new(cookie: &Cookie) -> Self {
        let request = cookie.request();
        let extras = request.extras();
        let delta = u64::from_be_bytes(extras[0..8].try_into().unwrap_or_default());
        let initial = u64::from_be_bytes(extras[8..16].try_into().unwrap_or_default());
        let expiration = u32::from_be_bytes(extras[16..20].try_into().unwrap_or_default());
        let (increment, quiet) = match cookie.opcode() {
            Some(ClientOpcode::Increment) => (true, false),
            Some(ClientOpcode::Incrementq) => (true, true),
            Some(ClientOpcode::Decrement) => (false, false),
            _ => (false, true),
        };
        Self {
            state: ArithmeticState::GetItem,
            increment,
            quiet,
            delta,
            initial,
            expiration,
            retries: 0,
        }
    }
}

impl CommandContext for ArithmeticContext {
    fn step(&mut self, cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
        let engine = kv_engine(conn)?;
        let token = conn.token_for(cookie.slot());
        let request = cookie.request().clone();
        let vbucket = request.header.vbucket_or_status;

        loop {
            match self.state {
                ArithmeticState::GetItem => {
                    match engine.get(token, request.key(), vbucket) {
                        Ok(item) => {
                            let current = parse_counter(&item.value)?;
                            let value = if self.increment {
                                current.wrapping_add(self.delta)
                            } else {
                                current.saturating_sub(self.delta)
                            };
                            self.state = ArithmeticState::StoreNewItem {
                                value,
                                cas: item.meta.cas,
                                semantics: StoreSemantics::Set,
                                exptime: item.meta.exptime,
                            };
                        }
                        Err(EngineError::KeyNotFound) => {
                            self.state = ArithmeticState::CreateNewItem;
                        }
                        Err(e) => return Err(e),
                    }
                }
                ArithmeticState::CreateNewItem => {
                    if self.expiration == NO_CREATE {
                        if self.quiet {
                            return Ok(());
                        }
                        return Err(EngineError::KeyNotFound);
                    }
                    self.state = ArithmeticState::StoreNewItem {
                        value: self.initial,
                        cas: 0,
                        semantics: StoreSemantics::Add,
                        exptime: self.expiration,
                    };
                }
                ArithmeticState::StoreNewItem {
                    value,
                    cas,
                    semantics,
                    exptime,
                } => {
                    let item = Item {
                        key: Bytes::copy_from_slice(request.key()),
                        value: Bytes::from(value.to_string()),
                        meta: ItemMeta {
                            exptime,
                            datatype: Datatype::RAW,
                            ..ItemMeta::default()
                        },
                    };
                    match engine.store(token, &item, cas, semantics, cookie.durability, vbucket) {
                        Ok(meta) => {
                            if self.quiet {
                                return Ok(());
                            }
                            let extras = mutation_extras(conn, &meta);
                            return cookie.send_response(
                                conn,
                                Status::Success,
                                &extras,
                                &[],
                                &value.to_be_bytes(),
                                Datatype::RAW,
                                meta.cas,
                            );
                        }
                        Err(EngineError::KeyExists) | Err(EngineError::KeyNotFound) => {
                            // Lost the race; take it from the top.
                            self.retries += 1;
                            if self.retries > CAS_RETRY_LIMIT {
                                return Err(EngineError::TempFail);
                            }
                            self.state = ArithmeticState::GetItem;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

fn parse_counter(value: &[u8]) -> EngineResult<u64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|text| text.trim().parse::<u64>().ok())
        .ok_or(EngineError::DeltaBadval)
}

pub(super) fn arithmetic_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    super::run_context(cookie, conn, |cookie, _conn| {
        Ok(Box::new(ArithmeticContext::new(cookie)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_parsing() {
        assert_eq!(parse_counter(b"42").unwrap(), 42);
        assert_eq!(parse_counter(b"0").unwrap(), 0);
        assert_eq!(parse_counter(b"not a number"), Err(EngineError::DeltaBadval));
        assert_eq!(parse_counter(b"\xff\xfe"), Err(EngineError::DeltaBadval));
    }
}
