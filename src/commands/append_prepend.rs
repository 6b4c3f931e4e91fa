//! Append / prepend executor with CAS retry.

use super::context::{CommandContext, CAS_RETRY_LIMIT};
use super::get::kv_engine;
use super::mutation::mutation_extras;
use crate::engine::{EngineError, EngineResult, Item, StoreSemantics};
use crate::protocol::{ClientOpcode, Datatype, Status};
use crate::server::connection::Connection;
use crate::server::cookie::Cookie;
use bytes::{Bytes, BytesMut};

pub(super) struct AppendPrependContext {
    append: bool,
    quiet: bool,
    retries: u32,
}

impl AppendPrependContext {
    fn new(cookie: &Cookie) -> Self {
        let (append, quiet) = match cookie.opcode() {
            Some(ClientOpcode::Append) => (true, false),
            Some(ClientOpcode::Appendq) => (true, true),
            Some(ClientOpcode::Prepend) => (false, false),
            _ => (false, true),
        };
        Self {
            append,
            quiet,
            retries: 0,
        }
    }
}

impl CommandContext for AppendPrependContext {
    fn step(&mut self, cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
        let engine = kv_engine(conn)?;
        let token = conn.token_for(cookie.slot());
        let request = cookie.request().clone();
        let vbucket = request.header.vbucket_or_status;

        loop {
            let existing = match engine.get(token, request.key(), vbucket) {
                Ok(item) => item,
                Err(EngineError::KeyNotFound) => return Err(EngineError::NotStored),
                Err(e) => return Err(e),
            };

            // The caller may pin the concatenation to a specific document
            // generation with the request CAS.
            if request.header.cas != 0 && request.header.cas != existing.meta.cas {
                return Err(EngineError::KeyExists);
            }

            let mut combined =
                BytesMut::with_capacity(existing.value.len() + request.header.value_len());
            if self.append {
                combined.extend_from_slice(&existing.value);
                combined.extend_from_slice(cookie.request().value());
            } else {
                combined.extend_from_slice(cookie.request().value());
                combined.extend_from_slice(&existing.value);
            }

            let item = Item {
                key: Bytes::copy_from_slice(request.key()),
                value: combined.freeze(),
                meta: existing.meta,
            };
            match engine.store(
                token,
                &item,
                existing.meta.cas,
                StoreSemantics::Replace,
                cookie.durability,
                vbucket,
            ) {
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
                        &[],
                        Datatype::RAW,
                        meta.cas,
                    );
                }
                Err(EngineError::KeyExists) | Err(EngineError::KeyNotFound) => {
                    if request.header.cas != 0 {
                        // An explicit CAS is never retried on behalf of
                        // the client.
                        return Err(EngineError::KeyExists);
                    }
                    self.retries += 1;
                    if self.retries > CAS_RETRY_LIMIT {
                        return Err(EngineError::TempFail);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub(super) fn append_prepend_executor(
    cookie: &mut Cookie,
    conn: &mut Connection,
) -> EngineResult<()> {
    super::run_context(cookie, conn, |cookie, _conn| {
        Ok(Box::new(AppendPrependContext::new(cookie)))
    })
}
