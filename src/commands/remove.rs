//! Delete executor.

use super::get::kv_engine;
use super::mutation::mutation_extras;
use crate::engine::{EngineError, EngineResult};
use crate::protocol::{ClientOpcode, Datatype, Status};
use crate::server::connection::Connection;
use crate::server::cookie::Cookie;

pub(super) fn remove_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = kv_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    let request = cookie.request().clone();
    let quiet = cookie.opcode() == Some(ClientOpcode::Deleteq);

    match engine.remove(
        token,
        request.key(),
        request.header.vbucket_or_status,
        request.header.cas,
        cookie.durability,
    ) {
        Ok(meta) => {
            if quiet {
                return Ok(());
            }
            let extras = mutation_extras(conn, &meta);
            cookie.send_response(
                conn,
                Status::Success,
                &extras,
                &[],
                &[],
                Datatype::RAW,
                meta.cas,
            )
        }
        Err(EngineError::KeyNotFound) if quiet => Ok(()),
        Err(e) => Err(e),
    }
}
