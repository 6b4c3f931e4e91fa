//! The steppable command context.
//!
//! Multi-step commands keep their state in an object owned by the cookie
//! and advance it by repeated `step` calls. A step that cannot complete
//! returns [`EngineError::WouldBlock`](crate::engine::EngineError); the
//! cookie suspends and the same context is stepped again once the
//! engine's completion arrives. Contexts are explicit state machines, not
//! suspended call stacks: resumption is a plain method call.

use crate::engine::EngineResult;
use crate::server::connection::Connection;
use crate::server::cookie::Cookie;

/// A stateful executor for a multi-step command.
pub trait CommandContext: Send {
    /// Advance the command. `Ok(())` means the command finished and its
    /// response (if any) has been queued.
    fn step(&mut self, cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()>;
}

/// Retry budget for compare-and-swap loops in contexts that read, modify
/// and conditionally re-store a document. Exhausting it surfaces a
/// temporary failure.
pub const CAS_RETRY_LIMIT: u32 = 100;
