//! Command dispatch.
//!
//! A static per-opcode table maps each recognized opcode to a validator,
//! an ordered privilege chain, and an executor. Validation order: header
//! sanity → opcode recognized → datatype permitted → frame infos →
//! opcode-specific validator. Privilege evaluation runs before the
//! executor and may rebuild a stale privilege context; opcodes outside
//! the table fall through to the engine's unknown-command hook.

mod admin;
mod append_prepend;
mod arithmetic;
mod context;
mod dcp;
mod get;
mod hello;
mod mutation;
mod remove;
mod sasl;
mod subdoc;
mod validators;

pub use context::CommandContext;

use crate::engine::{EngineError, EngineResult};
use crate::protocol::{ClientOpcode, Datatype, Frame, Status};
use crate::security::{AuditEvent, AuditEventType, Privilege};
use crate::server::connection::{Connection, PrivilegeOutcome};
use crate::server::cookie::Cookie;
use tracing::warn;

/// A failed validation: the status to report and whether the violation
/// is severe enough to terminate the connection after the response.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    /// Status for the error response
    pub status: Status,
    /// Human-readable context included in the error body
    pub context: String,
    /// True for framing violations that close the connection
    pub fatal: bool,
}

impl ValidationFailure {
    pub(crate) fn einval(context: impl Into<String>) -> Self {
        Self {
            status: Status::Einval,
            context: context.into(),
            fatal: false,
        }
    }

    pub(crate) fn fatal(context: impl Into<String>) -> Self {
        Self {
            status: Status::Einval,
            context: context.into(),
            fatal: true,
        }
    }
}

type Validator = fn(&Frame, &Connection) -> Result<(), ValidationFailure>;
type Executor = fn(&mut Cookie, &mut Connection) -> EngineResult<()>;

/// One entry of the dispatch table.
#[derive(Clone, Copy)]
pub struct CommandSpec {
    validator: Validator,
    privileges: &'static [Privilege],
    executor: Executor,
}

/// Look up the dispatch entry for an opcode.
fn spec(opcode: ClientOpcode) -> CommandSpec {
    use ClientOpcode as Op;
    use Privilege as P;

    macro_rules! entry {
        ($validator:expr, [$($privilege:expr),*], $executor:expr) => {
            CommandSpec {
                validator: $validator,
                privileges: &[$($privilege),*],
                executor: $executor,
            }
        };
    }

    match opcode {
        Op::Get | Op::Getq | Op::Getk | Op::Getkq => {
            entry!(validators::get, [P::Read], get::get_executor)
        }
        Op::Touch => entry!(validators::touch, [P::Read], get::touch_executor),
        Op::Gat | Op::Gatq => entry!(validators::touch, [P::Read], get::gat_executor),
        Op::GetLocked => entry!(validators::get_locked, [P::Read], get::get_locked_executor),
        Op::UnlockKey => entry!(validators::unlock, [P::Read], get::unlock_executor),
        Op::GetMeta | Op::GetqMeta => {
            entry!(validators::get_meta, [P::MetaRead], get::get_meta_executor)
        }
        Op::GetRandomKey => {
            entry!(validators::no_key_no_value, [P::Read], get::get_random_key_executor)
        }

        Op::Set | Op::Setq | Op::Replace | Op::Replaceq => {
            entry!(validators::mutation, [P::Upsert], mutation::mutation_executor)
        }
        Op::Add | Op::Addq => {
            entry!(validators::mutation, [P::Insert], mutation::mutation_executor)
        }
        Op::Append | Op::Appendq | Op::Prepend | Op::Prependq => entry!(
            validators::append_prepend,
            [P::Read, P::Upsert],
            append_prepend::append_prepend_executor
        ),
        Op::Increment | Op::Incrementq | Op::Decrement | Op::Decrementq => entry!(
            validators::arithmetic,
            [P::Read, P::Upsert],
            arithmetic::arithmetic_executor
        ),
        Op::Delete | Op::Deleteq => {
            entry!(validators::remove, [P::Delete], remove::remove_executor)
        }

        Op::Quit | Op::Quitq => entry!(validators::no_key_no_value, [], admin::quit_executor),
        Op::Noop => entry!(validators::no_key_no_value, [], admin::noop_executor),
        Op::Version => entry!(validators::no_key_no_value, [], admin::version_executor),
        Op::Hello => entry!(validators::hello, [], hello::hello_executor),
        Op::Verbosity => {
            entry!(validators::verbosity, [P::NodeManagement], admin::verbosity_executor)
        }
        Op::Stat => entry!(validators::stat, [P::SimpleStats], admin::stat_executor),
        Op::Flush | Op::Flushq => {
            entry!(validators::flush, [P::BucketManagement], admin::flush_executor)
        }

        Op::SaslListMechs => {
            entry!(validators::no_key_no_value, [], sasl::list_mechs_executor)
        }
        Op::SaslAuth => entry!(validators::sasl_auth, [], sasl::auth_executor),
        Op::SaslStep => entry!(validators::sasl_auth, [], sasl::step_executor),

        Op::IoctlGet => entry!(validators::ioctl_get, [P::NodeManagement], admin::ioctl_get_executor),
        Op::IoctlSet => entry!(validators::ioctl_set, [P::NodeManagement], admin::ioctl_set_executor),
        Op::ConfigValidate => entry!(
            validators::config_validate,
            [P::NodeManagement],
            admin::config_validate_executor
        ),
        Op::ConfigReload => entry!(
            validators::no_key_no_value,
            [P::NodeManagement],
            admin::config_reload_executor
        ),
        Op::AuditPut => entry!(validators::audit_put, [P::Audit], admin::audit_put_executor),
        Op::AuditConfigReload => entry!(
            validators::no_key_no_value,
            [P::Audit],
            admin::audit_config_reload_executor
        ),
        Op::Shutdown => entry!(validators::no_key_no_value, [P::NodeManagement], admin::shutdown_executor),

        Op::ListBuckets => entry!(validators::no_key_no_value, [], admin::list_buckets_executor),
        Op::SelectBucket => entry!(validators::select_bucket, [], admin::select_bucket_executor),

        Op::SetClusterConfig => entry!(
            validators::set_cluster_config,
            [P::SecurityManagement],
            admin::set_cluster_config_executor
        ),
        Op::GetClusterConfig => entry!(
            validators::no_key_no_value,
            [],
            admin::get_cluster_config_executor
        ),

        Op::SetCtrlToken => entry!(
            validators::set_ctrl_token,
            [P::SessionManagement],
            admin::set_ctrl_token_executor
        ),
        Op::GetCtrlToken => entry!(
            validators::no_key_no_value,
            [P::SessionManagement],
            admin::get_ctrl_token_executor
        ),

        Op::IsaslRefresh => entry!(
            validators::no_key_no_value,
            [P::SecurityManagement],
            admin::isasl_refresh_executor
        ),
        Op::SslCertsRefresh => entry!(
            validators::no_key_no_value,
            [P::SecurityManagement],
            admin::ssl_certs_refresh_executor
        ),
        Op::RbacRefresh => entry!(
            validators::no_key_no_value,
            [P::SecurityManagement],
            admin::rbac_refresh_executor
        ),
        Op::UpdateExternalUserPermissions => entry!(
            validators::update_external_user_permissions,
            [P::SecurityManagement],
            admin::update_external_user_permissions_executor
        ),
        Op::AuthProvider => entry!(
            validators::no_key_no_value,
            [P::SecurityManagement],
            admin::auth_provider_executor
        ),
        Op::DropPrivilege => {
            entry!(validators::drop_privilege, [], admin::drop_privilege_executor)
        }
        Op::GetErrorMap => entry!(validators::get_error_map, [], admin::get_error_map_executor),

        Op::DcpOpen => entry!(validators::dcp_open, [], dcp::open_executor),
        Op::DcpAddStream => entry!(validators::dcp_add_stream, [], dcp::add_stream_executor),
        Op::DcpCloseStream => {
            entry!(validators::no_extras_no_value, [], dcp::close_stream_executor)
        }
        Op::DcpStreamReq => entry!(validators::dcp_stream_req, [], dcp::stream_req_executor),
        Op::DcpGetFailoverLog | Op::GetFailoverLog => entry!(
            validators::no_extras_no_value,
            [],
            dcp::get_failover_log_executor
        ),
        Op::DcpControl => entry!(validators::dcp_control, [], dcp::control_executor),
        Op::DcpBufferAcknowledgement => {
            entry!(validators::dcp_buffer_ack, [], dcp::buffer_ack_executor)
        }
        Op::DcpNoop => entry!(validators::no_key_no_value, [], dcp::noop_executor),
        Op::DcpSeqnoAcknowledged => {
            entry!(validators::dcp_seqno_ack, [], dcp::seqno_ack_executor)
        }
        Op::DcpStreamEnd
        | Op::DcpSnapshotMarker
        | Op::DcpMutation
        | Op::DcpDeletion
        | Op::DcpExpiration
        | Op::DcpSetVbucketState
        | Op::DcpSystemEvent
        | Op::DcpPrepare
        | Op::DcpCommit
        | Op::DcpAbort => entry!(validators::any, [], dcp::consumer_message_executor),

        Op::SubdocGet | Op::SubdocExists | Op::SubdocGetCount => {
            entry!(validators::subdoc_lookup, [P::Read], subdoc::lookup_executor)
        }
        Op::SubdocDictAdd
        | Op::SubdocDictUpsert
        | Op::SubdocDelete
        | Op::SubdocReplace
        | Op::SubdocArrayPushLast
        | Op::SubdocArrayPushFirst
        | Op::SubdocArrayInsert
        | Op::SubdocArrayAddUnique
        | Op::SubdocCounter => entry!(
            validators::subdoc_mutation,
            [P::Read, P::Upsert],
            subdoc::mutation_executor
        ),
        Op::SubdocMultiLookup => {
            entry!(validators::subdoc_multi, [P::Read], subdoc::multi_lookup_executor)
        }
        Op::SubdocMultiMutation => entry!(
            validators::subdoc_multi,
            [P::Read, P::Upsert],
            subdoc::multi_mutation_executor
        ),
    }
}

/// True for opcodes that accept a durability requirement frame info.
pub fn supports_durability(opcode: ClientOpcode) -> bool {
    use ClientOpcode as Op;
    matches!(
        opcode,
        Op::Set
            | Op::Setq
            | Op::Add
            | Op::Addq
            | Op::Replace
            | Op::Replaceq
            | Op::Delete
            | Op::Deleteq
            | Op::Append
            | Op::Appendq
            | Op::Prepend
            | Op::Prependq
            | Op::Increment
            | Op::Incrementq
            | Op::Decrement
            | Op::Decrementq
            | Op::SubdocDictAdd
            | Op::SubdocDictUpsert
            | Op::SubdocDelete
            | Op::SubdocReplace
            | Op::SubdocArrayPushLast
            | Op::SubdocArrayPushFirst
            | Op::SubdocArrayInsert
            | Op::SubdocArrayAddUnique
            | Op::SubdocCounter
            | Op::SubdocMultiMutation
    )
}

/// Validate a request frame ahead of execution.
pub fn validate(frame: &Frame, conn: &Connection) -> Result<(), ValidationFailure> {
    let datatype = Datatype::from_bits(frame.header.datatype);
    if !datatype.is_valid() {
        return Err(ValidationFailure::fatal("invalid datatype bits"));
    }
    if datatype.bits() & !conn.permitted_datatypes().bits() != 0 {
        return Err(ValidationFailure::einval(
            "datatype not enabled on this connection",
        ));
    }

    let Some(opcode) = ClientOpcode::from_u8(frame.header.opcode) else {
        // Unknown opcodes are resolved at execution time.
        return Ok(());
    };

    (spec(opcode).validator)(frame, conn)
}

/// Run the privilege chain and the executor for a parsed request.
pub fn execute(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let Some(opcode) = cookie.opcode() else {
        return unknown_command(cookie, conn);
    };

    if cookie.durability.is_some() && !supports_durability(opcode) {
        cookie.set_error_context("The requested command does not support durability requirements");
        return cookie.send_status(conn, Status::Einval);
    }

    let spec = spec(opcode);
    for privilege in spec.privileges {
        match conn.check_privilege(*privilege) {
            PrivilegeOutcome::Granted => {}
            PrivilegeOutcome::Denied => {
                if privilege_debug_allowed(conn, *privilege, opcode) {
                    continue;
                }
                let event = AuditEvent::new(
                    AuditEventType::PrivilegeDenied,
                    format!("{opcode:?} denied: missing {privilege:?}"),
                )
                .peer(conn.peer().to_string())
                .user(conn.identity().to_string());
                let event_id = conn.server_ctx().audit.put(event);
                cookie.set_event_id(event_id);
                cookie.set_error_context(format!("no access to privilege {privilege:?}"));
                return Err(EngineError::AccessDenied);
            }
            PrivilegeOutcome::Stale => return Err(EngineError::AuthStale),
        }
    }

    (spec.executor)(cookie, conn)
}

/// Debug builds may be configured to audit and wave through denied
/// privilege checks. Release builds always enforce.
fn privilege_debug_allowed(
    conn: &Connection,
    privilege: Privilege,
    opcode: ClientOpcode,
) -> bool {
    #[cfg(debug_assertions)]
    {
        if conn.server_ctx().settings.privilege_debug {
            let event = AuditEvent::new(
                AuditEventType::PrivilegeDebugAllowed,
                format!("{opcode:?} allowed without {privilege:?}"),
            )
            .peer(conn.peer().to_string())
            .user(conn.identity().to_string());
            conn.server_ctx().audit.put(event);
            warn!(
                "{}: privilege debug: allowing {opcode:?} without {privilege:?}",
                conn.id()
            );
            return true;
        }
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = (conn, privilege, opcode);
    }
    false
}

/// Fallback for opcodes outside the dispatch table.
fn unknown_command(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let opcode = cookie.request().header.opcode;
    let response = conn.bucket().engine().map(|engine| {
        engine
            .kv
            .unknown_command(conn.token_for(cookie.slot()), opcode, &cookie.request().body)
    });

    match response {
        Some(Ok((status, body))) => cookie.send_response(
            conn,
            status,
            &[],
            &[],
            &body,
            crate::protocol::Datatype::RAW,
            0,
        ),
        Some(Err(e)) => Err(e),
        None => {
            warn!("{}: unknown command {opcode:#04x}", conn.id());
            cookie.send_status(conn, Status::UnknownCommand)
        }
    }
}

/// Helper shared by executors that keep a stateful context on the cookie:
/// create it on first entry, step it, and park it again on `WouldBlock`.
pub(crate) fn run_context<F>(
    cookie: &mut Cookie,
    conn: &mut Connection,
    create: F,
) -> EngineResult<()>
where
    F: FnOnce(&Cookie, &Connection) -> EngineResult<Box<dyn CommandContext>>,
{
    let mut context = match cookie.context.take() {
        Some(context) => context,
        None => create(cookie, conn)?,
    };
    let result = context.step(cookie, conn);
    if matches!(result, Err(EngineError::WouldBlock)) {
        cookie.context = Some(context);
    }
    result
}
