//! Administrative and connection-control executors.

use super::get::kv_engine;
use crate::engine::{EngineError, EngineResult};
use crate::protocol::{Datatype, ResponseBuilder, Status};
use crate::security::{AuditEvent, AuditEventType, Privilege};
use crate::server::connection::Connection;
use crate::server::cookie::Cookie;
use bytes::BytesMut;
use serde_json::json;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

pub(super) fn quit_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    // The state machine transitions to closing after the response has
    // been flushed; quiet quit sends nothing.
    if cookie.opcode() == Some(crate::protocol::ClientOpcode::Quit) {
        cookie.send_status(conn, Status::Success)
    } else {
        Ok(())
    }
}

pub(super) fn noop_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    cookie.send_status(conn, Status::Success)
}

pub(super) fn version_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    cookie.send_response(
        conn,
        Status::Success,
        &[],
        &[],
        crate::VERSION.as_bytes(),
        Datatype::RAW,
        0,
    )
}

pub(super) fn verbosity_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let extras = cookie.request().extras().to_vec();
    let level = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);
    conn.server_ctx().set_verbosity(level);
    info!("verbosity set to {level}");
    cookie.send_status(conn, Status::Success)
}

pub(super) fn stat_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let group = String::from_utf8_lossy(cookie.request().key()).into_owned();
    let opaque = cookie.opaque();
    let opcode = cookie.request().header.opcode;

    // Each statistic is its own response packet; an empty key terminates
    // the stream.
    let mut pairs: Vec<(String, String)> = Vec::new();
    {
        let mut emit = |key: &str, value: &str| {
            pairs.push((key.to_string(), value.to_string()));
        };

        match group.as_str() {
            "" => {
                let ctx = conn.server_ctx();
                emit("version", crate::VERSION);
                emit("curr_connections", &ctx.connection_count().to_string());
                emit("bytes_read", &conn.stats.bytes_in.to_string());
                emit("bytes_written", &conn.stats.bytes_out.to_string());
                emit("cmd_total", &conn.stats.requests.to_string());
                for (index, mailbox) in ctx.mailboxes.iter().enumerate() {
                    emit(
                        &format!("worker_{index}:requests"),
                        &mailbox.stats.requests.load(Ordering::Relaxed).to_string(),
                    );
                    emit(
                        &format!("worker_{index}:max_sched_time_us"),
                        &mailbox
                            .stats
                            .max_sched_time_us
                            .load(Ordering::Relaxed)
                            .to_string(),
                    );
                }
            }
            _ => {}
        }

        if let Ok(engine) = kv_engine(conn) {
            let token = conn.token_for(cookie.slot());
            let engine_group = if group == "" { "" } else { group.as_str() };
            match engine.stats(token, engine_group, &mut emit) {
                Ok(()) => {}
                Err(EngineError::KeyNotFound) if !pairs.is_empty() => {}
                Err(EngineError::KeyNotFound) => return Err(EngineError::KeyNotFound),
                Err(e) => return Err(e),
            }
        }
    }

    let mut packet = BytesMut::new();
    for (key, value) in pairs {
        ResponseBuilder::raw_opcode(opcode)
            .status(Status::Success)
            .opaque(opaque)
            .key(key.as_bytes())
            .value(value.as_bytes())
            .build(&mut packet);
    }
    conn.copy_to_output_stream(&packet)
        .map_err(|_| EngineError::TooBig)?;

    // Terminator.
    cookie.send_status(conn, Status::Success)
}

pub(super) fn flush_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let engine = kv_engine(conn)?;
    let token = conn.token_for(cookie.slot());
    engine.flush(token)?;
    if cookie.opcode() == Some(crate::protocol::ClientOpcode::Flushq) {
        return Ok(());
    }
    cookie.send_status(conn, Status::Success)
}

pub(super) fn list_buckets_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    // Only buckets the identity may select are disclosed.
    let names = conn.server_ctx().buckets.names();
    let visible: Vec<String> = names
        .into_iter()
        .filter(|name| {
            conn.server_ctx()
                .rbac
                .create_context(conn.identity(), name)
                .map(|ctx| !ctx.effective().is_empty())
                .unwrap_or(false)
        })
        .collect();
    let body = visible.join(" ");
    cookie.send_response(
        conn,
        Status::Success,
        &[],
        &[],
        body.as_bytes(),
        Datatype::RAW,
        0,
    )
}

pub(super) fn select_bucket_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let name = String::from_utf8_lossy(cookie.request().key()).into_owned();
    let Some(bucket) = conn.server_ctx().buckets.get(&name) else {
        return Err(EngineError::KeyNotFound);
    };

    // The identity needs at least one privilege in the target bucket.
    let has_access = conn
        .server_ctx()
        .rbac
        .create_context(conn.identity(), &name)
        .map(|ctx| !ctx.effective().is_empty())
        .unwrap_or(false);
    if !has_access {
        cookie.set_error_context(format!("no access to bucket {name}"));
        return Err(EngineError::AccessDenied);
    }

    conn.select_bucket(bucket);
    if conn.features().clustermap_notification {
        conn.server_ctx()
            .subscribe_clustermap(&name, conn.id(), conn.signal_sender());
    }
    cookie.send_status(conn, Status::Success)
}

pub(super) fn set_cluster_config_executor(
    cookie: &mut Cookie,
    conn: &mut Connection,
) -> EngineResult<()> {
    let request = cookie.request().clone();
    let bucket_name = if request.key().is_empty() {
        conn.bucket().name().to_string()
    } else {
        String::from_utf8_lossy(request.key()).into_owned()
    };
    let Some(bucket) = conn.server_ctx().buckets.get(&bucket_name) else {
        return Err(EngineError::KeyNotFound);
    };

    let config = request.value_bytes();
    let revision = bucket.set_cluster_config(config.clone());
    conn.server_ctx()
        .notify_clustermap(&bucket_name, revision, config);
    cookie.send_status(conn, Status::Success)
}

pub(super) fn get_cluster_config_executor(
    cookie: &mut Cookie,
    conn: &mut Connection,
) -> EngineResult<()> {
    let Some(config) = conn.bucket().cluster_config() else {
        cookie.set_error_context("no cluster configuration available");
        return Err(EngineError::KeyNotFound);
    };
    cookie.send_response(conn, Status::Success, &[], &[], &config, Datatype::JSON, 0)
}

pub(super) fn set_ctrl_token_executor(
    cookie: &mut Cookie,
    conn: &mut Connection,
) -> EngineResult<()> {
    let request = cookie.request().clone();
    let extras = request.extras();
    let new_token = u64::from_be_bytes([
        extras[0], extras[1], extras[2], extras[3], extras[4], extras[5], extras[6], extras[7],
    ]);

    let ctx = conn.server_ctx();
    let current = ctx.ctrl_token.load(Ordering::Acquire);
    if request.header.cas != 0 && request.header.cas != current {
        cookie.cas = current;
        return Err(EngineError::KeyExists);
    }
    ctx.ctrl_token.store(new_token, Ordering::Release);
    cookie.cas = new_token;
    cookie.send_status(conn, Status::Success)
}

pub(super) fn get_ctrl_token_executor(
    cookie: &mut Cookie,
    conn: &mut Connection,
) -> EngineResult<()> {
    let token = conn.server_ctx().ctrl_token.load(Ordering::Acquire);
    cookie.cas = token;
    cookie.send_status(conn, Status::Success)
}

pub(super) fn shutdown_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let ctx = conn.server_ctx();
    let token = ctx.ctrl_token.load(Ordering::Acquire);
    if token != 0 && cookie.request().header.cas != token {
        cookie.set_error_context("invalid session control token");
        return Err(EngineError::KeyExists);
    }
    warn!(
        "{}: shutdown requested by {}",
        conn.id(),
        conn.identity()
    );
    ctx.shutdown.notify_waiters();
    cookie.send_status(conn, Status::Success)
}

fn reload_users(conn: &Connection) -> EngineResult<()> {
    let ctx = conn.server_ctx();
    match ctx.settings.users_file {
        Some(ref path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                warn!("failed to read user database: {e}");
                EngineError::Failed
            })?;
            ctx.rbac.load_local_users(&text).map_err(|e| {
                warn!("failed to parse user database: {e}");
                EngineError::Invalid
            })
        }
        None => {
            ctx.rbac.invalidate();
            Ok(())
        }
    }
}

pub(super) fn isasl_refresh_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    reload_users(conn)?;
    cookie.send_status(conn, Status::Success)
}

pub(super) fn rbac_refresh_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    reload_users(conn)?;
    cookie.send_status(conn, Status::Success)
}

pub(super) fn ssl_certs_refresh_executor(
    cookie: &mut Cookie,
    conn: &mut Connection,
) -> EngineResult<()> {
    #[cfg(feature = "tls")]
    {
        if let Some(ref tls) = conn.server_ctx().tls {
            tls.refresh().map_err(|e| {
                warn!("certificate refresh failed: {e}");
                EngineError::Failed
            })?;
            info!("TLS certificates refreshed");
        }
    }
    cookie.send_status(conn, Status::Success)
}

pub(super) fn update_external_user_permissions_executor(
    cookie: &mut Cookie,
    conn: &mut Connection,
) -> EngineResult<()> {
    let request = cookie.request().clone();
    let user = String::from_utf8_lossy(request.key()).into_owned();
    let entry: crate::security::UserEntry = serde_json::from_slice(request.value())
        .map_err(|e| {
            cookie.set_error_context(format!("invalid rbac entry: {e}"));
            EngineError::Invalid
        })?;
    conn.server_ctx()
        .rbac
        .upsert_user(&user, crate::security::Domain::External, entry);
    cookie.send_status(conn, Status::Success)
}

pub(super) fn auth_provider_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    if !conn.features().duplex {
        cookie.set_error_context("the connection must negotiate duplex");
        return Err(EngineError::Invalid);
    }
    conn.server_ctx()
        .auth
        .register_provider(conn.id(), conn.signal_sender());
    cookie.send_status(conn, Status::Success)
}

pub(super) fn drop_privilege_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let name = String::from_utf8_lossy(cookie.request().key()).into_owned();
    let privilege: Privilege = match serde_json::from_value(json!(name)) {
        Ok(privilege) => privilege,
        Err(_) => {
            cookie.set_error_context(format!("unknown privilege {name}"));
            return Err(EngineError::KeyNotFound);
        }
    };
    conn.drop_privilege(privilege);
    cookie.send_status(conn, Status::Success)
}

pub(super) fn get_error_map_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let body = error_map_json();
    cookie.send_response(
        conn,
        Status::Success,
        &[],
        &[],
        body.as_bytes(),
        Datatype::JSON,
        0,
    )
}

fn error_map_json() -> String {
    json!({
        "version": 1,
        "revision": 1,
        "errors": {
            "0": {"name": "SUCCESS", "desc": "Success", "attrs": ["success"]},
            "1": {"name": "KEY_ENOENT", "desc": "Not Found", "attrs": ["item-only"]},
            "2": {"name": "KEY_EEXISTS", "desc": "key already exists, or CAS mismatch", "attrs": ["item-only"]},
            "3": {"name": "E2BIG", "desc": "Value is too big", "attrs": ["item-only", "invalid-input"]},
            "4": {"name": "EINVAL", "desc": "Invalid packet", "attrs": ["internal", "invalid-input"]},
            "5": {"name": "NOT_STORED", "desc": "Not Stored", "attrs": ["internal", "item-only"]},
            "6": {"name": "DELTA_BADVAL", "desc": "Existing document not a number", "attrs": ["item-only", "invalid-input"]},
            "7": {"name": "NOT_MY_VBUCKET", "desc": "Server does not know about this vBucket", "attrs": ["fetch-config", "invalid-input"]},
            "8": {"name": "NO_BUCKET", "desc": "Not connected to any bucket", "attrs": ["conn-state-invalidated"]},
            "9": {"name": "LOCKED", "desc": "Requested resource is locked", "attrs": ["item-locked", "retry-now"]},
            "1f": {"name": "AUTH_STALE", "desc": "Reauthentication required", "attrs": ["conn-state-invalidated", "auth"]},
            "20": {"name": "AUTH_ERROR", "desc": "Authentication failed", "attrs": ["conn-state-invalidated", "auth"]},
            "24": {"name": "EACCESS", "desc": "Not authorized for command", "attrs": ["support"]},
            "81": {"name": "UNKNOWN_COMMAND", "desc": "Unknown command", "attrs": ["support"]},
            "86": {"name": "ETMPFAIL", "desc": "Temporary failure", "attrs": ["temp", "retry-later"]},
            "a0": {"name": "DURABILITY_INVALID_LEVEL", "desc": "Invalid durability level", "attrs": ["invalid-input"]},
            "a1": {"name": "DURABILITY_IMPOSSIBLE", "desc": "Durability requirements impossible", "attrs": ["item-only", "invalid-input"]},
        }
    })
    .to_string()
}

pub(super) fn ioctl_get_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let key = String::from_utf8_lossy(cookie.request().key()).into_owned();
    let value = match key.as_str() {
        "connections.count" => conn.server_ctx().connection_count().to_string(),
        "verbosity" => conn.server_ctx().verbosity().to_string(),
        _ => {
            cookie.set_error_context(format!("unknown property {key}"));
            return Err(EngineError::KeyNotFound);
        }
    };
    cookie.send_response(
        conn,
        Status::Success,
        &[],
        &[],
        value.as_bytes(),
        Datatype::RAW,
        0,
    )
}

pub(super) fn ioctl_set_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let request = cookie.request().clone();
    let key = String::from_utf8_lossy(request.key()).into_owned();
    match key.as_str() {
        "release_free_memory" => cookie.send_status(conn, Status::Success),
        "verbosity" => {
            let value = String::from_utf8_lossy(request.value()).into_owned();
            match value.trim().parse::<u32>() {
                Ok(level) => {
                    conn.server_ctx().set_verbosity(level);
                    cookie.send_status(conn, Status::Success)
                }
                Err(_) => {
                    cookie.set_error_context("verbosity must be numeric");
                    Err(EngineError::Invalid)
                }
            }
        }
        _ => {
            cookie.set_error_context(format!("unknown property {key}"));
            Err(EngineError::KeyNotFound)
        }
    }
}

pub(super) fn config_validate_executor(
    cookie: &mut Cookie,
    conn: &mut Connection,
) -> EngineResult<()> {
    match serde_json::from_slice::<crate::server::config::Settings>(cookie.request().value()) {
        Ok(settings) => match settings.validate() {
            Ok(()) => cookie.send_status(conn, Status::Success),
            Err(e) => {
                cookie.set_error_context(e.to_string());
                Err(EngineError::Invalid)
            }
        },
        Err(e) => {
            cookie.set_error_context(format!("invalid configuration: {e}"));
            Err(EngineError::Invalid)
        }
    }
}

pub(super) fn config_reload_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    // Runtime-adjustable settings (user database, certificates) have
    // dedicated refresh commands; the remaining settings are fixed for
    // the process lifetime.
    reload_users(conn)?;
    cookie.send_status(conn, Status::Success)
}

pub(super) fn audit_put_executor(cookie: &mut Cookie, conn: &mut Connection) -> EngineResult<()> {
    let request = cookie.request().clone();
    let description = String::from_utf8_lossy(request.value()).into_owned();
    let event = AuditEvent::new(AuditEventType::External, description)
        .peer(conn.peer().to_string())
        .user(conn.identity().to_string());
    conn.server_ctx().audit.put(event);
    cookie.send_status(conn, Status::Success)
}

pub(super) fn audit_config_reload_executor(
    cookie: &mut Cookie,
    conn: &mut Connection,
) -> EngineResult<()> {
    cookie.send_status(conn, Status::Success)
}
