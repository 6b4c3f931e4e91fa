//! The TCP front end.
//!
//! This module owns the accept path and the worker pool: listening
//! sockets are accepted on the dispatcher task, admitted against the
//! client or system quota, and round-robined onto worker reactors which
//! pin them for life.

pub mod config;
pub mod connection;
pub mod context;
pub mod cookie;
pub mod reactor;
pub mod sendbuf;
pub mod server_event;
pub mod state_machine;

pub use config::{ConfigError, ConnectionPriority, Settings, DEFAULT_PORT};
pub use connection::{Connection, FeatureSet, InputEvent, PrivilegeOutcome};
pub use context::ServerContext;
pub use cookie::{Cookie, ErrorDisposition};
pub use reactor::{ConnSignal, SignalSender, WorkerMailbox, WorkerPool};
pub use sendbuf::{ChainRejected, OutputQueue, ReleaseFn};
pub use server_event::ServerEvent;
pub use state_machine::State;

use crate::engine::{CompressionPolicy, EngineHandle, MemoryEngine};
use crate::error::Result;
use reactor::ConnectionSeed;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// The server: shared context plus the accept/dispatch machinery.
pub struct Server {
    ctx: Arc<ServerContext>,
    bound_tx: watch::Sender<Option<SocketAddr>>,
    bound_rx: watch::Receiver<Option<SocketAddr>>,
}

impl Server {
    /// Create a server from settings.
    pub fn new(settings: Settings) -> Result<Self> {
        let ctx = ServerContext::new(settings)?;
        let (bound_tx, bound_rx) = watch::channel(None);
        Ok(Self {
            ctx,
            bound_tx,
            bound_rx,
        })
    }

    /// Shared context, usable before and during `run`.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Register an in-memory bucket; the binary uses this for the
    /// configured default bucket and tests use it directly.
    pub fn register_memory_bucket(&self, name: &str) {
        let engine = Arc::new(MemoryEngine::new());
        self.ctx.buckets.register(
            name,
            EngineHandle {
                kv: engine.clone(),
                dcp: Some(engine),
            },
            CompressionPolicy::Off,
        );
        info!("bucket \"{name}\" registered");
    }

    /// Address of the client listener once `run` has bound it. Useful
    /// when the configured port is 0.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.bound_rx.clone();
        loop {
            if let Some(addr) = *rx.borrow() {
                return Some(addr);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Run the server until a shutdown request arrives.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let ctx = self.ctx.clone();
        let pool = Arc::new(WorkerPool::spawn(ctx.clone()));

        // Client listener.
        let addr: SocketAddr = format!("{}:{}", ctx.settings.bind, ctx.settings.port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let _ = self.bound_tx.send(Some(bound));
        info!("listening on {bound}");

        let mut accept_tasks = Vec::new();
        accept_tasks.push(tokio::spawn(accept_loop(
            listener,
            ctx.clone(),
            pool.clone(),
            false,
            false,
        )));

        // System ports share the dispatcher but count against their own
        // quota.
        for port in &ctx.settings.system_ports {
            let addr: SocketAddr = format!("{}:{port}", ctx.settings.bind).parse()?;
            let listener = TcpListener::bind(addr).await?;
            info!("system listener on {}", listener.local_addr()?);
            accept_tasks.push(tokio::spawn(accept_loop(
                listener,
                ctx.clone(),
                pool.clone(),
                true,
                false,
            )));
        }

        #[cfg(feature = "tls")]
        if ctx.tls.is_some() {
            let addr: SocketAddr =
                format!("{}:{}", ctx.settings.bind, ctx.settings.tls.port).parse()?;
            let listener = TcpListener::bind(addr).await?;
            info!("TLS listener on {}", listener.local_addr()?);
            accept_tasks.push(tokio::spawn(accept_loop(
                listener,
                ctx.clone(),
                pool.clone(),
                false,
                true,
            )));
        }

        // Periodic active-external-users broadcast to the auth provider.
        let broadcast_ctx = ctx.clone();
        let broadcast = tokio::spawn(async move {
            let period =
                Duration::from_secs(broadcast_ctx.settings.active_users_push_interval_secs.max(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                broadcast_ctx.auth.push_active_users();
            }
        });

        // Run until asked to stop.
        tokio::select! {
            _ = ctx.shutdown.notified() => info!("shutdown requested"),
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("interrupt received"),
                Err(e) => warn!("failed to listen for interrupt: {e}"),
            },
        }

        for task in &accept_tasks {
            task.abort();
        }
        broadcast.abort();
        pool.shutdown();
        info!("server stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    pool: Arc<WorkerPool>,
    system: bool,
    tls: bool,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        if !ctx.try_admit(system) {
            warn!("connection limit reached; rejecting {peer}");
            drop(stream);
            continue;
        }

        let _ = stream.set_nodelay(true);

        #[cfg(feature = "tls")]
        let tls_params = if tls {
            ctx.tls.as_ref().map(|holder| connection::PendingTls {
                config: holder.current(),
                cert_user: ctx.settings.tls.cert_user.clone(),
            })
        } else {
            None
        };
        #[cfg(not(feature = "tls"))]
        let tls_params = {
            let _ = tls;
            None
        };

        pool.dispatch(ConnectionSeed {
            stream,
            peer,
            system,
            tls: tls_params,
        });
    }
}
