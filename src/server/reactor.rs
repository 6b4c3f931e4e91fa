//! Worker reactors.
//!
//! A fixed pool of worker threads each runs a single-threaded event loop
//! (a current-thread runtime with a `LocalSet`); connections are pinned to
//! one worker for life, so all connection state is mutated from that
//! thread. Cross-thread input arrives through two paths:
//!
//! - the worker mailbox: a mutex-protected list of pending-I/O
//!   completions and idle wake-ups, filled by engine threads and drained
//!   fully on every notification, and
//! - per-connection signal channels, used by the dispatcher and the
//!   external-auth manager to push events at a specific connection.

use super::connection::Connection;
use super::context::ServerContext;
use super::server_event::ServerEvent;
use super::state_machine;
use crate::engine::{CookieToken, EngineResult};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info};

/// Out-of-band input for a single connection.
pub enum ConnSignal {
    /// An engine completion for a blocked cookie
    IoComplete {
        /// Cookie slot the completion belongs to
        slot: u8,
        /// Final status of the suspended operation
        status: EngineResult<()>,
    },
    /// A message to push to the client at the next idle boundary
    ServerEvent(Box<dyn ServerEvent>),
    /// Wake the connection so it re-evaluates its state
    Wake,
    /// The server is shutting down
    Shutdown,
}

impl std::fmt::Debug for ConnSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnSignal::IoComplete { slot, status } => f
                .debug_struct("IoComplete")
                .field("slot", slot)
                .field("status", status)
                .finish(),
            ConnSignal::ServerEvent(event) => {
                write!(f, "ServerEvent({})", event.description())
            }
            ConnSignal::Wake => f.write_str("Wake"),
            ConnSignal::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Sender half of a connection's signal channel.
pub type SignalSender = mpsc::UnboundedSender<ConnSignal>;

/// Per-worker statistics block.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Connections currently owned by the worker
    pub connections: AtomicU64,
    /// Requests executed
    pub requests: AtomicU64,
    /// Pending-I/O completions routed
    pub completions: AtomicU64,
    /// Longest observed scheduling slice in microseconds
    pub max_sched_time_us: AtomicU64,
}

impl WorkerStats {
    /// Record one scheduling slice.
    pub fn record_sched_time(&self, micros: u64) {
        self.max_sched_time_us.fetch_max(micros, Ordering::Relaxed);
    }
}

/// Cross-thread mailbox of a worker: pending-I/O completions and idle
/// wake-ups, plus the notification handle engine threads kick.
#[derive(Debug)]
pub struct WorkerMailbox {
    pending_io: Mutex<Vec<(CookieToken, EngineResult<()>)>>,
    idle_wakeups: Mutex<Vec<u64>>,
    notify: Notify,
    /// Statistics block for this worker
    pub stats: WorkerStats,
}

impl WorkerMailbox {
    /// Create an empty mailbox.
    pub fn new() -> Self {
        Self {
            pending_io: Mutex::new(Vec::new()),
            idle_wakeups: Mutex::new(Vec::new()),
            notify: Notify::new(),
            stats: WorkerStats::default(),
        }
    }

    /// Enqueue an engine completion and kick the worker.
    pub fn push_completion(&self, token: CookieToken, status: EngineResult<()>) {
        self.pending_io.lock().push((token, status));
        self.notify.notify_one();
    }

    /// Ask the worker to poke a connection at its next idle point.
    pub fn push_idle_wakeup(&self, connection: u64) {
        self.idle_wakeups.lock().push(connection);
        self.notify.notify_one();
    }

    /// Drain both queues completely.
    pub(crate) fn drain(&self) -> (Vec<(CookieToken, EngineResult<()>)>, Vec<u64>) {
        let completions = std::mem::take(&mut *self.pending_io.lock());
        let wakeups = std::mem::take(&mut *self.idle_wakeups.lock());
        (completions, wakeups)
    }
}

impl Default for WorkerMailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// A newly-accepted socket on its way to a worker.
pub struct ConnectionSeed {
    /// The accepted stream
    pub stream: TcpStream,
    /// Peer address
    pub peer: SocketAddr,
    /// Accepted on a system port
    pub system: bool,
    /// TLS handshake parameters when accepted on the TLS port
    pub tls: Option<super::connection::PendingTls>,
}

/// Control messages for a worker thread.
pub enum WorkerMessage {
    /// Adopt a new connection
    NewConnection(Box<ConnectionSeed>),
    /// Stop accepting work and drain
    Shutdown,
}

/// Handle to a spawned worker thread.
pub struct WorkerHandle {
    /// Worker index
    pub index: usize,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// The pool of worker reactors.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawn `settings.worker_threads` reactor threads.
    pub fn spawn(ctx: Arc<ServerContext>) -> Self {
        let mut workers = Vec::with_capacity(ctx.settings.worker_threads);
        for index in 0..ctx.settings.worker_threads {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker_ctx = ctx.clone();
            let join = std::thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || worker_thread(index, worker_ctx, rx))
                .expect("failed to spawn worker thread");
            workers.push(WorkerHandle {
                index,
                tx,
                join: Mutex::new(Some(join)),
            });
        }
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    /// Round-robin a new connection onto a worker.
    pub fn dispatch(&self, seed: ConnectionSeed) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        if self.workers[index]
            .tx
            .send(WorkerMessage::NewConnection(Box::new(seed)))
            .is_err()
        {
            error!("worker {index} is gone; dropping connection");
        }
    }

    /// Signal every worker to drain and wait for the threads.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            let _ = worker.tx.send(WorkerMessage::Shutdown);
        }
        for worker in &self.workers {
            if let Some(join) = worker.join.lock().take() {
                let _ = join.join();
            }
        }
    }
}

type Registry = Rc<RefCell<HashMap<u64, SignalSender>>>;

fn worker_thread(
    index: usize,
    ctx: Arc<ServerContext>,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("worker {index}: failed to build runtime: {e}");
            return;
        }
    };
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, worker_main(index, ctx, rx));
    info!("worker {index} stopped");
}

async fn worker_main(
    index: usize,
    ctx: Arc<ServerContext>,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    let registry: Registry = Rc::new(RefCell::new(HashMap::new()));
    let mailbox = ctx.mailboxes[index].clone();

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(WorkerMessage::NewConnection(seed)) => {
                    adopt_connection(index, &ctx, &registry, *seed);
                }
                Some(WorkerMessage::Shutdown) | None => break,
            },
            _ = mailbox.notify.notified() => {
                route_mailbox(&mailbox, &registry);
            }
        }
    }

    // Drain: tell every connection to close, then wait for the tasks to
    // unregister themselves.
    for sender in registry.borrow().values() {
        let _ = sender.send(ConnSignal::Shutdown);
    }
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !registry.borrow().is_empty() && std::time::Instant::now() < deadline {
        route_mailbox(&mailbox, &registry);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

/// Deliver everything in the mailbox to the owning connections. The
/// queues are drained fully before any routing so a notification is never
/// lost between a check and a wait.
fn route_mailbox(mailbox: &WorkerMailbox, registry: &Registry) {
    let (completions, wakeups) = mailbox.drain();
    let registry = registry.borrow();
    for (token, status) in completions {
        mailbox.stats.completions.fetch_add(1, Ordering::Relaxed);
        if let Some(sender) = registry.get(&token.connection) {
            let _ = sender.send(ConnSignal::IoComplete {
                slot: token.slot,
                status,
            });
        } else {
            debug!("completion for dead connection {}", token.connection);
        }
    }
    for connection in wakeups {
        if let Some(sender) = registry.get(&connection) {
            let _ = sender.send(ConnSignal::Wake);
        }
    }
}

fn adopt_connection(
    index: usize,
    ctx: &Arc<ServerContext>,
    registry: &Registry,
    seed: ConnectionSeed,
) {
    let id = ctx.next_connection_id();
    let system = seed.system;
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    registry.borrow_mut().insert(id, signal_tx.clone());
    ctx.mailboxes[index]
        .stats
        .connections
        .fetch_add(1, Ordering::Relaxed);

    let connection = Connection::new(
        id,
        index,
        seed.stream,
        seed.peer,
        seed.system,
        ctx.clone(),
        signal_rx,
        signal_tx,
        seed.tls,
    );

    let registry = registry.clone();
    let ctx = ctx.clone();
    tokio::task::spawn_local(async move {
        run_connection(connection, &ctx).await;
        registry.borrow_mut().remove(&id);
        ctx.mailboxes[index]
            .stats
            .connections
            .fetch_sub(1, Ordering::Relaxed);
        ctx.release(system);
    });
}

async fn run_connection(mut connection: Connection, ctx: &Arc<ServerContext>) {
    let id = connection.id();
    let peer = connection.peer();
    debug!("{id}: starting state machine for {peer}");

    state_machine::drive(&mut connection).await;

    // Teardown: leave the CDC session and the auth manager.
    if connection.dcp().is_some() {
        if let Some(engine) = connection.bucket().engine() {
            if let Some(ref dcp) = engine.dcp {
                dcp.close(id);
            }
        }
    }
    ctx.auth.remove_connection(id, &ctx.rbac);
    ctx.unsubscribe_clustermap(id);
    debug!("{id}: connection finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;

    fn token(connection: u64, slot: u8) -> CookieToken {
        CookieToken {
            worker: 0,
            connection,
            slot,
        }
    }

    #[tokio::test]
    async fn mailbox_drains_fully() {
        let mailbox = WorkerMailbox::new();
        mailbox.push_completion(token(1, 0), Ok(()));
        mailbox.push_completion(token(1, 1), Err(EngineError::KeyNotFound));
        mailbox.push_idle_wakeup(2);

        // The notification was posted.
        tokio::time::timeout(std::time::Duration::from_secs(1), mailbox.notify.notified())
            .await
            .expect("no notification");

        let (completions, wakeups) = mailbox.drain();
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].0.slot, 0);
        assert_eq!(completions[1].1, Err(EngineError::KeyNotFound));
        assert_eq!(wakeups, vec![2]);

        // A second drain finds nothing.
        let (completions, wakeups) = mailbox.drain();
        assert!(completions.is_empty());
        assert!(wakeups.is_empty());
    }

    #[tokio::test]
    async fn route_mailbox_targets_the_owning_connection() {
        let mailbox = WorkerMailbox::new();
        let registry: Registry = Rc::new(RefCell::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.borrow_mut().insert(7, tx);

        mailbox.push_completion(token(7, 3), Ok(()));
        // Completions for dead connections are dropped, not misrouted.
        mailbox.push_completion(token(8, 0), Ok(()));
        route_mailbox(&mailbox, &registry);

        match rx.try_recv().expect("signal not delivered") {
            ConnSignal::IoComplete { slot: 3, status } => assert!(status.is_ok()),
            other => panic!("unexpected signal: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
