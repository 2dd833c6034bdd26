use crate::{
    errlog,
    id::{IdAllocator, Secrets},
    listener::{Invocation, Listener, ListenerTable},
    metrics,
    pubsub::{ConnectionInfo, ConnectionManager, Frame, FrameSink, FrameStream},
    sanitize, Client, SendError, ServerConfig, TaskSet,
};
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::future::join_all;
use ::metrics::Gauge;
use serde::Serialize;
use serde_json::Value;
use std::{
    fmt,
    future::Future,
    net::IpAddr,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, debug_span, trace, Instrument};

/// Reap intervals are never shorter than this.
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(1);

/// A pub/sub server.
///
/// The server holds the registry of every known session, and the
/// server-wide listeners. It is a cheap handle, and clones refer to the same
/// server. Connections are handed to it by a transport, see the
/// [`pubsub`](crate::pubsub) module.
///
/// Every listener callback runs in its own task. The number of callbacks
/// running at once is bounded across all connections of the server, see
/// [`ServerConfig::with_callback_limit`].
///
/// ```no_run
/// # use evsock::{Server, pubsub::Connect};
/// # async fn _main() -> Result<(), std::io::Error> {
/// let server = Server::new("http://localhost:3000");
///
/// server.connect(|client| async move {
///     tracing::info!(client_id = client.id(), "hello");
/// });
///
/// let announcer = server.clone();
/// server.on("chat", move |client, payload| {
///     let server = announcer.clone();
///     async move {
///         let _ = server.broadcast("chat", &payload).await;
///         client.set("last_message", payload);
///     }
/// });
///
/// let addr: std::net::SocketAddr = ([127, 0, 0, 1], 3000).into();
/// let shutdown = addr.serve(server).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    clients: DashMap<String, Client>,
    listeners: ListenerTable,
    ids: IdAllocator,

    /// Bounds concurrently running callbacks.
    limiter: Arc<Semaphore>,

    /// Runs the reaper and every callback.
    tasks: TaskSet,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.tasks.cancel();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("origin", &self.inner.config.origin)
            .field("clients", &self.inner.clients.len())
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create a server accepting connections from `origin`, with the default
    /// configuration.
    ///
    /// ## Panics
    ///
    /// This will panic if called outside the context of a Tokio runtime.
    pub fn new(origin: impl Into<String>) -> Self {
        Self::from_config(ServerConfig::new(origin))
    }

    /// Create a server that keeps closed sessions for `timeout` before
    /// reaping them.
    ///
    /// ## Panics
    ///
    /// This will panic if called outside the context of a Tokio runtime.
    pub fn with_reconnect_timeout(origin: impl Into<String>, timeout: Duration) -> Self {
        Self::from_config(ServerConfig::new(origin).with_reconnect_timeout(timeout))
    }

    /// Create a server from a [`ServerConfig`], and start its reaper.
    ///
    /// ## Panics
    ///
    /// This will panic if called outside the context of a Tokio runtime, and
    /// no runtime handle was set with [`ServerConfig::with_handle`].
    pub fn from_config(config: ServerConfig) -> Self {
        let server = Self {
            inner: Arc::new(ServerInner {
                ids: IdAllocator::new(config.id_len.max(1), config.id_probes),
                limiter: Arc::new(Semaphore::new(config.callback_limit.max(1))),
                tasks: config.handle.clone().into(),
                clients: DashMap::new(),
                listeners: ListenerTable::default(),
                config,
            }),
        };
        server.spawn_reaper();
        server
    }

    /// The server's configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub(crate) fn tasks(&self) -> &TaskSet {
        &self.inner.tasks
    }

    /// Run `cb` with each new client, once it has sent its connect event.
    pub fn connect<F, Fut>(&self, cb: F)
    where
        F: Fn(Client) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.listeners.push(Listener::connect(cb));
    }

    /// Run `cb` with the client and close code whenever a client
    /// disconnects, cleanly or not.
    pub fn disconnect<F, Fut>(&self, cb: F)
    where
        F: Fn(Client, u16) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.listeners.push(Listener::client_disconnect(cb));
    }

    /// Run `cb` whenever any client sends an event called `name`. The name
    /// is [sanitized](crate::sanitize) first.
    pub fn on<F, Fut>(&self, name: &str, cb: F)
    where
        F: Fn(Client, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = sanitize(name).into_owned();
        self.inner.listeners.push(Listener::client_message(name, cb));
    }

    /// Look up a session by ID. Closed sessions are returned until they are
    /// reaped or migrated away from.
    pub fn client(&self, id: &str) -> Option<Client> {
        self.inner.clients.get(id).map(|entry| entry.value().clone())
    }

    /// The IDs of every known session, in no particular order.
    pub fn client_ids(&self) -> Vec<String> {
        self.inner
            .clients
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// The number of known sessions, closed ones included.
    pub fn len(&self) -> usize {
        self.inner.clients.len()
    }

    /// True if no sessions are known.
    pub fn is_empty(&self) -> bool {
        self.inner.clients.is_empty()
    }

    fn snapshot(&self) -> Vec<Client> {
        self.inner
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Send an event to the client with the given ID. See [`Client::send`].
    /// Returns `Ok(false)` if the ID is unknown.
    pub async fn send<T>(&self, id: &str, name: &str, payload: &T) -> Result<bool, SendError>
    where
        T: Serialize + ?Sized,
    {
        match self.client(id) {
            Some(client) => client.send(name, payload).await,
            None => Ok(false),
        }
    }

    /// Send an event to every known client, concurrently. Clients that are
    /// closed or not subscribed get nothing. Failed sends are recorded in the
    /// error log. Returns the number of clients the event was queued for.
    pub async fn broadcast<T>(&self, name: &str, payload: &T) -> usize
    where
        T: Serialize + Sync + ?Sized,
    {
        let clients = self.snapshot();
        let sends = clients.iter().map(|client| async move {
            match client.send(name, payload).await {
                Ok(sent) => sent,
                Err(err) => {
                    debug!(client_id = client.id(), %err, "broadcast send failed");
                    errlog::record(err);
                    false
                }
            }
        });
        join_all(sends).await.into_iter().filter(|sent| *sent).count()
    }

    /// Force the client with the given ID to disconnect. See
    /// [`Client::kick`]. Returns `false` if the ID is unknown.
    pub async fn kick(&self, id: &str, code: u16) -> bool {
        let Some(client) = self.client(id) else {
            return false;
        };
        client.kick(code).await;
        true
    }

    /// Force every known client to disconnect.
    pub async fn kick_all(&self, code: u16) {
        let clients = self.snapshot();
        join_all(clients.iter().map(|client| client.kick(code))).await;
    }

    /// Hand a connection to the server, as an alternative to
    /// [`Connect::serve`] for transports that produce connections one at a
    /// time.
    ///
    /// Runs the handshake, and returns the new [`Client`], or `None` if the
    /// connection was rejected. The connection is served on the server's own
    /// tasks, until it ends or the last handle to the server is dropped.
    ///
    /// [`Connect::serve`]: crate::pubsub::Connect::serve
    pub fn accept_connection<R, S>(&self, info: ConnectionInfo, frames: R, sink: S) -> Option<Client>
    where
        R: FrameStream,
        S: FrameSink,
    {
        ConnectionManager {
            server: self.clone(),
            root_tasks: self.inner.tasks.clone(),
        }
        .handle_new_connection(info, frames, sink)
    }

    /// Create and register a session with a fresh ID.
    pub(crate) fn register(&self, ip: IpAddr, outbound: mpsc::Sender<Frame>) -> Client {
        let clients = &self.inner.clients;
        loop {
            let id = self.inner.ids.allocate(|id| clients.contains_key(id));
            // another connection may have taken the ID since the probe
            if let Entry::Vacant(entry) = clients.entry(id) {
                let client = Client::new(
                    entry.key().clone(),
                    Secrets::generate(),
                    ip,
                    outbound.clone(),
                );
                entry.insert(client.clone());
                return client;
            }
        }
    }

    /// Remove `client` from the registry, unless its ID now belongs to
    /// another session.
    pub(crate) fn unregister(&self, client: &Client) -> bool {
        self.inner
            .clients
            .remove_if(client.id(), |_, known| known.ptr_eq(client))
            .is_some()
    }

    /// Evict every closed session that lost its connection more than the
    /// reconnect timeout ago. Returns the number of evicted sessions.
    pub(crate) fn reap(&self) -> usize {
        let now = Instant::now();
        let timeout = self.inner.config.reconnect_timeout;
        let mut reaped = 0;

        self.inner.clients.retain(|id, client| {
            let expired = client.is_expired(now, timeout);
            if expired {
                trace!(client_id = %id, "reaping session");
                reaped += 1;
            }
            !expired
        });

        if reaped > 0 {
            debug!(reaped, "reaped expired sessions");
            metrics::record_reaped(reaped as u64);
        }
        reaped
    }

    fn spawn_reaper(&self) {
        let server = Arc::downgrade(&self.inner);
        let period = self.inner.config.reap_interval.max(MIN_REAP_INTERVAL);
        self.inner
            .tasks
            .spawn(reaper(server, period).instrument(debug_span!("reaper")));
    }

    /// Run the disconnect listeners of the server and of `client`, after the
    /// grace period.
    pub(crate) async fn fire_disconnect(&self, client: &Client, code: u16) {
        let mut invocations = self.inner.listeners.on_disconnect(client, code);
        invocations.extend(client.listeners().on_disconnect(client, code));
        self.fan_out(invocations, self.inner.config.grace_period).await;
    }

    /// Run the connect listeners of the server, after the grace period.
    pub(crate) async fn fire_connect(&self, client: &Client) {
        let invocations = self.inner.listeners.on_connect(client);
        self.fan_out(invocations, self.inner.config.grace_period).await;
    }

    /// Run the message listeners of the server and of `client` for `name`.
    /// Returns the number of listeners invoked.
    pub(crate) async fn fire_message(&self, client: &Client, name: &str, payload: &Value) -> usize {
        let mut invocations = self.inner.listeners.on_message(name, client, payload);
        invocations.extend(client.listeners().on_message(name, client, payload));
        let count = invocations.len();
        self.fan_out(invocations, Duration::ZERO).await;
        count
    }

    /// Spawn each invocation in its own task, once a callback permit is
    /// available.
    ///
    /// With a non-zero `delay`, returns immediately, and the invocations are
    /// spawned once the delay has passed.
    async fn fan_out(&self, invocations: Vec<Invocation>, delay: Duration) {
        if invocations.is_empty() {
            return;
        }

        if delay.is_zero() {
            self.spawn_callbacks(invocations).await;
            return;
        }

        let server = self.clone();
        self.inner.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            server.spawn_callbacks(invocations).await;
        });
    }

    async fn spawn_callbacks(&self, invocations: Vec<Invocation>) {
        for invocation in invocations {
            // The semaphore is never closed.
            let Ok(permit) = self.inner.limiter.clone().acquire_owned().await else {
                return;
            };
            let guard = CallbackGuard::new(permit);
            self.inner.tasks.spawn(async move {
                let _guard = guard;
                invocation.await;
            });
        }
    }
}

/// Periodically reap the server, until it is dropped.
async fn reaper(server: Weak<ServerInner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(inner) = server.upgrade() else {
            trace!("server dropped, stopping reaper");
            break;
        };
        Server { inner }.reap();
    }
}

/// Holds a callback permit, and tracks the callback in the active gauge.
struct CallbackGuard {
    _permit: OwnedSemaphorePermit,
    active: Gauge,
}

impl CallbackGuard {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        let active = metrics::active_callbacks();
        active.increment(1.0);
        Self {
            _permit: permit,
            active,
        }
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        self.active.decrement(1.0);
    }
}
