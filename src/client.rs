use crate::{
    codec::{self, Outbound},
    id::Secrets,
    listener::{Listener, ListenerTable},
    metrics,
    pubsub::Frame,
    sanitize, SendError,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    future::Future,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};

/// Close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when a connection drops without a close handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Bring a close code into the WebSocket range. Codes below 1000 are
/// shorthand, so `7` means `1007`.
pub const fn normalize_code(code: u16) -> u16 {
    if code < 1000 {
        code + 1000
    } else {
        code
    }
}

/// Like [`normalize_code`], for untrusted wire values. Values outside the
/// `u16` range saturate, so only a wire code of 0 or 1000 yields
/// [`CLOSE_NORMAL`].
pub(crate) fn normalize_wire_code(code: i64) -> u16 {
    let code = if code < 1000 { code.saturating_add(1000) } else { code };
    u16::try_from(code).unwrap_or(if code < 0 { 0 } else { u16::MAX })
}

/// One logical connection to the server.
///
/// A `Client` is created by the handshake and lives in the server's
/// registry until it disconnects cleanly, or until it has been closed for
/// longer than the reconnect timeout. It is a cheap handle, and clones refer
/// to the same session.
///
/// Clients only receive events they subscribed to. Subscriptions are made by
/// the remote side with `@listener` messages, and are carried over when a
/// closed session migrates into a new connection, together with the
/// connection-scoped listeners and the [store](Self::get).
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: String,
    secrets: Secrets,
    ip: IpAddr,

    subscriptions: RwLock<HashSet<String>>,
    listeners: ListenerTable,
    store: RwLock<HashMap<String, Value>>,

    closed: AtomicBool,
    compress: OnceLock<bool>,
    disconnected_at: Mutex<Option<Instant>>,

    /// Queue drained by the connection's single writer task.
    outbound: mpsc::Sender<Frame>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("ip", &self.inner.ip)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub(crate) fn new(
        id: String,
        secrets: Secrets,
        ip: IpAddr,
        outbound: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id,
                secrets,
                ip,
                subscriptions: Default::default(),
                listeners: Default::default(),
                store: Default::default(),
                closed: AtomicBool::new(false),
                compress: OnceLock::new(),
                disconnected_at: Mutex::new(None),
                outbound,
            }),
        }
    }

    /// The client ID assigned at handshake.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The remote address the session was established from.
    pub fn ip(&self) -> IpAddr {
        self.inner.ip
    }

    pub(crate) fn token(&self) -> &str {
        &self.inner.secrets.token
    }

    pub(crate) fn secrets(&self) -> &Secrets {
        &self.inner.secrets
    }

    /// True if both handles refer to the same session.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// True once the session has been closed, by either side. A closed
    /// session never reopens, though its state may migrate to a new one.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the session. Returns `true` if this call closed it.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::AcqRel)
    }

    /// Record when the session lost its connection, unless already
    /// recorded.
    pub(crate) fn mark_disconnected(&self) {
        self.inner
            .disconnected_at
            .lock()
            .get_or_insert_with(Instant::now);
    }

    /// When the session lost its connection. `None` while live.
    pub fn disconnected_at(&self) -> Option<Instant> {
        *self.inner.disconnected_at.lock()
    }

    /// True if the session is closed and was disconnected more than
    /// `timeout` before `now`.
    pub(crate) fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.is_closed()
            && self
                .disconnected_at()
                .is_some_and(|at| now.saturating_duration_since(at) > timeout)
    }

    /// Record the compression choice made by the remote side. Only the first
    /// call has an effect. Returns `true` if this call made the choice.
    pub(crate) fn negotiate_compression(&self, enabled: bool) -> bool {
        self.inner.compress.set(enabled).is_ok()
    }

    /// True if outbound messages are compressed.
    pub fn compresses(&self) -> bool {
        self.inner.compress.get().copied().unwrap_or_default()
    }

    /// True if the client subscribed to `name`.
    pub fn is_subscribed(&self, name: &str) -> bool {
        self.inner.subscriptions.read().contains(&*sanitize(name))
    }

    /// The names the client is subscribed to, in no particular order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.read().iter().cloned().collect()
    }

    /// Apply an `@listener` request: `name` subscribes, `!name` unsubscribes.
    pub(crate) fn toggle_subscription(&self, request: &str) {
        let (remove, name) = match request.strip_prefix('!') {
            Some(name) => (true, name),
            None => (false, request),
        };
        let name = sanitize(name);
        if name.is_empty() {
            return;
        }

        let mut subscriptions = self.inner.subscriptions.write();
        if remove {
            subscriptions.remove(&*name);
        } else if !subscriptions.contains(&*name) {
            subscriptions.insert(name.into_owned());
        }
    }

    pub(crate) fn listeners(&self) -> &ListenerTable {
        &self.inner.listeners
    }

    /// Run `cb` whenever this client sends an event called `name`. The name
    /// is [sanitized](crate::sanitize) first.
    ///
    /// Server-wide listeners registered with [`Server::on`] for the same name
    /// also run. Listeners run concurrently and in no particular order.
    ///
    /// [`Server::on`]: crate::Server::on
    pub fn on<F, Fut>(&self, name: &str, cb: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = sanitize(name).into_owned();
        self.inner.listeners.push(Listener::message(name, cb));
    }

    /// Run `cb` with the close code when this client disconnects.
    pub fn disconnect<F, Fut>(&self, cb: F)
    where
        F: Fn(u16) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.listeners.push(Listener::disconnect(cb));
    }

    /// Get a value from the client's store.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.store.read().get(key).cloned()
    }

    /// Put a value in the client's store, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.inner.store.write().insert(key.into(), value.into())
    }

    /// Remove a value from the client's store.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.store.write().remove(key)
    }

    /// Run `f` with exclusive access to the client's store.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut HashMap<String, Value>) -> R) -> R {
        f(&mut self.inner.store.write())
    }

    /// Send an event to the client.
    ///
    /// The name is [sanitized](crate::sanitize). Nothing is sent if the
    /// client is closed or has not subscribed to the name; in that case
    /// `Ok(false)` is returned. `Ok(true)` means the envelope was queued for
    /// the connection's writer.
    pub async fn send<T>(&self, name: &str, payload: &T) -> Result<bool, SendError>
    where
        T: Serialize + ?Sized,
    {
        if self.is_closed() {
            return Ok(false);
        }

        let name = sanitize(name);
        if !self.inner.subscriptions.read().contains(&*name) {
            return Ok(false);
        }

        self.write(&name, payload).await.map(|_| true)
    }

    /// Send a system event, bypassing the subscription filter.
    pub(crate) async fn send_core<T>(&self, name: &str, payload: &T) -> Result<bool, SendError>
    where
        T: Serialize + ?Sized,
    {
        if self.is_closed() {
            return Ok(false);
        }
        self.write(name, payload).await.map(|_| true)
    }

    async fn write<T>(&self, name: &str, payload: &T) -> Result<(), SendError>
    where
        T: Serialize + ?Sized,
    {
        let json = Outbound {
            name,
            data: payload,
            token: &self.inner.secrets.server_key,
        }
        .encode()?;

        let text = if self.compresses() {
            codec::compress(&json)?
        } else {
            json
        };

        self.inner
            .outbound
            .send(Frame::Text(text))
            .await
            .map_err(|_| SendError::Closed(self.inner.id.clone()))?;
        metrics::record_message_sent();
        Ok(())
    }

    /// Queue a frame that bypasses every check, used for the handshake.
    pub(crate) fn try_queue(&self, frame: Frame) -> Result<(), SendError> {
        self.inner
            .outbound
            .try_send(frame)
            .map_err(|_| SendError::Closed(self.inner.id.clone()))
    }

    /// Ask the writer to close the transport.
    pub(crate) async fn close_transport(&self, code: u16) {
        let _ = self.inner.outbound.send(Frame::Close(code)).await;
    }

    /// Resolves when the connection's writer has gone away.
    pub(crate) async fn writer_closed(&self) {
        self.inner.outbound.closed().await
    }

    /// Force the client to disconnect with the given close code.
    ///
    /// Codes below 1000 are [normalized](normalize_code). The session is
    /// closed immediately; disconnect listeners do not run.
    pub async fn kick(&self, code: u16) {
        self.mark_closed();
        self.close_transport(normalize_code(code)).await;
    }

    /// True if this closed session may migrate into `to`, given the
    /// credentials `to` presented.
    pub(crate) fn accepts_migration(
        &self,
        to: &Self,
        token: &str,
        server_key: &str,
        session_key: &str,
    ) -> bool {
        let secrets = self.secrets();
        self.is_closed()
            && !self.ptr_eq(to)
            && secrets.token == token
            && secrets.server_key == server_key
            && secrets.session_key == session_key
            && self.ip() == to.ip()
    }

    /// Merge the state of `old` into this client. Subscriptions and
    /// listeners are unioned, and store entries are copied unless this
    /// client already has the key. `old` is not modified.
    pub(crate) fn absorb(&self, old: &Self) {
        let subscriptions = old.inner.subscriptions.read().clone();
        self.inner.subscriptions.write().extend(subscriptions);

        self.inner.listeners.extend(old.inner.listeners.snapshot());

        let entries = old.inner.store.read().clone();
        let mut store = self.inner.store.write();
        for (key, value) in entries {
            store.entry(key).or_insert(value);
        }
    }
}

#[cfg(test)]
pub(crate) fn test_client() -> (Client, mpsc::Receiver<Frame>) {
    test_client_from([127, 0, 0, 1].into())
}

#[cfg(test)]
pub(crate) fn test_client_from(ip: IpAddr) -> (Client, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(16);
    let id = crate::id::IdAllocator::new(16, 1).candidate();
    (Client::new(id, Secrets::generate(), ip, tx), rx)
}
