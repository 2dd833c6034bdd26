use crate::Client;
use parking_lot::RwLock;
use serde_json::Value;
use std::{fmt, future::Future, pin::Pin, sync::Arc};

/// A boxed listener invocation, ready to be spawned.
pub(crate) type Invocation = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

type ConnectFn = Arc<dyn Fn(Client) -> Invocation + Send + Sync>;
type MessageFn = Arc<dyn Fn(Value) -> Invocation + Send + Sync>;
type ClientMessageFn = Arc<dyn Fn(Client, Value) -> Invocation + Send + Sync>;
type DisconnectFn = Arc<dyn Fn(u16) -> Invocation + Send + Sync>;
type ClientDisconnectFn = Arc<dyn Fn(Client, u16) -> Invocation + Send + Sync>;

/// A registered callback. Server-scoped listeners receive the [`Client`],
/// connection-scoped listeners already know it.
#[derive(Clone)]
pub(crate) enum Listener {
    /// `Server::connect`
    Connect(ConnectFn),
    /// `Client::on`
    Message { name: String, cb: MessageFn },
    /// `Server::on`
    ClientMessage { name: String, cb: ClientMessageFn },
    /// `Client::disconnect`
    Disconnect(DisconnectFn),
    /// `Server::disconnect`
    ClientDisconnect(ClientDisconnectFn),
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Connect(_) => "Connect",
            Self::Message { .. } => "Message",
            Self::ClientMessage { .. } => "ClientMessage",
            Self::Disconnect(_) => "Disconnect",
            Self::ClientDisconnect(_) => "ClientDisconnect",
        };
        f.debug_struct(kind).field("name", &self.name()).finish()
    }
}

impl Listener {
    pub(crate) fn connect<F, Fut>(cb: F) -> Self
    where
        F: Fn(Client) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Connect(Arc::new(move |client: Client| -> Invocation {
            Box::pin(cb(client))
        }))
    }

    pub(crate) fn message<F, Fut>(name: String, cb: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Message {
            name,
            cb: Arc::new(move |payload: Value| -> Invocation { Box::pin(cb(payload)) }),
        }
    }

    pub(crate) fn client_message<F, Fut>(name: String, cb: F) -> Self
    where
        F: Fn(Client, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::ClientMessage {
            name,
            cb: Arc::new(move |client: Client, payload: Value| -> Invocation {
                Box::pin(cb(client, payload))
            }),
        }
    }

    pub(crate) fn disconnect<F, Fut>(cb: F) -> Self
    where
        F: Fn(u16) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Disconnect(Arc::new(move |code: u16| -> Invocation { Box::pin(cb(code)) }))
    }

    pub(crate) fn client_disconnect<F, Fut>(cb: F) -> Self
    where
        F: Fn(Client, u16) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::ClientDisconnect(Arc::new(move |client: Client, code: u16| -> Invocation {
            Box::pin(cb(client, code))
        }))
    }

    /// The event this listener is keyed by.
    pub(crate) fn name(&self) -> &str {
        match self {
            Self::Connect(_) => "@connect",
            Self::Disconnect(_) | Self::ClientDisconnect(_) => "@disconnect",
            Self::Message { name, .. } | Self::ClientMessage { name, .. } => name,
        }
    }
}

/// An ordered, append-only list of [`Listener`]s.
///
/// Registration may race with dispatch. Dispatch works on a snapshot, so a
/// listener registered mid-dispatch fires from the next event onward.
#[derive(Debug, Default)]
pub(crate) struct ListenerTable {
    listeners: RwLock<Vec<Listener>>,
}

impl ListenerTable {
    pub(crate) fn push(&self, listener: Listener) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn extend(&self, listeners: impl IntoIterator<Item = Listener>) {
        self.listeners.write().extend(listeners);
    }

    pub(crate) fn snapshot(&self) -> Vec<Listener> {
        self.listeners.read().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Invocations for a connect event.
    pub(crate) fn on_connect(&self, client: &Client) -> Vec<Invocation> {
        self.listeners
            .read()
            .iter()
            .filter_map(|listener| match listener {
                Listener::Connect(cb) => {
                    let (cb, client) = (cb.clone(), client.clone());
                    Some(Box::pin(async move { cb(client).await }) as Invocation)
                }
                _ => None,
            })
            .collect()
    }

    /// Invocations for a user event called `name`.
    pub(crate) fn on_message(&self, name: &str, client: &Client, payload: &Value) -> Vec<Invocation> {
        self.listeners
            .read()
            .iter()
            .filter(|listener| listener.name() == name)
            .filter_map(|listener| match listener {
                Listener::Message { cb, .. } => {
                    let (cb, payload) = (cb.clone(), payload.clone());
                    Some(Box::pin(async move { cb(payload).await }) as Invocation)
                }
                Listener::ClientMessage { cb, .. } => {
                    let (cb, client, payload) = (cb.clone(), client.clone(), payload.clone());
                    Some(Box::pin(async move { cb(client, payload).await }) as Invocation)
                }
                _ => None,
            })
            .collect()
    }

    /// Invocations for a disconnect with the given close code.
    pub(crate) fn on_disconnect(&self, client: &Client, code: u16) -> Vec<Invocation> {
        self.listeners
            .read()
            .iter()
            .filter_map(|listener| match listener {
                Listener::Disconnect(cb) => {
                    let cb = cb.clone();
                    Some(Box::pin(async move { cb(code).await }) as Invocation)
                }
                Listener::ClientDisconnect(cb) => {
                    let (cb, client) = (cb.clone(), client.clone());
                    Some(Box::pin(async move { cb(client, code).await }) as Invocation)
                }
                _ => None,
            })
            .collect()
    }
}
