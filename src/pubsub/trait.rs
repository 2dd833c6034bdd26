use crate::{
    pubsub::{
        shared::{ConnectionManager, ListenerTask},
        ServerShutdown,
    },
    ReadError, Server,
};
use bytes::Bytes;
use std::{future::Future, net::SocketAddr};
use tokio::sync::mpsc;
use tokio_stream::Stream;

/// Convenience alias for naming stream halves.
pub type Out<T> = <T as Listener>::FrameSink;

/// Convenience alias for naming stream halves.
pub type In<T> = <T as Listener>::FrameStream;

/// An outbound instruction for a connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text frame holding an encoded (and possibly compressed) envelope.
    Text(String),
    /// Close the transport with the given close code.
    Close(u16),
}

/// What the server knows about a connection before the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The `Origin` the connection declared, if any.
    pub origin: Option<String>,
    /// The remote address of the connection.
    pub remote_addr: SocketAddr,
}

impl ConnectionInfo {
    /// Create a new [`ConnectionInfo`].
    pub fn new(origin: Option<String>, remote_addr: SocketAddr) -> Self {
        Self {
            origin,
            remote_addr,
        }
    }
}

/// Configuration objects for connecting a [`Listener`].
///
/// This object is intended to capture all connection-related configuration
/// and setup (e.g. binding, TLS), and output only the configured
/// [`Listener`]. Session handling is left to the [`Server`].
pub trait Connect: Send + Sync + Sized {
    /// The listener type produced by the connect object.
    type Listener: Listener;

    /// The error type for instantiating a [`Listener`].
    type Error: core::error::Error + 'static;

    /// Create the listener
    fn make_listener(self) -> impl Future<Output = Result<Self::Listener, Self::Error>> + Send;

    /// Instantiate and run a task to accept connections, returning a shutdown
    /// signal.
    ///
    /// Connections are served by `server`. Dropping the returned
    /// [`ServerShutdown`] stops accepting and closes every connection
    /// accepted by this listener. Sessions stay in the server's registry and
    /// are reaped as usual.
    fn serve(
        self,
        server: Server,
    ) -> impl Future<Output = Result<ServerShutdown, Self::Error>> + Send {
        async move {
            let root_tasks = server.tasks().child();

            ListenerTask {
                listener: self.make_listener().await?,
                manager: ConnectionManager {
                    server,
                    root_tasks: root_tasks.clone(),
                },
            }
            .spawn();
            Ok(root_tasks.into())
        }
    }
}

/// A [`Listener`] accepts incoming connections and produces [`FrameSink`]
/// and [`FrameStream`] objects, together with the [`ConnectionInfo`] the
/// handshake needs.
pub trait Listener: Send + 'static {
    /// The sink type produced by the listener.
    type FrameSink: FrameSink;
    /// The stream type produced by the listener.
    type FrameStream: FrameStream;
    /// The error type for the listener.
    type Error: core::error::Error;

    /// Accept an inbound connection, and split it into a sink and stream.
    fn accept(
        &self,
    ) -> impl Future<
        Output = Result<(ConnectionInfo, Self::FrameSink, Self::FrameStream), Self::Error>,
    > + Send;
}

/// A sink that writes [`Frame`]s to a transport.
///
/// Each connection has exactly one writer task, which owns the sink. Nothing
/// else writes to the transport.
pub trait FrameSink: Send + 'static {
    /// Error type for the sink.
    type Error: core::error::Error + 'static;

    /// Write a frame.
    fn send_frame(&mut self, frame: Frame) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

impl FrameSink for mpsc::Sender<Frame> {
    type Error = mpsc::error::SendError<Frame>;

    fn send_frame(&mut self, frame: Frame) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.send(frame)
    }
}

/// A stream of inbound frames.
///
/// The stream ends when the transport reaches end-of-stream. Errors that do
/// not end the connection are yielded as [`ReadError`]s.
pub trait FrameStream: Stream<Item = Result<Bytes, ReadError>> + Send + Unpin + 'static {}

impl<T> FrameStream for T where T: Stream<Item = Result<Bytes, ReadError>> + Send + Unpin + 'static {}
