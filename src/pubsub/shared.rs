use core::fmt;

use crate::{
    client::CLOSE_ABNORMAL,
    codec::{Handshake, CONNECTION_EVENT},
    errlog, metrics,
    pubsub::{ConnectionInfo, Frame, FrameSink, FrameStream, Listener},
    Client, ProtocolError, SendError, Server, TaskSet,
};
use tokio::{select, sync::mpsc, task::JoinHandle};
use tokio_util::sync::WaitForCancellationFutureOwned;
use tokio_stream::StreamExt;
use tracing::{debug, debug_span, error, instrument, trace, warn, Instrument};

/// The `ListenerTask` listens for new connections, and hands each to the
/// [`ConnectionManager`].
pub(crate) struct ListenerTask<T: Listener> {
    pub(crate) listener: T,
    pub(crate) manager: ConnectionManager,
}

impl<T> ListenerTask<T>
where
    T: Listener,
{
    /// Task future, which will be run by [`Self::spawn`].
    ///
    /// This future is a simple loop that accepts new connections, and uses
    /// the [`ConnectionManager`] to handle them.
    pub(crate) async fn task_future(self) {
        let ListenerTask { listener, manager } = self;

        loop {
            let (info, sink, stream) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(%err, "Failed to accept connection");
                    continue;
                }
            };

            manager.handle_new_connection(info, stream, sink);
        }
    }

    /// Spawn the future produced by [`Self::task_future`].
    pub(crate) fn spawn(self) -> JoinHandle<Option<()>> {
        let tasks = self.manager.root_tasks.clone();
        let future = self.task_future();
        tasks.spawn(future)
    }
}

/// The `ConnectionManager` performs the handshake for each connection, and
/// spawns its [`RouteTask`] and [`WriteTask`].
#[derive(Debug, Clone)]
pub(crate) struct ConnectionManager {
    pub(crate) server: Server,

    /// Parent of every connection's task set.
    pub(crate) root_tasks: TaskSet,
}

impl ConnectionManager {
    /// Run the handshake for a new connection.
    ///
    /// Rejects the connection if its origin is not the server's origin.
    /// Otherwise registers a new [`Client`], queues the `@connection`
    /// greeting carrying its credentials, and spawns the tasks serving it.
    pub(crate) fn handle_new_connection<R, S>(
        &self,
        info: ConnectionInfo,
        frames: R,
        connection: S,
    ) -> Option<Client>
    where
        R: FrameStream,
        S: FrameSink,
    {
        let config = self.server.config();

        if info.origin.as_deref() != Some(config.origin()) {
            let err = ProtocolError::UnexpectedOrigin { found: info.origin };
            metrics::record_rejection(err.reason());
            warn!(remote_addr = %info.remote_addr, %err, "rejecting connection");
            errlog::record(err);
            return None;
        }

        let (tx, rx) = mpsc::channel(config.outbound_buffer_per_client.max(1));
        let client = self.server.register(info.remote_addr.ip(), tx);

        let secrets = client.secrets();
        let greeting = Handshake {
            name: CONNECTION_EVENT,
            data: "connect",
            client_id: client.id(),
            token: &secrets.token,
            server_key: &secrets.server_key,
            enc_key: &secrets.session_key,
            can_compress: config.compression,
        }
        .encode()
        .map_err(SendError::from)
        .and_then(|json| client.try_queue(Frame::Text(json)));

        if let Err(err) = greeting {
            error!(client_id = client.id(), %err, "handshake failed");
            errlog::record(err);
            self.server.unregister(&client);
            return None;
        }

        let tasks = self.root_tasks.child();

        RouteTask {
            server: self.server.clone(),
            client: client.clone(),
            frames,
            tasks: tasks.clone(),
        }
        .spawn();

        WriteTask {
            tasks,
            client_id: client.id().to_owned(),
            frames: rx,
            connection,
        }
        .spawn();

        metrics::record_connection();
        debug!(client_id = client.id(), remote_addr = %info.remote_addr, "client connected");
        Some(client)
    }
}

/// Task that reads frames from a stream, and hands each to the server's
/// dispatch in a new task.
struct RouteTask<R> {
    /// Server for validating and dispatching frames.
    server: Server,
    /// The session served by this task.
    client: Client,
    /// Stream of inbound frames.
    frames: R,
    /// The task set for this connection
    tasks: TaskSet,
}

impl<R> fmt::Debug for RouteTask<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTask")
            .field("client_id", &self.client.id())
            .finish_non_exhaustive()
    }
}

impl<R> RouteTask<R>
where
    R: FrameStream,
{
    /// Task future, which will be run by [`Self::spawn`].
    ///
    /// Reads frames until the stream ends or the [`WriteTask`] goes away.
    /// Frames are never interpreted here. Each is handled in its own task, so
    /// a slow listener cannot stall the connection.
    ///
    /// When the loop ends without the session having been closed by either
    /// side, the connection was lost: disconnect listeners run with code
    /// 1006 and the session is kept for migration. This includes the
    /// connection being shut down by its listener.
    #[instrument(name = "RouteTask", skip(self, cancelled), fields(client_id = %self.client.id()))]
    pub(crate) async fn task_future(self, cancelled: WaitForCancellationFutureOwned) {
        let RouteTask {
            server,
            client,
            mut frames,
            tasks,
        } = self;

        // Frame handlers outlive the connection. A frame that was read may
        // still be waiting for a callback permit when the stream ends.
        let handlers = server.tasks().child();
        tokio::pin!(cancelled);

        loop {
            select! {
                biased;
                _ = &mut cancelled => {
                    debug!("Shutdown signal received");
                    break;
                }
                _ = client.writer_closed() => {
                    debug!("WriteTask has gone away");
                    break;
                }
                item = frames.next() => {
                    let Some(item) = item else {
                        trace!("inbound read stream has closed");
                        break;
                    };

                    let frame = match item {
                        Ok(frame) => frame,
                        Err(err) => {
                            if client.is_closed() {
                                break;
                            }
                            warn!(%err, "read error");
                            errlog::record(err);
                            continue;
                        }
                    };

                    let span = debug_span!("frame handling", len = frame.len());
                    let server = server.clone();
                    let client = client.clone();
                    handlers.spawn(
                        async move { server.handle_frame(&client, frame).await }.instrument(span),
                    );
                }
            }
        }

        // Frames read before the stream ended may still be in flight, and
        // one of them may be a clean disconnect.
        handlers.close();
        let grace = server.config().grace_period;
        let _ = tokio::time::timeout(grace, handlers.wait()).await;

        if client.mark_closed() {
            debug!("connection lost");
            server.fire_disconnect(&client, CLOSE_ABNORMAL).await;
        }
        client.mark_disconnected();

        tasks.cancel();
    }

    /// Spawn the future produced by [`Self::task_future`]. The task is not
    /// dropped on cancellation, so that the session is always closed.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        let tasks = self.tasks.clone();
        tasks.spawn_graceful(|cancelled| self.task_future(cancelled))
    }
}

/// The Write Task is the only writer of a connection's transport.
struct WriteTask<S> {
    /// Task set
    tasks: TaskSet,

    /// ID of the client served.
    client_id: String,

    /// Frames to be written to the outbound connection.
    ///
    /// Dropping this channel will cause the associated [`RouteTask`] to
    /// shutdown.
    frames: mpsc::Receiver<Frame>,

    /// Outbound connection.
    connection: S,
}

impl<S: FrameSink> WriteTask<S> {
    /// Task future, which will be run by [`Self::spawn`].
    ///
    /// This is a simple loop, that writes frames from the client's queue to
    /// the connection, in order. It stops after writing a close frame, on a
    /// write error, or when the connection's task set is cancelled.
    #[instrument(skip(self), fields(client_id = %self.client_id))]
    pub(crate) async fn task_future(self) {
        let WriteTask {
            tasks,
            mut frames,
            mut connection,
            ..
        } = self;

        loop {
            select! {
                biased;

                _ = tasks.cancelled() => {
                    debug!("Shutdown signal received");
                    break;
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        debug!("Frame queue has closed");
                        break;
                    };
                    let closing = matches!(frame, Frame::Close(_));
                    if let Err(err) = connection.send_frame(frame).await {
                        debug!(%err, "Failed to send frame");
                        break;
                    }
                    if closing {
                        trace!("close frame sent");
                        break;
                    }
                }
            }
        }
    }

    /// Spawn the future produced by [`Self::task_future`].
    pub(crate) fn spawn(self) -> JoinHandle<Option<()>> {
        let tasks = self.tasks.clone();
        let future = self.task_future();
        tasks.spawn(future)
    }
}
