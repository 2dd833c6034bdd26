//! WebSocket connection handling for [`axum`]
//!
//! How this works:
//! `axum` does not provide a connection pattern that allows us to implement
//! [`Listener`] or [`Connect`] directly. Instead, it uses a
//! [`WebSocketUpgrade`] to upgrade a connection to a WebSocket. The
//! [`evsock_websocket`] handler serves the role of the [`Listener`], with
//! the [`Server`] as its [`State`].
//!
//! [`Listener`]: crate::pubsub::Listener
//! [`Connect`]: crate::pubsub::Connect

use crate::{
    pubsub::{ConnectionInfo, Frame},
    ReadError, Server,
};
use axum::{
    extract::{
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{header::ORIGIN, HeaderMap},
    response::Response,
};
use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, Stream, StreamExt,
};
use std::{
    net::SocketAddr,
    pin::Pin,
    task::{ready, Context, Poll},
};
use tracing::debug;

pub(crate) type SendHalf = SplitSink<WebSocket, Message>;
pub(crate) type RecvHalf = SplitStream<WebSocket>;

impl Server {
    /// Create an [`axum::Router`] serving this server's WebSocket endpoint
    /// at `path`.
    ///
    /// The remote address of each connection is required. The router must
    /// be served with connect info, as shown below.
    ///
    /// ```no_run
    /// # use evsock::Server;
    /// # async fn _main() -> std::io::Result<()> {
    /// let server = Server::new("http://localhost:3000");
    /// let app = server.into_axum("/ws");
    ///
    /// let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    /// axum::serve(
    ///     listener,
    ///     app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    /// )
    /// .await
    /// # }
    /// ```
    pub fn into_axum(self, path: &str) -> axum::Router {
        axum::Router::new()
            .route(path, axum::routing::any(evsock_websocket))
            .with_state(self)
    }
}

/// Axum handler for WebSocket connections.
///
/// Used to serve a [`Server`] over WebSocket connections via [`axum`]'s
/// built-in WebSocket support. The [`Server`] is passed as the [`State`] to
/// the handler. The `Origin` header of the upgrade request is checked by the
/// server's handshake.
///
/// # Examples
///
/// ```no_run
/// # use evsock::{Server, pubsub::evsock_websocket};
/// # fn _main(server: Server, axum: axum::Router<Server>) -> axum::Router<()> {
/// axum
///     .route("/ws", axum::routing::any(evsock_websocket))
///     .with_state(server)
/// # }
/// ```
///
/// The handler extracts [`ConnectInfo`], so the router must be served with
/// [`axum::Router::into_make_service_with_connect_info`].
pub async fn evsock_websocket(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(server): State<Server>,
) -> Response {
    let origin = headers
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    ws.on_upgrade(move |ws| {
        let (sink, stream) = ws.split();

        server.accept_connection(
            ConnectionInfo::new(origin, remote_addr),
            WsFrameStream::from(stream),
            sink,
        );

        async {}
    })
}

/// Simple stream adapter for extracting frames from a [`WebSocket`].
///
/// The stream ends on a close frame, or after two consecutive read errors.
#[derive(Debug)]
struct WsFrameStream {
    inner: RecvHalf,
    complete: bool,
    errored: bool,
}

impl From<RecvHalf> for WsFrameStream {
    fn from(inner: RecvHalf) -> Self {
        Self {
            inner,
            complete: false,
            errored: false,
        }
    }
}

impl WsFrameStream {
    /// Handle an incoming [`Message`]
    fn handle(&self, message: Message) -> Result<Option<Bytes>, &'static str> {
        match message {
            Message::Text(text) => Ok(Some(text.into())),
            Message::Binary(bytes) => Ok(Some(bytes)),
            Message::Close(Some(frame)) => {
                let s = "Received close frame with data";
                let reason = format!("{} ({})", frame.reason, frame.code);
                debug!(%reason, "{}", &s);
                Err(s)
            }
            Message::Close(None) => {
                let s = "WS client has gone away";
                debug!("{}", &s);
                Err(s)
            }
            _ => Ok(None),
        }
    }
}

impl Stream for WsFrameStream {
    type Item = Result<Bytes, ReadError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.complete {
                return Poll::Ready(None);
            }

            let Some(item) = ready!(self.inner.poll_next_unpin(cx)) else {
                self.complete = true;
                return Poll::Ready(None);
            };

            let msg = match item {
                Ok(msg) => {
                    self.errored = false;
                    msg
                }
                Err(err) if self.errored => {
                    debug!(%err, "WS connection lost");
                    self.complete = true;
                    continue;
                }
                Err(err) => {
                    self.errored = true;
                    return Poll::Ready(Some(Err(ReadError::new(err))));
                }
            };

            match self.handle(msg) {
                Ok(Some(item)) => return Poll::Ready(Some(Ok(item))),
                Ok(None) => continue,
                Err(_) => self.complete = true,
            }
        }
    }
}

impl crate::pubsub::FrameSink for SendHalf {
    type Error = axum::Error;

    async fn send_frame(&mut self, frame: Frame) -> Result<(), Self::Error> {
        match frame {
            Frame::Text(text) => self.send(Message::text(text)).await,
            Frame::Close(code) => {
                let frame = CloseFrame {
                    code,
                    reason: Utf8Bytes::from_static(""),
                };
                self.send(Message::Close(Some(frame))).await
            }
        }
    }
}
