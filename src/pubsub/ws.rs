use crate::{
    pubsub::{ConnectionInfo, Frame},
    ReadError,
};
use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, Stream, StreamExt,
};
use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{ready, Context, Poll},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        error::{Error as WsError, ProtocolError as WsProtocolError},
        handshake::server::{ErrorResponse, Request, Response},
        http::header::ORIGIN,
        protocol::{frame::CloseFrame, Message},
        Utf8Bytes,
    },
    WebSocketStream,
};
use tracing::{debug, debug_span, Instrument};

/// Sending half of a [`WebSocketStream`]
pub(crate) type SendHalf = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Receiving half of a [`WebSocketStream`].
pub(crate) type RecvHalf = SplitStream<WebSocketStream<TcpStream>>;

/// True if the error means the connection is gone.
fn is_terminal(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Io(_)
            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake)
    )
}

/// Stream adapter for extracting text and binary frames from a
/// [`WebSocketStream`].
///
/// The stream ends on a close frame, when the connection is lost, or after
/// two consecutive read errors.
#[derive(Debug)]
pub struct WsFrameStream {
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
                debug!(reason = %frame, "{}", &s);
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
                Err(err) if self.errored || is_terminal(&err) => {
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
    type Error = WsError;

    async fn send_frame(&mut self, frame: Frame) -> Result<(), Self::Error> {
        match frame {
            Frame::Text(text) => self.send(Message::text(text)).await,
            Frame::Close(code) => {
                let frame = CloseFrame {
                    code: code.into(),
                    reason: Utf8Bytes::from_static(""),
                };
                self.send(Message::Close(Some(frame))).await
            }
        }
    }
}

impl crate::pubsub::Listener for TcpListener {
    type FrameSink = SendHalf;

    type FrameStream = WsFrameStream;

    type Error = WsError;

    async fn accept(
        &self,
    ) -> Result<(ConnectionInfo, Self::FrameSink, Self::FrameStream), Self::Error> {
        let (stream, remote_addr) = self.accept().await?;

        let span = debug_span!("ws connection", %remote_addr);

        let mut origin = None;
        let capture_origin = |request: &Request, response: Response| {
            origin = request
                .headers()
                .get(ORIGIN)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            Ok::<_, ErrorResponse>(response)
        };

        let ws_stream = accept_hdr_async(stream, capture_origin)
            .instrument(span)
            .await?;

        let (send, recv) = ws_stream.split();

        Ok((ConnectionInfo::new(origin, remote_addr), send, recv.into()))
    }
}

impl crate::pubsub::Connect for SocketAddr {
    type Listener = TcpListener;
    type Error = std::io::Error;

    fn make_listener(self) -> impl Future<Output = Result<Self::Listener, Self::Error>> + Send {
        TcpListener::bind(self)
    }
}
