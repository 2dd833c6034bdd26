/// Reasons an inbound connection or frame was rejected.
///
/// Rejections never reach a listener and never produce a response. They are
/// logged, counted, and pushed to the [error log](crate::drain_errors).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The connection declared an origin other than the configured one.
    #[error("connection unexpected origin: {found:?}")]
    UnexpectedOrigin {
        /// The origin header presented by the connection, if any.
        found: Option<String>,
    },
    /// The frame was not a JSON object.
    #[error("read parse err: {0}")]
    Parse(String),
    /// The `token` field was missing or not a string.
    #[error("read invalid token: not a valid string")]
    TokenNotString,
    /// The `token` field did not match the session token.
    #[error("read invalid token for client {client_id}")]
    TokenMismatch {
        /// The session that received the frame.
        client_id: String,
    },
    /// The `name` field was missing or not a string.
    #[error("read invalid name: not a valid string")]
    NameNotString,
    /// A system event carried a `data` field that was not a string.
    #[error("read {name} invalid data: not a valid string")]
    DataNotString {
        /// The system event name.
        name: &'static str,
    },
    /// An `@`-prefixed event that the server does not understand.
    #[error("read unknown system event: {0}")]
    UnknownSystemEvent(String),
}

impl ProtocolError {
    /// Short, stable label used for metrics.
    pub(crate) const fn reason(&self) -> &'static str {
        match self {
            Self::UnexpectedOrigin { .. } => "origin",
            Self::Parse(_) => "parse",
            Self::TokenNotString | Self::TokenMismatch { .. } => "token",
            Self::NameNotString => "name",
            Self::DataNotString { .. } => "data",
            Self::UnknownSystemEvent(_) => "system_event",
        }
    }
}

/// Errors produced while encoding an outbound envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON serialization failed.
    #[error("write parse err: {0}")]
    Json(#[from] serde_json::Error),
    /// Gzip compression failed.
    #[error("compression failed: {0}")]
    Compress(#[from] std::io::Error),
}

/// Errors that can occur when sending to a client.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The envelope could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The connection's writer has gone away.
    #[error("connection {0} writer closed")]
    Closed(String),
}

/// An error reported by a transport while reading a frame.
///
/// End-of-stream is not an error; transports signal it by ending the stream.
#[derive(Debug, thiserror::Error)]
#[error("read err: {0}")]
pub struct ReadError(#[source] Box<dyn core::error::Error + Send + Sync + 'static>);

impl ReadError {
    /// Wrap a transport error.
    pub fn new<E>(err: E) -> Self
    where
        E: core::error::Error + Send + Sync + 'static,
    {
        Self(Box::new(err))
    }
}

/// Errors that can be found in the [error log](crate::drain_errors).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// An inbound connection or frame was rejected.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// An outbound message could not be sent.
    #[error(transparent)]
    Send(#[from] SendError),
    /// A transport read failed, but the connection stayed open.
    #[error(transparent)]
    Read(#[from] ReadError),
}
