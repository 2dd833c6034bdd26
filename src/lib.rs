//! evsock: named-event pub/sub over WebSockets.
//!
//! A [`Server`] and many clients exchange named events carrying arbitrary
//! JSON payloads. Every connection is authenticated by a per-session token,
//! clients opt in to the events they want to receive, and a session that
//! drops without a clean close can be resumed by a new connection from the
//! same address.
//!
//! ## Basic usage
//!
//! ```no_run
//! use evsock::{to_type, Server};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Default, Deserialize)]
//! struct Move {
//!     x: i64,
//!     y: i64,
//! }
//!
//! # async fn _main() {
//! let server = Server::new("http://localhost:3000");
//!
//! // Every client that completes the handshake.
//! server.connect(|client| async move {
//!     client.set("score", 0);
//!
//!     // Listeners may also be registered on a single connection.
//!     let echo = client.clone();
//!     client.on("move", move |payload| {
//!         let client = echo.clone();
//!         async move {
//!             let Move { x, y } = to_type(&payload);
//!             // Only delivered if the client subscribed to "moved".
//!             let _ = client.send("moved", &[x, y]).await;
//!         }
//!     });
//! });
//!
//! server.disconnect(|client, code| async move {
//!     tracing::info!(client_id = client.id(), code, "client left");
//! });
//! # }
//! ```
//!
//! ## Protocol
//!
//! Every frame is a JSON object. Frames from a client carry the session
//! `token` received in the `@connection` greeting, an event `name`, and a
//! `data` payload. Frames with a wrong token are dropped silently. Names
//! starting with `@` are reserved:
//!
//! - `@connection` with `data` of `connect`, `disconnect` or `migrate`
//!   drives the session lifecycle.
//! - `@listener` subscribes the client to the event named by `data`, or
//!   unsubscribes it when the name is prefixed with `!`.
//! - `@error` is sent by the server when a migration is refused.
//!
//! Every other name is [sanitized](sanitize) and dispatched to the matching
//! listeners. Frames to clients carry the session's server key as `token`,
//! and are gzipped and base64 encoded when the client asked for compression.
//!
//! ## Serving
//!
//! When the `"axum"` feature flag is enabled, [`Server::into_axum`]
//! instantiates a new [`axum::Router`] serving the server at a path. With
//! the `"ws"` feature flag, the `pubsub` module provides an implementation
//! of the `Connect` trait for [`std::net::SocketAddr`], to create a simple
//! WebSocket server.
//!
//! ```no_run
//! # #[cfg(feature = "ws")]
//! # {
//! # use evsock::{Server, pubsub::Connect};
//! # async fn _main(server: Server) {
//! let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 3000));
//! // The shutdown object will stop the listener when dropped.
//! let shutdown = addr.serve(server).await.unwrap();
//! # }}
//! ```
//!
//! See the [`pubsub`] module documentation for more information.
//!
//! ## Errors
//!
//! Rejected frames and failed sends never reach the application. They are
//! emitted as `tracing` events, and kept in a bounded, process-wide error
//! log, which can be drained with [`drain_errors`] or logged continuously
//! with [`log_errors`].
//!
//! [`axum::Router`]: https://docs.rs/axum/latest/axum/routing/struct.Router.html

#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub,
    clippy::missing_const_for_fn,
    rustdoc::all
)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod client;
pub use client::{normalize_code, Client, CLOSE_ABNORMAL, CLOSE_NORMAL};

mod codec;
pub use codec::{CONNECTION_EVENT, ERROR_EVENT, LISTENER_EVENT};

mod config;
pub use config::{
    ServerConfig, DEFAULT_CALLBACK_LIMIT, DEFAULT_GRACE_PERIOD, DEFAULT_ID_LEN,
    DEFAULT_ID_PROBES, DEFAULT_OUTBOUND_BUFFER_PER_CLIENT, DEFAULT_REAP_INTERVAL,
    DEFAULT_RECONNECT_TIMEOUT,
};

mod dispatch;

mod errlog;
pub use errlog::{drain_errors, log_errors, ERROR_LOG_CAPACITY};

mod error;
pub use error::{ClientError, CodecError, ProtocolError, ReadError, SendError};

mod id;

mod listener;

mod metrics;

mod payload;
pub use payload::{to_type, try_to_type};

pub mod pubsub;

mod sanitize;
pub use sanitize::{sanitize, SYSTEM_PREFIX};

mod server;
pub use server::Server;

mod tasks;
pub(crate) use tasks::TaskSet;

/// Re-export of the `serde_json` crate, primarily to provide the `Value`
/// type carried by every event.
pub use serde_json::{self, Value};
