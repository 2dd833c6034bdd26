//! Serving a [`Server`] over WebSocket connections.
//!
//! This module connects transports to a [`Server`]. Built-in support is
//! provided for WebSockets over a [`TcpListener`] (with `tokio-tungstenite`)
//! and for [`axum`] WebSocket upgrades. A trait system is provided for custom
//! connection types.
//!
//! ## Usage
//!
//! Typically users want to use a [`Connect`] implementor to create a
//! listener using [`Connect::serve`]. [`Listener`]s manage accepting
//! connections, and hand each to the [`Server`], which runs the handshake
//! and spawns tasks to serve the connection.
//!
//! ```no_run
//! # use evsock::{Server, pubsub::Connect};
//! # async fn _main() -> std::io::Result<()> {
//! let server = Server::new("http://localhost:3000");
//! let addr: std::net::SocketAddr = ([0, 0, 0, 0], 8080).into();
//!
//! // Dropping the shutdown handle stops the listener.
//! let shutdown = addr.serve(server).await?;
//! shutdown.cancelled().await;
//! # Ok(())
//! # }
//! ```
//!
//! With `axum`, use [`Server::into_axum`] or the [`evsock_websocket`]
//! handler instead.
//!
//! ### Custom transports
//!
//! Custom [`Connect`] implementors can configure the listener in any way
//! they need, e.g. to apply network or security policies to inbound
//! connections. If you need more control over how connections are
//! accepted, you can create your own [`Listener`], or hand connections to
//! [`Server::accept_connection`] one at a time.
//!
//! A [`Listener`]'s associated stream and sink types are used to read frames
//! and write frames. These types must implement [`FrameStream`] and
//! [`FrameSink`] respectively.
//!
//! ## Backpressure
//!
//! Each connection has a bounded outbound queue, see
//! [`ServerConfig::with_outbound_buffer_per_client`]. Sends to a client whose
//! queue is full wait until its writer catches up.
//!
//! ## Internal Structure
//!
//! There are 3 tasks:
//! - `ListenerTask` - listens for new connections, accepts, and hands each
//!   to the server. A listener task is spawned for each call to
//!   [`Connect::serve`].
//! - `RouteTask` - Reads frames from an inbound connection, and spawns a
//!   tokio task to validate and route each frame. There is 1 `RouteTask` per
//!   connection.
//! - `WriteTask` - Drains the client's outbound queue, and writes each frame
//!   to the connection. There is 1 `WriteTask` per connection, and it is the
//!   only writer of the connection.
//!
//! [`Server`]: crate::Server
//! [`Server::into_axum`]: crate::Server::into_axum
//! [`Server::accept_connection`]: crate::Server::accept_connection
//! [`ServerConfig::with_outbound_buffer_per_client`]: crate::ServerConfig::with_outbound_buffer_per_client
//! [`TcpListener`]: tokio::net::TcpListener

mod shared;
pub(crate) use shared::ConnectionManager;

mod shutdown;
pub use shutdown::ServerShutdown;

mod r#trait;
pub use r#trait::{Connect, ConnectionInfo, Frame, FrameSink, FrameStream, In, Listener, Out};

#[cfg(feature = "ws")]
mod ws;
#[cfg(feature = "ws")]
pub use ws::WsFrameStream;

#[cfg(feature = "axum")]
mod axum;
#[cfg(feature = "axum")]
pub use axum::evsock_websocket;
