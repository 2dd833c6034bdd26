#![allow(dead_code)]

pub mod ws_client;
pub use ws_client::{connect_raw, decode, Credentials, WsClient};

use evsock::{Server, ServerConfig};
use eyre::{bail, OptionExt, Result};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::{sync::mpsc, time::timeout};
use tokio_tungstenite::tungstenite::Message;

/// The origin accepted by [`test_server`].
pub const ORIGIN: &str = "http://localhost:3000";

/// Reconnect timeout of [`test_server`].
pub const RECONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on any single wait in these tests.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub server: Server,
    /// `(client_id, code)` for every disconnect the server saw.
    pub disconnects: mpsc::UnboundedReceiver<(String, u16)>,
}

impl TestServer {
    pub async fn next_disconnect(&mut self) -> Result<(String, u16)> {
        timeout(RECV_TIMEOUT, self.disconnects.recv())
            .await?
            .ok_or_eyre("disconnect listener dropped")
    }
}

/// Instantiate a server for testing.
///
/// - `echo` sends the payload back to the sender.
/// - `announce` broadcasts the payload to everyone.
/// - every client is sent a `welcome` event with its ID once connected.
pub fn test_server() -> TestServer {
    let server = Server::from_config(
        ServerConfig::new(ORIGIN)
            .with_reconnect_timeout(RECONNECT_TIMEOUT)
            .with_reap_interval(Duration::from_millis(50)),
    );

    server.on("echo", |client, payload| async move {
        let _ = client.send("echo", &payload).await;
    });

    let announcer = server.clone();
    server.on("announce", move |_client, payload| {
        let server = announcer.clone();
        async move {
            server.broadcast("announce", &payload).await;
        }
    });

    server.connect(|client| async move {
        let _ = client.send("welcome", client.id()).await;
    });

    let (tx, disconnects) = mpsc::unbounded_channel();
    server.disconnect(move |client, code| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((client.id().to_owned(), code));
        }
    });

    TestServer {
        server,
        disconnects,
    }
}

/// Poll `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + RECV_TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("condition not met in time")
}

/// Handshake, subscriptions and the token check.
pub async fn basic_tests(url: &str, ts: &TestServer) -> Result<()> {
    let mut client = WsClient::connect(url).await?;
    assert_eq!(client.id().len(), 16);
    assert!(client.credentials.can_compress);
    assert!(ts.server.client(client.id()).is_some());

    client.subscribe("echo").await?;
    client.subscribe("welcome").await?;

    let start = Instant::now();
    client.ready(false).await?;
    let welcome = client.recv().await?;
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(
        welcome,
        json!({
            "name": "welcome",
            "data": client.id(),
            "token": client.credentials.server_key,
        })
    );

    // forged frames are dropped silently
    client
        .send_raw(&json!({"token": "forged", "name": "echo", "data": 1}))
        .await?;
    client.emit("echo", json!({"n": 2})).await?;
    assert_eq!(client.recv().await?["data"], json!({"n": 2}));

    // names are sanitized on the way in
    client.emit("ec ho!", json!(3)).await?;
    assert_eq!(client.recv().await?["data"], json!(3));

    client.subscribe("!echo").await?;
    client.emit("echo", json!(4)).await?;
    client.expect_silence(Duration::from_millis(200)).await?;

    Ok(())
}

/// Connections from other origins never get a session.
pub async fn origin_tests(url: &str, ts: &TestServer) -> Result<()> {
    let before = ts.server.len();

    for origin in [Some("http://evil.example"), None] {
        let mut socket = connect_raw(url, origin).await?;
        let next = timeout(RECV_TIMEOUT, socket.next()).await?;
        assert!(
            !matches!(next, Some(Ok(Message::Text(_)))),
            "rejected connection was greeted"
        );
    }

    assert_eq!(ts.server.len(), before);
    Ok(())
}

/// Clean disconnects, lost connections, the reaper, and kicks.
pub async fn lifecycle_tests(url: &str, ts: &mut TestServer) -> Result<()> {
    let mut client = WsClient::connect(url).await?;
    let id = client.id().to_owned();
    client.ready(false).await?;
    client.disconnect(1000).await?;
    assert_eq!(client.recv_close().await?, Some(1000));
    assert!(ts.server.client(&id).is_none());
    assert_eq!(ts.next_disconnect().await?, (id, 1000));

    let dropped = WsClient::connect(url).await?;
    let id = dropped.id().to_owned();
    drop(dropped);
    assert_eq!(ts.next_disconnect().await?, (id.clone(), 1006));
    let zombie = ts
        .server
        .client(&id)
        .ok_or_eyre("zombie reaped too early")?;
    assert!(zombie.is_closed());
    assert!(zombie.disconnected_at().is_some());
    eventually(|| ts.server.client(&id).is_none()).await?;

    let mut kicked = WsClient::connect(url).await?;
    assert!(ts.server.kick(kicked.id(), 8).await);
    assert_eq!(kicked.recv_close().await?, Some(1008));

    Ok(())
}

/// A session dropped with a non-normal code migrates into a new
/// connection.
pub async fn migration_tests(url: &str, ts: &mut TestServer) -> Result<()> {
    let mut old = WsClient::connect(url).await?;
    old.subscribe("news").await?;
    old.ready(false).await?;

    let session = ts.server.client(old.id()).ok_or_eyre("unknown session")?;
    eventually(|| session.is_subscribed("news")).await?;
    session.set("nickname", "ada");

    old.disconnect(7).await?;
    assert_eq!(old.recv_close().await?, Some(1000));
    assert_eq!(ts.next_disconnect().await?, (old.id().to_owned(), 1007));
    assert!(ts.server.client(old.id()).is_some_and(|c| c.is_closed()));

    let mut new = WsClient::connect(url).await?;

    let mut forged = old.credentials.clone();
    forged.token = "nope".into();
    new.migrate(&forged).await?;
    assert_eq!(
        new.recv().await?,
        json!({"name": "@error", "data": "migrate", "token": new.credentials.server_key})
    );

    new.migrate(&old.credentials).await?;
    let migrated = ts.server.client(new.id()).ok_or_eyre("unknown session")?;
    eventually(|| migrated.is_subscribed("news")).await?;
    assert_eq!(migrated.get("nickname"), Some(json!("ada")));

    assert!(ts.server.send(new.id(), "news", "extra!").await?);
    assert_eq!(new.recv().await?["data"], "extra!");

    Ok(())
}

/// Broadcasts reach subscribers only.
pub async fn broadcast_tests(url: &str) -> Result<()> {
    let mut listener = WsClient::connect(url).await?;
    listener.subscribe("announce").await?;
    listener.ready(false).await?;

    let mut speaker = WsClient::connect(url).await?;
    speaker.ready(false).await?;
    speaker.emit("announce", json!("hello all")).await?;

    assert_eq!(listener.recv().await?["data"], "hello all");
    speaker.expect_silence(Duration::from_millis(200)).await?;

    Ok(())
}

/// Negotiated compression gzips outbound frames.
pub async fn compression_tests(url: &str) -> Result<()> {
    let mut client = WsClient::connect(url).await?;
    client.subscribe("echo").await?;
    client.ready(true).await?;
    client.emit("echo", json!("squeeze")).await?;

    let wire = client.recv_text().await?;
    assert!(serde_json::from_str::<Value>(&wire).is_err());
    let decoded = decode(&wire)?;
    assert_eq!(decoded["data"], "squeeze");
    assert_eq!(decoded["token"], json!(client.credentials.server_key));

    Ok(())
}
