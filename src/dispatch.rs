//! Validation and routing of inbound frames.

use crate::{
    client::{normalize_wire_code, CLOSE_NORMAL},
    codec::{self, Inbound, CONNECTION_EVENT, ERROR_EVENT, LISTENER_EVENT},
    errlog, metrics,
    payload::{as_int, as_str},
    sanitize,
    sanitize::is_system,
    Client, ProtocolError, Server,
};
use bytes::Bytes;
use std::borrow::Cow;
use tracing::{debug, trace, warn};

impl Server {
    /// Validate and route one inbound frame of `client`.
    ///
    /// Rejected frames are dropped without a response. They are logged,
    /// counted and recorded in the error log.
    pub(crate) async fn handle_frame(&self, client: &Client, frame: Bytes) {
        if let Err(err) = self.route(client, &frame).await {
            metrics::record_rejection(err.reason());
            warn!(client_id = client.id(), %err, "dropping frame");
            errlog::record(err);
        }
    }

    async fn route(&self, client: &Client, frame: &[u8]) -> Result<(), ProtocolError> {
        let frame = if self.config().compression {
            codec::decompress(frame)
        } else {
            Cow::Borrowed(frame)
        };

        let inbound = Inbound::parse(&frame)?;
        let name = inbound.authenticate(client.token(), client.id())?;

        match name {
            CONNECTION_EVENT => self.on_connection_event(client, &inbound).await,
            LISTENER_EVENT => {
                let request = inbound.system_data(LISTENER_EVENT)?;
                trace!(request, "subscription change");
                client.toggle_subscription(request);
                Ok(())
            }
            name if is_system(name) => Err(ProtocolError::UnknownSystemEvent(name.to_owned())),
            name => {
                let name = sanitize(name);
                metrics::record_event(&name);
                let invoked = self.fire_message(client, &name, &inbound.data).await;
                trace!(%name, invoked, "event dispatched");
                Ok(())
            }
        }
    }

    async fn on_connection_event(
        &self,
        client: &Client,
        inbound: &Inbound,
    ) -> Result<(), ProtocolError> {
        match inbound.system_data(CONNECTION_EVENT)? {
            "connect" => {
                let compress = self.config().compression && as_int(&inbound.compress) == 1;
                if client.negotiate_compression(compress) {
                    debug!(client_id = client.id(), compress, "client ready");
                    self.fire_connect(client).await;
                } else {
                    trace!("repeated connect ignored");
                }
                Ok(())
            }
            "disconnect" => {
                let code = normalize_wire_code(as_int(&inbound.code));
                self.on_disconnect(client, code).await;
                Ok(())
            }
            "migrate" => {
                self.on_migrate(client, inbound).await;
                Ok(())
            }
            other => Err(ProtocolError::UnknownSystemEvent(format!(
                "{CONNECTION_EVENT}/{other}"
            ))),
        }
    }

    /// The client announced it is leaving. Code 1000 forgets the session,
    /// any other code keeps it for migration.
    async fn on_disconnect(&self, client: &Client, code: u16) {
        if !client.mark_closed() {
            trace!("session already closed");
            return;
        }

        if code == CLOSE_NORMAL {
            self.unregister(client);
        } else {
            client.mark_disconnected();
        }
        debug!(client_id = client.id(), code, "client disconnected");

        client.close_transport(CLOSE_NORMAL).await;
        self.fire_disconnect(client, code).await;
    }

    /// Move the state of a closed session into `client`. A refused
    /// migration is reported to the client only.
    async fn on_migrate(&self, client: &Client, inbound: &Inbound) {
        let old_id = as_str(&inbound.old_client);

        let old = self.client(old_id).filter(|old| {
            old.accepts_migration(
                client,
                as_str(&inbound.old_token),
                as_str(&inbound.old_server_key),
                as_str(&inbound.old_key),
            )
        });
        metrics::record_migration(old.is_some());

        match old {
            Some(old) => {
                client.absorb(&old);
                debug!(client_id = client.id(), old_client = old_id, "session migrated");
            }
            None => {
                debug!(client_id = client.id(), old_client = old_id, "migration refused");
                if let Err(err) = client.send_core(ERROR_EVENT, "migrate").await {
                    errlog::record(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        pubsub::Frame,
        server::test::{connect_client, test_server},
        ServerConfig,
    };
    use serde_json::{json, Value};
    use std::{sync::Arc, time::Duration};
    use tokio::sync::mpsc;

    fn frame(client: &Client, name: &str, data: Value) -> Bytes {
        json!({"token": client.token(), "name": name, "data": data})
            .to_string()
            .into()
    }

    fn envelope(frame: Frame) -> Value {
        match frame {
            Frame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn user_events_reach_server_and_client_listeners() {
        let server = test_server();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let t = tx.clone();
        server.on("chat", move |client, payload| {
            let t = t.clone();
            async move {
                t.send(format!("server:{}:{payload}", client.id().len())).unwrap();
            }
        });

        let (client, _out) = connect_client(&server);
        client.on("ch@at", move |payload| {
            let t = tx.clone();
            async move {
                t.send(format!("client:{payload}")).unwrap();
            }
        });

        server
            .handle_frame(&client, frame(&client, "chat", json!(5)))
            .await;

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(seen, ["client:5", "server:16:5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_token_has_no_effect() {
        let server = test_server();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let h = hits.clone();
        server.on("chat", move |_, _| {
            let h = h.clone();
            async move {
                h.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        let (client, mut out) = connect_client(&server);
        let forged = json!({"token": "guess", "name": "chat", "data": 1}).to_string();
        server.handle_frame(&client, forged.into()).await;

        let forged = json!({"token": "guess", "name": LISTENER_EVENT, "data": "chat"});
        server.handle_frame(&client, forged.to_string().into()).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(client.subscriptions().is_empty());
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn listener_events_toggle_subscriptions() {
        let server = test_server();
        let (client, _out) = connect_client(&server);

        server
            .handle_frame(&client, frame(&client, LISTENER_EVENT, json!("msg")))
            .await;
        assert!(client.is_subscribed("msg"));

        server
            .handle_frame(&client, frame(&client, LISTENER_EVENT, json!("!msg")))
            .await;
        assert!(!client.is_subscribed("msg"));

        // non-string data is rejected
        server
            .handle_frame(&client, frame(&client, LISTENER_EVENT, json!(["msg"])))
            .await;
        assert!(client.subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_fires_once_and_fixes_compression() {
        let server = test_server();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.connect(move |client| {
            let tx = tx.clone();
            async move {
                tx.send(client.id().to_owned()).unwrap();
            }
        });

        let (client, _out) = connect_client(&server);
        let connect = json!({
            "token": client.token(),
            "name": CONNECTION_EVENT,
            "data": "connect",
            "compress": "1",
        });
        server
            .handle_frame(&client, connect.to_string().into())
            .await;
        server
            .handle_frame(&client, connect.to_string().into())
            .await;

        assert_eq!(rx.recv().await.unwrap(), client.id());
        assert!(client.compresses());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn compression_can_be_disabled() {
        let server = Server::from_config(
            ServerConfig::new("http://localhost").with_compression(false),
        );
        let (client, _out) = connect_client(&server);
        let connect = json!({
            "token": client.token(),
            "name": CONNECTION_EVENT,
            "data": "connect",
            "compress": 1,
        });
        server
            .handle_frame(&client, connect.to_string().into())
            .await;
        assert!(!client.compresses());

        // compressed frames are not understood
        let wire = codec::compress(&String::from_utf8_lossy(&frame(
            &client,
            LISTENER_EVENT,
            json!("x"),
        )))
        .unwrap();
        server.handle_frame(&client, wire.into()).await;
        assert!(!client.is_subscribed("x"));
    }

    #[tokio::test]
    async fn compressed_frames_are_accepted() {
        let server = test_server();
        let (client, _out) = connect_client(&server);
        let plain = frame(&client, LISTENER_EVENT, json!("zipped"));
        let wire = codec::compress(std::str::from_utf8(&plain).unwrap()).unwrap();

        server.handle_frame(&client, wire.into()).await;
        assert!(client.is_subscribed("zipped"));
    }

    #[tokio::test(start_paused = true)]
    async fn short_disconnect_code_leaves_zombie() {
        let server = test_server();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.disconnect(move |_client, code| {
            let tx = tx.clone();
            async move {
                tx.send(code).unwrap();
            }
        });

        let (client, mut out) = connect_client(&server);
        let bye = json!({
            "token": client.token(),
            "name": CONNECTION_EVENT,
            "data": "disconnect",
            "code": 7,
        });
        server.handle_frame(&client, bye.to_string().into()).await;

        assert!(client.is_closed());
        assert!(client.disconnected_at().is_some());
        assert!(server.client(client.id()).is_some());
        assert_eq!(out.recv().await, Some(Frame::Close(CLOSE_NORMAL)));
        assert_eq!(rx.recv().await, Some(1007));
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_disconnect_code_leaves_zombie() {
        let server = test_server();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.disconnect(move |_client, code| {
            let tx = tx.clone();
            async move {
                tx.send(code).unwrap();
            }
        });

        let (client, mut out) = connect_client(&server);
        let bye = json!({
            "token": client.token(),
            "name": CONNECTION_EVENT,
            "data": "disconnect",
            "code": 70_000,
        });
        server.handle_frame(&client, bye.to_string().into()).await;

        assert!(client.is_closed());
        assert!(server.client(client.id()).is_some());
        assert_eq!(out.recv().await, Some(Frame::Close(CLOSE_NORMAL)));
        assert_eq!(rx.recv().await, Some(u16::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn clean_disconnect_forgets_session() {
        let server = test_server();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (client, _out) = connect_client(&server);
        client.disconnect(move |code| {
            let tx = tx.clone();
            async move {
                tx.send(code).unwrap();
            }
        });

        let bye = json!({
            "token": client.token(),
            "name": CONNECTION_EVENT,
            "data": "disconnect",
            "code": 1000,
        });
        server.handle_frame(&client, bye.to_string().into()).await;
        assert!(server.client(client.id()).is_none());
        assert_eq!(rx.recv().await, Some(1000));

        // a second disconnect is ignored
        server.handle_frame(&client, bye.to_string().into()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn migration_merges_closed_session() {
        let server = test_server();
        let (old, _old_out) = connect_client(&server);
        old.toggle_subscription("news");
        old.set("name", "ada");
        old.set("theme", "dark");
        old.mark_closed();
        old.mark_disconnected();

        let (new, _new_out) = connect_client(&server);
        new.set("theme", "light");

        let secrets = old.secrets();
        let migrate = json!({
            "token": new.token(),
            "name": CONNECTION_EVENT,
            "data": "migrate",
            "oldClient": old.id(),
            "oldToken": secrets.token,
            "oldServerKey": secrets.server_key,
            "oldKey": secrets.session_key,
        });
        server.handle_frame(&new, migrate.to_string().into()).await;

        assert!(new.is_subscribed("news"));
        assert_eq!(new.get("name"), Some(json!("ada")));
        assert_eq!(new.get("theme"), Some(json!("light")));
        assert!(server.client(old.id()).is_some());
    }

    #[tokio::test]
    async fn refused_migration_reports_error() {
        let server = test_server();
        let (old, _old_out) = connect_client(&server);
        let (new, mut new_out) = connect_client(&server);

        let secrets = old.secrets();
        // the old session is still live
        let migrate = json!({
            "token": new.token(),
            "name": CONNECTION_EVENT,
            "data": "migrate",
            "oldClient": old.id(),
            "oldToken": secrets.token,
            "oldServerKey": secrets.server_key,
            "oldEncKey": secrets.session_key,
        });
        server.handle_frame(&new, migrate.to_string().into()).await;

        assert_eq!(
            envelope(new_out.recv().await.unwrap()),
            json!({"name": ERROR_EVENT, "data": "migrate", "token": new.secrets().server_key})
        );
    }

    fn migrate_from(new: &Client, old: &Client) -> Bytes {
        let secrets = old.secrets();
        json!({
            "token": new.token(),
            "name": CONNECTION_EVENT,
            "data": "migrate",
            "oldClient": old.id(),
            "oldToken": secrets.token,
            "oldServerKey": secrets.server_key,
            "oldKey": secrets.session_key,
        })
        .to_string()
        .into()
    }

    fn refused(new: &Client, frame: Frame) {
        assert_eq!(
            envelope(frame),
            json!({"name": ERROR_EVENT, "data": "migrate", "token": new.secrets().server_key})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cleanly_closed_session_cannot_migrate() {
        let server = test_server();
        let (old, mut old_out) = connect_client(&server);
        old.toggle_subscription("news");
        old.set("name", "ada");

        let bye = json!({
            "token": old.token(),
            "name": CONNECTION_EVENT,
            "data": "disconnect",
            "code": 1000,
        });
        server.handle_frame(&old, bye.to_string().into()).await;
        assert_eq!(old_out.recv().await, Some(Frame::Close(CLOSE_NORMAL)));

        let (new, mut new_out) = connect_client(&server);
        server.handle_frame(&new, migrate_from(&new, &old)).await;

        refused(&new, new_out.recv().await.unwrap());
        assert!(!new.is_subscribed("news"));
        assert_eq!(new.get("name"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn reaped_session_cannot_migrate() {
        let server = Server::from_config(
            ServerConfig::new("http://localhost")
                .with_reconnect_timeout(Duration::from_secs(1))
                .with_reap_interval(Duration::from_millis(100)),
        );
        let (old, _old_out) = connect_client(&server);
        old.toggle_subscription("news");
        old.set("name", "ada");
        old.mark_closed();
        old.mark_disconnected();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(server.client(old.id()).is_none());

        let (new, mut new_out) = connect_client(&server);
        server.handle_frame(&new, migrate_from(&new, &old)).await;

        refused(&new, new_out.recv().await.unwrap());
        assert!(!new.is_subscribed("news"));
        assert_eq!(new.get("name"), None);
    }

    #[tokio::test]
    async fn unknown_system_events_are_rejected() {
        let server = test_server();
        let (client, mut out) = connect_client(&server);

        let route = server
            .route(&client, &frame(&client, "@shutdown", json!(null)))
            .await;
        assert_eq!(
            route,
            Err(ProtocolError::UnknownSystemEvent("@shutdown".into()))
        );

        let route = server.route(&client, b"[1, 2").await;
        assert!(matches!(route, Err(ProtocolError::Parse(_))));
        assert!(out.try_recv().is_err());
    }
}
