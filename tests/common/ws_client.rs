use super::{ORIGIN, RECV_TIMEOUT};
use base64::{engine::general_purpose::STANDARD, Engine};
use evsock::{CONNECTION_EVENT, LISTENER_EVENT};
use eyre::{bail, OptionExt, Result};
use flate2::read::GzDecoder;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::{io::Read, time::Duration};
use tokio::time::timeout;
use tokio_tungstenite::{
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

pub type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Open a WebSocket, declaring `origin`.
pub async fn connect_raw(url: &str, origin: Option<&str>) -> Result<Socket> {
    let mut request = url.into_client_request()?;
    if let Some(origin) = origin {
        request
            .headers_mut()
            .insert(header::ORIGIN, HeaderValue::from_str(origin)?);
    }
    let (socket, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(socket)
}

/// Parse an envelope, undoing gzip and base64 if needed.
pub fn decode(text: &str) -> Result<Value> {
    if let Ok(value) = serde_json::from_str(text) {
        return Ok(value);
    }
    let gz = STANDARD.decode(text)?;
    let mut plain = String::new();
    GzDecoder::new(gz.as_slice()).read_to_string(&mut plain)?;
    Ok(serde_json::from_str(&plain)?)
}

/// The credentials from the `@connection` greeting.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub token: String,
    pub server_key: String,
    pub enc_key: String,
    pub can_compress: bool,
}

pub struct WsClient {
    socket: Socket,
    pub credentials: Credentials,
}

impl WsClient {
    /// Connect from the accepted origin, and read the greeting.
    pub async fn connect(url: &str) -> Result<Self> {
        let socket = connect_raw(url, Some(ORIGIN)).await?;
        let mut client = Self {
            socket,
            credentials: Credentials {
                client_id: String::new(),
                token: String::new(),
                server_key: String::new(),
                enc_key: String::new(),
                can_compress: false,
            },
        };

        let hello = client.recv().await?;
        if hello["name"] != CONNECTION_EVENT || hello["data"] != "connect" {
            bail!("unexpected greeting {hello}");
        }
        let field = |name: &str| {
            hello[name]
                .as_str()
                .map(str::to_owned)
                .ok_or_eyre("greeting field missing")
        };
        client.credentials = Credentials {
            client_id: field("clientID")?,
            token: field("token")?,
            server_key: field("serverKey")?,
            enc_key: field("encKey")?,
            can_compress: hello["canCompress"].as_bool().unwrap_or_default(),
        };
        Ok(client)
    }

    pub fn id(&self) -> &str {
        &self.credentials.client_id
    }

    pub async fn send_raw(&mut self, msg: &Value) -> Result<()> {
        self.socket.send(Message::text(msg.to_string())).await?;
        Ok(())
    }

    /// Send an event with this session's token.
    pub async fn emit(&mut self, name: &str, data: Value) -> Result<()> {
        let msg = json!({"token": self.credentials.token, "name": name, "data": data});
        self.send_raw(&msg).await
    }

    pub async fn subscribe(&mut self, name: &str) -> Result<()> {
        self.emit(LISTENER_EVENT, json!(name)).await
    }

    pub async fn ready(&mut self, compress: bool) -> Result<()> {
        let msg = json!({
            "token": self.credentials.token,
            "name": CONNECTION_EVENT,
            "data": "connect",
            "compress": u8::from(compress),
        });
        self.send_raw(&msg).await
    }

    pub async fn disconnect(&mut self, code: u16) -> Result<()> {
        let msg = json!({
            "token": self.credentials.token,
            "name": CONNECTION_EVENT,
            "data": "disconnect",
            "code": code,
        });
        self.send_raw(&msg).await
    }

    pub async fn migrate(&mut self, old: &Credentials) -> Result<()> {
        let msg = json!({
            "token": self.credentials.token,
            "name": CONNECTION_EVENT,
            "data": "migrate",
            "oldClient": old.client_id,
            "oldToken": old.token,
            "oldServerKey": old.server_key,
            "oldKey": old.enc_key,
        });
        self.send_raw(&msg).await
    }

    /// The next text frame, as sent.
    pub async fn recv_text(&mut self) -> Result<String> {
        loop {
            let msg = timeout(RECV_TIMEOUT, self.socket.next())
                .await?
                .ok_or_eyre("connection closed")??;
            match msg {
                Message::Text(text) => return Ok(text.as_str().to_owned()),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => bail!("unexpected message {other:?}"),
            }
        }
    }

    /// The next envelope.
    pub async fn recv(&mut self) -> Result<Value> {
        decode(&self.recv_text().await?)
    }

    /// Read until the server closes the connection, returning the close
    /// code.
    pub async fn recv_close(&mut self) -> Result<Option<u16>> {
        loop {
            match timeout(RECV_TIMEOUT, self.socket.next()).await? {
                Some(Ok(Message::Close(frame))) => return Ok(frame.map(|f| f.code.into())),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(None),
            }
        }
    }

    /// Fail if anything arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) -> Result<()> {
        match timeout(wait, self.socket.next()).await {
            Err(_) => Ok(()),
            Ok(msg) => bail!("unexpected message {msg:?}"),
        }
    }
}
