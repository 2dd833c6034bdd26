//! Wire envelopes and the optional gzip layer.
//!
//! Inbound frames are JSON objects carrying at least a `token` and a `name`.
//! Outbound frames are `{name, data, token}` objects, where `token` is the
//! client's server key. When compression is negotiated, outbound frames are
//! gzipped and then base64 encoded, so they remain valid text frames.

use crate::{CodecError, ProtocolError};
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    borrow::Cow,
    io::{Read, Write},
};

/// Connection lifecycle events: `connect`, `disconnect` and `migrate`.
pub const CONNECTION_EVENT: &str = "@connection";
/// Subscription changes. `data` is an event name, `!`-prefixed to remove.
pub const LISTENER_EVENT: &str = "@listener";
/// Server to client error notification.
pub const ERROR_EVENT: &str = "@error";

/// Inbound envelope. Every field is kept untyped until it is validated, so
/// that a malformed field is reported as a protocol rejection rather than a
/// parse failure of the whole frame.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Inbound {
    #[serde(default)]
    pub(crate) token: Value,
    #[serde(default)]
    pub(crate) name: Value,
    #[serde(default)]
    pub(crate) data: Value,
    #[serde(default)]
    pub(crate) compress: Value,
    #[serde(default)]
    pub(crate) code: Value,
    #[serde(default)]
    pub(crate) old_client: Value,
    #[serde(default)]
    pub(crate) old_token: Value,
    #[serde(default)]
    pub(crate) old_server_key: Value,
    #[serde(default, alias = "oldEncKey")]
    pub(crate) old_key: Value,
}

impl Inbound {
    /// Parse a (decompressed) frame.
    pub(crate) fn parse(frame: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(frame).map_err(|err| ProtocolError::Parse(err.to_string()))
    }

    /// Check the frame's token against the session token, and return the
    /// event name.
    pub(crate) fn authenticate(&self, token: &str, client_id: &str) -> Result<&str, ProtocolError> {
        let presented = self.token.as_str().ok_or(ProtocolError::TokenNotString)?;
        if presented != token {
            return Err(ProtocolError::TokenMismatch {
                client_id: client_id.to_owned(),
            });
        }
        self.name.as_str().ok_or(ProtocolError::NameNotString)
    }

    /// The `data` field of a system event, which must be a string.
    pub(crate) fn system_data(&self, name: &'static str) -> Result<&str, ProtocolError> {
        self.data
            .as_str()
            .ok_or(ProtocolError::DataNotString { name })
    }
}

/// Outbound envelope.
#[derive(Debug, Serialize)]
pub(crate) struct Outbound<'a, T: ?Sized> {
    pub(crate) name: &'a str,
    pub(crate) data: &'a T,
    pub(crate) token: &'a str,
}

impl<T: Serialize + ?Sized> Outbound<'_, T> {
    pub(crate) fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(Into::into)
    }
}

/// The first message sent on every connection.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Handshake<'a> {
    pub(crate) name: &'static str,
    pub(crate) data: &'static str,
    #[serde(rename = "clientID")]
    pub(crate) client_id: &'a str,
    pub(crate) token: &'a str,
    pub(crate) server_key: &'a str,
    pub(crate) enc_key: &'a str,
    pub(crate) can_compress: bool,
}

impl Handshake<'_> {
    pub(crate) fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(Into::into)
    }
}

/// Gzip `json` and base64 encode the result.
pub(crate) fn compress(json: &str) -> Result<String, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(json.as_bytes())?;
    Ok(STANDARD.encode(encoder.finish()?))
}

/// Undo [`compress`]. Frames that are not base64-encoded gzip are returned
/// unchanged.
pub(crate) fn decompress(frame: &[u8]) -> Cow<'_, [u8]> {
    let Ok(gz) = STANDARD.decode(frame.trim_ascii()) else {
        return Cow::Borrowed(frame);
    };

    let mut plain = Vec::new();
    match GzDecoder::new(gz.as_slice()).read_to_end(&mut plain) {
        Ok(_) => Cow::Owned(plain),
        Err(_) => Cow::Borrowed(frame),
    }
}
