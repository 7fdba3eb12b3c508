use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CONTENT_ENCODING_UTF8, CONTENT_TYPE_JSON, header};
use crate::utils::error::{Error, Result};

pub type Headers = Map<String, Value>;

/// The logical message exchanged over the broker.
///
/// `body` holds the decoded bytes; base64 only exists on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub headers: Headers,
    pub content_type: String,
    pub content_encoding: String,
    pub body: Vec<u8>,
}

/// Serialized form of an [`Envelope`].
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "Headers", default)]
    headers: Option<Headers>,
    #[serde(rename = "ContentType", default)]
    content_type: Option<String>,
    #[serde(rename = "ContentEncoding", default)]
    content_encoding: Option<String>,
    #[serde(rename = "Body", default)]
    body: Option<String>,
}

impl Envelope {
    /// Creates an envelope with no headers and the fixed JSON/UTF-8 metadata.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: Headers::new(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            content_encoding: CONTENT_ENCODING_UTF8.to_string(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Merges `headers` in; keys already present are overwritten.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header_str(header::CORRELATION_ID)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = WireEnvelope {
            headers: Some(self.headers.clone()),
            content_type: Some(self.content_type.clone()),
            content_encoding: Some(self.content_encoding.clone()),
            body: Some(STANDARD.encode(&self.body)),
        };
        serde_json::to_vec(&wire).map_err(|e| Error::Encoding(e.to_string()))
    }

    pub fn decode(wire: &[u8]) -> Result<Self> {
        let wire: WireEnvelope =
            serde_json::from_slice(wire).map_err(|e| Error::MalformedEnvelope(e.to_string()))?;
        // Null fields decode like missing ones.
        let body = STANDARD.decode(wire.body.unwrap_or_default().as_bytes())?;

        Ok(Self {
            headers: wire.headers.unwrap_or_default(),
            content_type: wire.content_type.unwrap_or_default(),
            content_encoding: wire.content_encoding.unwrap_or_default(),
            body,
        })
    }
}

/// Encodes `payload` with the caller's `headers` into wire bytes.
pub fn encode(payload: &[u8], headers: Headers) -> Result<Vec<u8>> {
    Envelope::new(payload).with_headers(headers).encode()
}

/// Decodes wire bytes into an [`Envelope`].
pub fn decode(wire: &[u8]) -> Result<Envelope> {
    Envelope::decode(wire)
}

/// A decoded reply together with the routing metadata of its delivery.
///
/// Serializes with camelCase keys; this is the object returned to HTTP callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedMessage {
    pub headers: Headers,
    pub content_type: String,
    pub content_encoding: String,
    pub body: String,
    pub exchange: String,
    pub routing_key: String,
    #[serde(skip)]
    pub payload: Vec<u8>,
}

impl DecodedMessage {
    /// Combines an envelope with its delivery metadata. Envelope headers win
    /// over broker-level headers on key collision.
    pub fn new(envelope: Envelope, broker_headers: Headers, exchange: &str, routing_key: &str) -> Self {
        let mut headers = broker_headers;
        headers.extend(envelope.headers);
        Self {
            body: String::from_utf8_lossy(&envelope.body).into_owned(),
            headers,
            content_type: envelope.content_type,
            content_encoding: envelope.content_encoding,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: envelope.body,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers
            .get(header::CORRELATION_ID)
            .and_then(Value::as_str)
    }
}
