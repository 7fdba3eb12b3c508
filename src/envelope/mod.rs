//! Envelope codec
//!
//! Every message that crosses the broker is a JSON document whose payload is
//! carried as base64 text, so arbitrary bytes survive as a JSON string field:
//!
//! ```text
//! { "Headers": {...}, "ContentType": "application/json",
//!   "ContentEncoding": "utf-8", "Body": "<base64 text>" }
//! ```
//!
//! Decoding distinguishes two failures, both specific to one delivery:
//! - `Error::MalformedEnvelope`: the outer JSON does not parse
//! - `Error::InvalidEncoding`: `Body` is not valid base64

mod codec;

pub use codec::{DecodedMessage, Envelope, Headers, decode, encode};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_ENCODING_UTF8: &str = "utf-8";

/// Well-known envelope header keys.
pub mod header {
    pub const SOURCE: &str = "source";
    pub const TIMESTAMP: &str = "timestamp";
    pub const MESSAGE_TYPE: &str = "messageType";
    pub const CORRELATION_ID: &str = "correlationId";
    pub const REPLY_TO: &str = "replyTo";
}

#[cfg(test)]
mod tests;
