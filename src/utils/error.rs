//! The `error` module defines the error type shared by every `mqbridge` component.
//!
//! Codec, broker, bridge and relay failures all surface as [`Error`] so the
//! HTTP layer can map them to a status code in one place.

use std::time::Duration;

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("invalid body encoding: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("publish failed: {0}")]
    Publish(Box<Error>),

    #[error("no reply received within {0:?}")]
    Timeout(Duration),

    #[error("reply subscription closed")]
    Closed,

    #[error("correlation id already awaited: {0}")]
    DuplicateCorrelation(String),

    #[error("external call failed: {0}")]
    External(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error concerns a single message rather than the connection.
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Error::MalformedEnvelope(_) | Error::InvalidEncoding(_))
    }
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::External(err.to_string())
    }
}
