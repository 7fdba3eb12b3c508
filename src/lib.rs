//! # mqbridge
//!
//! `mqbridge` turns an asynchronous message broker into a request/response
//! service: an HTTP request is published as an envelope carrying a correlation
//! id, and the caller is answered with the reply that echoes that id.
//!
//! ## Core Modules
//!
//! - `envelope`: The wire envelope (headers, metadata, base64 body) and its codec.
//! - `broker`: Publisher/subscriber traits with RabbitMQ and in-memory backends.
//! - `bridge`: Publish-then-await-reply with timeout, correlation and acknowledgement.
//! - `relay`: The responder that answers bridge requests.
//! - `external`: Outbound HTTP collaborators used after a reply is decoded.
//! - `transport`: The HTTP surface.
//! - `config`: Handles loading the service configuration.
//! - `utils`: Shared error type and logging setup.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod envelope;
pub mod external;
pub mod relay;
pub mod transport;
pub mod utils;

pub use utils::error::{Error, Result};
