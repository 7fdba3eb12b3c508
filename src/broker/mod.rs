//! Broker abstraction
//!
//! The bridge and the relay only talk to the broker through two traits:
//! - [`Publish`]: bound to one fixed [`Destination`], publishes one envelope
//! - [`Subscribe`]: bound to one queue, yields a stream of [`Delivery`]s
//!
//! Two backends implement them:
//! - `amqp`: RabbitMQ through `lapin`, sharing one channel per process
//! - `memory`: an in-process broker with the same routing and acknowledgement
//!   rules, used by tests and by `--in-memory` runs
//!
//! Every delivery requires an explicit disposition. Subscribers never auto-ack.

pub mod amqp;
mod delivery;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::QueueSettings;
use crate::envelope::Envelope;
use crate::utils::error::Result;

pub use delivery::{Acker, Delivery};

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Where a publisher sends: an exchange and a routing key. The default
/// exchange (empty name) routes by queue name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            exchange: String::new(),
            routing_key: name.into(),
        }
    }

    pub fn exchange(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    pub fn from_settings(settings: &QueueSettings) -> Self {
        if settings.exchange.is_empty() {
            Self::queue(&settings.queue)
        } else {
            Self::exchange(&settings.exchange, &settings.routing_key)
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exchange.is_empty() {
            write!(f, "queue '{}'", self.routing_key)
        } else {
            write!(f, "exchange '{}' ({})", self.exchange, self.routing_key)
        }
    }
}

/// Publishes envelopes to a destination fixed at construction.
///
/// Errors are `Error::Encoding` or `Error::Transport`; nothing is retried here.
#[async_trait]
pub trait Publish: Send + Sync {
    fn destination(&self) -> &Destination;

    async fn publish(&self, envelope: &Envelope) -> Result<()>;
}

/// Consumes one queue.
///
/// Each call to `start_consuming` registers another competing consumer: the
/// broker hands every message to exactly one of them.
#[async_trait]
pub trait Subscribe: Send + Sync {
    fn queue(&self) -> &str;

    async fn start_consuming(&self) -> Result<DeliveryStream>;
}

#[cfg(test)]
mod tests;
