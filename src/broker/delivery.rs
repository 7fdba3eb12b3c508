use async_trait::async_trait;
use tracing::warn;

use crate::envelope::{DecodedMessage, Envelope, Headers};
use crate::utils::error::Result;

/// Broker-side half of a delivery: resolves its disposition.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message handed out by a subscriber.
///
/// Exactly one of [`Delivery::ack`] or [`Delivery::nack`] must be called; both
/// consume the delivery. A delivery dropped undecided is returned to its queue.
pub struct Delivery {
    pub data: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    /// Broker-level correlation id property, when the publisher set one.
    pub correlation_id: Option<String>,
    /// Broker-level headers.
    pub headers: Headers,
    pub redelivered: bool,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(
        data: Vec<u8>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        acker: impl Acker + 'static,
    ) -> Self {
        Self {
            data,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            correlation_id: None,
            headers: Headers::new(),
            redelivered: false,
            acker: Some(Box::new(acker)),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Decodes the wire envelope and attaches this delivery's routing metadata.
    pub fn decode(&self) -> Result<DecodedMessage> {
        let envelope = Envelope::decode(&self.data)?;
        Ok(DecodedMessage::new(
            envelope,
            self.headers.clone(),
            &self.exchange,
            &self.routing_key,
        ))
    }

    pub async fn ack(mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    pub async fn nack(mut self, requeue: bool) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.nack(requeue).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("correlation_id", &self.correlation_id)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        let Some(acker) = self.acker.take() else {
            return;
        };

        warn!(
            routing_key = %self.routing_key,
            correlation_id = ?self.correlation_id,
            "delivery dropped without ack/nack, returning it to the queue"
        );

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = acker.nack(true).await {
                    warn!("failed to requeue dropped delivery: {e}");
                }
            });
        }
    }
}
