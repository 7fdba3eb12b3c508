//! Responder side of the bridge.
//!
//! Consumes request envelopes, computes an answer and publishes a reply that
//! carries the request's correlation id back to the bridge.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Delivery, DeliveryStream, Publish, Subscribe};
use crate::envelope::{DecodedMessage, Envelope, header};
use crate::external::ExternalService;
use crate::utils::error::Result;

pub const SOURCE: &str = "relay";

pub struct Relay {
    replies: Arc<dyn Publish>,
    external: Option<Arc<dyn ExternalService>>,
    external_routing_key: Option<String>,
}

impl Relay {
    /// A relay that echoes every request body back.
    pub fn new(replies: Arc<dyn Publish>) -> Self {
        Self {
            replies,
            external: None,
            external_routing_key: None,
        }
    }

    /// Answers requests through `service`. With a `routing_key`, only requests
    /// delivered under that key are; the rest are echoed.
    pub fn with_external(mut self, service: Arc<dyn ExternalService>, routing_key: Option<String>) -> Self {
        self.external = Some(service);
        self.external_routing_key = routing_key;
        self
    }

    /// Registers the request consumer and spawns the relay loop.
    pub async fn start(self, subscriber: &dyn Subscribe, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let stream = subscriber.start_consuming().await?;
        info!(
            queue = %subscriber.queue(),
            reply_to = %self.replies.destination(),
            external = self.external.is_some(),
            "Relay started"
        );
        Ok(tokio::spawn(self.run(stream, shutdown)))
    }

    async fn run(self, mut stream: DeliveryStream, shutdown: CancellationToken) {
        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Relay shutting down");
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        error!("Request stream error: {e}");
                        continue;
                    }
                    None => {
                        warn!("Request stream ended");
                        break;
                    }
                },
            };

            self.handle(delivery).await;
            tokio::task::yield_now().await;
        }
    }

    fn calls_external(&self, routing_key: &str) -> bool {
        match (&self.external, &self.external_routing_key) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(_), Some(key)) => key == routing_key,
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let request = match delivery.decode() {
            Ok(request) => request,
            Err(e) => {
                warn!(routing_key = %delivery.routing_key, "Rejecting undecodable request: {e}");
                if let Err(e) = delivery.nack(false).await {
                    error!("Failed to reject request: {e}");
                }
                return;
            }
        };

        let correlation_id = request
            .correlation_id()
            .map(str::to_string)
            .or_else(|| delivery.correlation_id.clone());
        debug!(correlation_id = ?correlation_id, routing_key = %delivery.routing_key, "Handling request");

        let answer = match self.answer(&request, &delivery.routing_key).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(correlation_id = ?correlation_id, "External call failed, requeueing: {e}");
                if let Err(e) = delivery.nack(true).await {
                    error!("Failed to requeue request: {e}");
                }
                return;
            }
        };

        let mut reply = Envelope::new(answer)
            .with_header(header::SOURCE, SOURCE)
            .with_header(header::TIMESTAMP, chrono::Utc::now().to_rfc3339())
            .with_header(header::MESSAGE_TYPE, "json");
        match &correlation_id {
            Some(id) => reply = reply.with_header(header::CORRELATION_ID, id.as_str()),
            None => warn!("Request carries no correlation id, reply cannot be matched"),
        }

        if let Err(e) = self.replies.publish(&reply).await {
            error!(correlation_id = ?correlation_id, "Failed to publish reply, requeueing: {e}");
            if let Err(e) = delivery.nack(true).await {
                error!("Failed to requeue request: {e}");
            }
            return;
        }

        if let Err(e) = delivery.ack().await {
            error!(correlation_id = ?correlation_id, "Failed to acknowledge request: {e}");
        }
    }

    async fn answer(&self, request: &DecodedMessage, routing_key: &str) -> Result<Vec<u8>> {
        match &self.external {
            Some(service) if self.calls_external(routing_key) => service
                .call(&request.body, &request.body)
                .await
                .map(String::into_bytes),
            _ => Ok(request.payload.clone()),
        }
    }
}
