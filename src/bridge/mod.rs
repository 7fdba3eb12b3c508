//! Request/reply bridge
//!
//! Turns the asynchronous broker into a request/response call: [`Bridge::send`]
//! publishes a request envelope carrying a fresh correlation id, then waits,
//! bounded by a timeout, for the reply with the same id.
//!
//! A single background consumer task owns the reply stream. It decodes every
//! delivery, settles it and routes the decoded reply through the waiting
//! table to the caller that is waiting for that correlation id. Replies for
//! callers that already gave up are acknowledged and logged as unmatched.

mod waiters;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Delivery, DeliveryStream, Publish, Subscribe};
use crate::config::Settings;
use crate::envelope::{DecodedMessage, Envelope, header};
use crate::external::ExternalService;
use crate::utils::error::{Error, Result};

use waiters::ReplyWaiters;

/// What the reply consumer does with a reply that cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Reject without requeue. When the broker-level correlation id names a
    /// waiting caller, that caller fails with the decode error at once.
    #[default]
    FailFast,
    /// Return the delivery to its queue; callers keep waiting.
    Requeue,
}

/// How an HTTP request body becomes a broker request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestFormat {
    /// The body is published as is.
    #[default]
    Raw,
    /// `{"address": "...", "message": "..."}`: `address` is published and
    /// `message` is kept as the request text for the post-decode action.
    AddressMessage,
}

/// A request ready to be handed to [`Bridge::send`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub payload: Vec<u8>,
    pub request_text: String,
}

#[derive(Deserialize)]
struct AddressMessage {
    address: String,
    message: String,
}

impl RequestFormat {
    pub fn parse(self, body: &[u8]) -> Result<OutboundRequest> {
        if body.is_empty() {
            return Err(Error::InvalidRequest("request body is empty".to_string()));
        }

        match self {
            RequestFormat::Raw => Ok(OutboundRequest {
                payload: body.to_vec(),
                request_text: String::from_utf8_lossy(body).into_owned(),
            }),
            RequestFormat::AddressMessage => {
                let request: AddressMessage = serde_json::from_slice(body)
                    .map_err(|e| Error::InvalidRequest(e.to_string()))?;
                Ok(OutboundRequest {
                    payload: request.address.into_bytes(),
                    request_text: request.message,
                })
            }
        }
    }
}

/// Step applied to a decoded reply before `send` returns.
#[derive(Clone, Default)]
pub enum PostAction {
    #[default]
    None,
    /// Calls the collaborator with the decoded body and the request text.
    CallExternal(Arc<dyn ExternalService>),
    /// Publishes the decoded body onward without waiting for the outcome.
    PublishOnward(Arc<dyn Publish>),
}

impl std::fmt::Debug for PostAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostAction::None => f.write_str("None"),
            PostAction::CallExternal(_) => f.write_str("CallExternal"),
            PostAction::PublishOnward(publisher) => {
                write!(f, "PublishOnward({})", publisher.destination())
            }
        }
    }
}

/// Outcome of a successful [`Bridge::send`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BridgeReply {
    Decoded(DecodedMessage),
    External(String),
    Forwarded { destination: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeOptions {
    pub reply_timeout: Duration,
    pub decode_failure: DecodeFailurePolicy,
    /// Queue name advertised in the `replyTo` header.
    pub reply_to: String,
    /// Value of the `source` header on published requests.
    pub source: String,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(10),
            decode_failure: DecodeFailurePolicy::default(),
            reply_to: "reply_queue".to_string(),
            source: "interceptor".to_string(),
        }
    }
}

impl BridgeOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            reply_timeout: Duration::from_millis(settings.bridge.reply_timeout_ms),
            decode_failure: settings.bridge.decode_failure,
            reply_to: settings.broker.consumer.queue.clone(),
            ..Self::default()
        }
    }
}

pub struct Bridge {
    publisher: Arc<dyn Publish>,
    waiters: Arc<ReplyWaiters>,
    options: BridgeOptions,
    post_action: PostAction,
}

impl Bridge {
    /// Registers the reply consumer and spawns the task that drains it.
    ///
    /// The task runs until `shutdown` is cancelled or the reply stream ends;
    /// callers still waiting at that point fail with [`Error::Closed`].
    pub async fn start(
        publisher: Arc<dyn Publish>,
        subscriber: &dyn Subscribe,
        options: BridgeOptions,
        post_action: PostAction,
        shutdown: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>)> {
        let stream = subscriber.start_consuming().await?;
        let waiters = Arc::new(ReplyWaiters::new());

        info!(
            publish_to = %publisher.destination(),
            reply_queue = %subscriber.queue(),
            timeout = ?options.reply_timeout,
            policy = ?options.decode_failure,
            "Bridge started"
        );

        let handle = tokio::spawn(consume_replies(
            stream,
            Arc::clone(&waiters),
            options.decode_failure,
            shutdown,
        ));

        Ok((
            Self {
                publisher,
                waiters,
                options,
                post_action,
            },
            handle,
        ))
    }

    /// Publishes `payload` and waits for the correlated reply.
    ///
    /// `request_text` is only used by [`PostAction::CallExternal`].
    pub async fn send(&self, payload: impl Into<Vec<u8>>, request_text: &str) -> Result<BridgeReply> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (reply, _guard) = self.waiters.register(&correlation_id)?;

        let envelope = Envelope::new(payload)
            .with_header(header::SOURCE, self.options.source.as_str())
            .with_header(header::TIMESTAMP, chrono::Utc::now().to_rfc3339())
            .with_header(header::MESSAGE_TYPE, "json")
            .with_header(header::CORRELATION_ID, correlation_id.as_str())
            .with_header(header::REPLY_TO, self.options.reply_to.as_str());

        self.publisher
            .publish(&envelope)
            .await
            .map_err(|e| Error::Publish(Box::new(e)))?;
        debug!(correlation_id = %correlation_id, "Request published, awaiting reply");

        let decoded = match tokio::time::timeout(self.options.reply_timeout, reply).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(Error::Closed),
            Err(_) => {
                warn!(correlation_id = %correlation_id, "No reply within {:?}", self.options.reply_timeout);
                return Err(Error::Timeout(self.options.reply_timeout));
            }
        };

        match &self.post_action {
            PostAction::None => Ok(BridgeReply::Decoded(decoded)),
            PostAction::CallExternal(service) => service
                .call(&decoded.body, request_text)
                .await
                .map(BridgeReply::External),
            PostAction::PublishOnward(publisher) => {
                let destination = publisher.destination().to_string();
                forward(Arc::clone(publisher), decoded, self.options.source.clone());
                Ok(BridgeReply::Forwarded { destination })
            }
        }
    }

    /// Number of callers currently waiting for a reply.
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

fn forward(publisher: Arc<dyn Publish>, decoded: DecodedMessage, source: String) {
    let mut envelope = Envelope::new(decoded.payload)
        .with_header(header::SOURCE, source)
        .with_header(header::TIMESTAMP, chrono::Utc::now().to_rfc3339())
        .with_header(header::MESSAGE_TYPE, "json");
    if let Some(id) = decoded.headers.get(header::CORRELATION_ID) {
        envelope = envelope.with_header(header::CORRELATION_ID, id.clone());
    }

    tokio::spawn(async move {
        if let Err(e) = publisher.publish(&envelope).await {
            error!("Failed to forward reply to {}: {e}", publisher.destination());
        }
    });
}

async fn consume_replies(
    mut stream: DeliveryStream,
    waiters: Arc<ReplyWaiters>,
    policy: DecodeFailurePolicy,
    shutdown: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Reply consumer shutting down");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!("Reply stream error: {e}");
                    continue;
                }
                None => {
                    warn!("Reply stream ended");
                    break;
                }
            },
        };

        dispatch_reply(delivery, &waiters, policy).await;

        // A requeued reply can come straight back; let other tasks run.
        tokio::task::yield_now().await;
    }

    waiters.close();
}

async fn dispatch_reply(delivery: Delivery, waiters: &ReplyWaiters, policy: DecodeFailurePolicy) {
    let decoded = match delivery.decode() {
        Ok(decoded) => decoded,
        Err(err) => {
            let correlation_id = delivery.correlation_id.clone();
            warn!(
                correlation_id = ?correlation_id,
                routing_key = %delivery.routing_key,
                "Failed to decode reply: {err}"
            );

            match policy {
                DecodeFailurePolicy::FailFast => {
                    if let Err(e) = delivery.nack(false).await {
                        error!("Failed to reject reply: {e}");
                    }
                    if let Some(id) = correlation_id {
                        waiters.resolve(&id, Err(err));
                    }
                }
                DecodeFailurePolicy::Requeue => {
                    if let Err(e) = delivery.nack(true).await {
                        error!("Failed to requeue reply: {e}");
                    }
                }
            }
            return;
        }
    };

    let correlation_id = decoded
        .correlation_id()
        .map(str::to_string)
        .or_else(|| delivery.correlation_id.clone());

    if let Err(e) = delivery.ack().await {
        error!(correlation_id = ?correlation_id, "Failed to acknowledge reply: {e}");
    }

    match correlation_id {
        Some(id) => {
            if waiters.resolve(&id, Ok(decoded)) {
                debug!(correlation_id = %id, "Reply delivered");
            } else {
                warn!(correlation_id = %id, "Unmatched reply discarded");
            }
        }
        None => warn!("Reply without correlation id discarded"),
    }
}
