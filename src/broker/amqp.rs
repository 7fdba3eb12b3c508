//! RabbitMQ backend
//!
//! One `AmqpConnection` per process owns the connection and a single shared
//! channel. Publishers and subscribers borrow clones of that channel; only
//! `AmqpConnection::close` closes it.
//!
//! Topology is declared once at startup: durable direct exchanges, durable
//! queues and their bindings. Messages are published persistent.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde_json::{Number, Value};
use tracing::{debug, info, trace};

use super::{Acker, Delivery, DeliveryStream, Destination, Publish, Subscribe};
use crate::config::QueueSettings;
use crate::envelope::{Envelope, Headers};
use crate::utils::error::{Error, Result};

const PERSISTENT: u8 = 2;

pub struct AmqpConnection {
    connection: Connection,
    channel: Channel,
}

impl AmqpConnection {
    /// Connects and opens the shared channel.
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| Error::Transport(format!("failed to connect to RabbitMQ: {e}")))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(0, "channel failed").await;
                return Err(Error::Transport(format!("failed to open channel: {e}")));
            }
        };

        info!("Successfully connected to RabbitMQ");
        Ok(Self {
            connection,
            channel,
        })
    }

    /// Declares the durable queue of `settings` and, when an exchange is
    /// named, the durable direct exchange and the binding.
    pub async fn declare(&self, settings: &QueueSettings) -> Result<()> {
        self.channel
            .queue_declare(
                &settings.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        if !settings.exchange.is_empty() {
            self.channel
                .exchange_declare(
                    &settings.exchange,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;

            self.channel
                .queue_bind(
                    &settings.queue,
                    &settings.exchange,
                    &settings.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        debug!(
            queue = %settings.queue,
            exchange = %settings.exchange,
            routing_key = %settings.routing_key,
            "Declared queue"
        );
        Ok(())
    }

    pub fn publisher(&self, destination: Destination) -> AmqpPublisher {
        AmqpPublisher {
            channel: self.channel.clone(),
            destination,
        }
    }

    pub fn subscriber(&self, queue: impl Into<String>) -> AmqpSubscriber {
        AmqpSubscriber {
            channel: self.channel.clone(),
            queue: queue.into(),
        }
    }

    pub async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "shutdown").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(200, "shutdown").await?;
        }
        info!("RabbitMQ connection closed");
        Ok(())
    }
}

#[derive(Clone)]
pub struct AmqpPublisher {
    channel: Channel,
    destination: Destination,
}

#[async_trait]
impl Publish for AmqpPublisher {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn publish(&self, envelope: &Envelope) -> Result<()> {
        let payload = envelope.encode()?;

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(envelope.content_type.clone()))
            .with_content_encoding(ShortString::from(envelope.content_encoding.clone()))
            .with_delivery_mode(PERSISTENT)
            .with_timestamp(chrono::Utc::now().timestamp().max(0) as u64)
            .with_headers(to_field_table(&envelope.headers));
        if let Some(id) = envelope.correlation_id() {
            properties = properties.with_correlation_id(ShortString::from(id.to_string()));
        }

        trace!(
            "Publishing {} bytes to {}",
            payload.len(),
            self.destination
        );

        // The returned confirm is not awaited: the channel is not in confirm mode.
        self.channel
            .basic_publish(
                &self.destination.exchange,
                &self.destination.routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?;

        Ok(())
    }
}

#[derive(Clone)]
pub struct AmqpSubscriber {
    channel: Channel,
    queue: String,
}

#[async_trait]
impl Subscribe for AmqpSubscriber {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn start_consuming(&self) -> Result<DeliveryStream> {
        let tag = format!("mqbridge-{}", uuid::Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(queue = %self.queue, consumer_tag = %tag, "Consumer registered");

        Ok(consumer
            .map(|item| item.map(into_delivery).map_err(Error::from))
            .boxed())
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    Delivery::new(
        delivery.data,
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        AmqpAcker(delivery.acker),
    )
    .with_correlation_id(correlation_id)
    .with_headers(headers)
    .with_redelivered(delivery.redelivered)
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.clone()), to_amqp_value(value));
    }
    table
}

fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(to_amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => AMQPValue::FieldTable(to_field_table(map)),
    }
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), from_amqp_value(value)))
        .collect()
}

fn from_amqp_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => Number::from_f64(f64::from(*f)).map_or(Value::Null, Value::Number),
        AMQPValue::Double(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(from_field_table(table)),
        AMQPValue::Void => Value::Null,
        other => Value::String(format!("{other:?}")),
    }
}
