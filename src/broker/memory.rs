//! In-memory broker
//!
//! Mirrors the AMQP semantics the bridge depends on:
//! - the default exchange routes to the queue named by the routing key
//! - named exchanges route to every queue bound with that routing key
//! - unroutable messages are dropped
//! - competing consumers on a queue each receive a message exactly once
//! - a delivery stays unacked until acked, nacked or requeued
//! - a requeued message goes to the back of its queue
//!
//! It also exposes counters (ready, unacked, rejected) and publish failure
//! injection so tests can observe acknowledgement discipline.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::{Acker, Delivery, DeliveryStream, Destination, Publish, Subscribe};
use crate::config::QueueSettings;
use crate::envelope::{Envelope, Headers};
use crate::utils::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredMessage {
    data: Vec<u8>,
    exchange: String,
    routing_key: String,
    correlation_id: Option<String>,
    headers: Headers,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueContents {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    rejected: Vec<StoredMessage>,
    consumers: usize,
    closed: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    contents: Mutex<QueueContents>,
    notify: Notify,
    next_tag: AtomicU64,
}

impl QueueState {
    fn push(&self, msg: StoredMessage) {
        self.contents.lock().unwrap().ready.push_back(msg);
        self.notify.notify_one();
    }

    /// Waits for the next ready message and moves it to the unacked set.
    /// Returns `None` once the broker is closed.
    async fn next(self: &Arc<Self>) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut contents = self.contents.lock().unwrap();
                if contents.closed {
                    return None;
                }
                if let Some(msg) = contents.ready.pop_front() {
                    let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
                    contents.unacked.insert(tag, msg.clone());
                    let acker = MemoryAcker {
                        queue: Arc::clone(self),
                        tag,
                    };
                    return Some(
                        Delivery::new(msg.data, msg.exchange, msg.routing_key, acker)
                            .with_correlation_id(msg.correlation_id)
                            .with_headers(msg.headers)
                            .with_redelivered(msg.redelivered),
                    );
                }
            }

            notified.await;
        }
    }
}

struct MemoryAcker {
    queue: Arc<QueueState>,
    tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut contents = self.queue.contents.lock().unwrap();
        contents
            .unacked
            .remove(&self.tag)
            .map(|_| ())
            .ok_or_else(|| Error::Transport(format!("unknown delivery tag {}", self.tag)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let mut contents = self.queue.contents.lock().unwrap();
        let mut msg = contents
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| Error::Transport(format!("unknown delivery tag {}", self.tag)))?;

        if requeue {
            msg.redelivered = true;
            contents.ready.push_back(msg);
            drop(contents);
            self.queue.notify.notify_one();
        } else {
            contents.rejected.push(msg);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Inner {
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    bindings: Mutex<HashMap<(String, String), Vec<String>>>,
    fail_publish: AtomicBool,
}

/// Cheaply cloneable handle to one in-process broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a queue. Declaring an existing queue is a no-op.
    pub fn declare_queue(&self, name: &str) {
        self.queue_state(name);
    }

    /// Binds `queue` to `exchange` under `routing_key`, declaring the queue.
    pub fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) {
        self.declare_queue(queue);
        let mut bindings = self.inner.bindings.lock().unwrap();
        let bound = bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
    }

    /// Declares the queue of `settings` and its binding, like the AMQP backend does.
    pub fn declare(&self, settings: &QueueSettings) {
        if settings.exchange.is_empty() {
            self.declare_queue(&settings.queue);
        } else {
            self.bind_queue(&settings.queue, &settings.exchange, &settings.routing_key);
        }
    }

    pub fn publisher(&self, destination: Destination) -> InMemoryPublisher {
        InMemoryPublisher {
            broker: self.clone(),
            destination,
        }
    }

    pub fn subscriber(&self, queue: impl Into<String>) -> InMemorySubscriber {
        InMemorySubscriber {
            broker: self.clone(),
            queue: queue.into(),
        }
    }

    /// Makes every subsequent publish fail with a transport error.
    pub fn set_publish_failure(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Routes raw bytes, bypassing the envelope codec.
    pub fn publish_raw(
        &self,
        destination: &Destination,
        data: Vec<u8>,
        correlation_id: Option<String>,
    ) -> Result<()> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::Transport("broker unavailable".to_string()));
        }

        let msg = StoredMessage {
            data,
            exchange: destination.exchange.clone(),
            routing_key: destination.routing_key.clone(),
            correlation_id,
            headers: Headers::new(),
            redelivered: false,
        };

        let targets = self.route(destination);
        if targets.is_empty() {
            debug!("No queue bound for {destination}, message dropped");
        }
        for queue in targets {
            trace!("Routing message to queue {}", queue);
            self.queue_state(&queue).push(msg.clone());
        }
        Ok(())
    }

    /// Ends every consumer stream.
    pub fn close(&self) {
        for state in self.inner.queues.lock().unwrap().values() {
            state.contents.lock().unwrap().closed = true;
            state.notify.notify_waiters();
        }
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.with_contents(queue, |c| c.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.with_contents(queue, |c| c.unacked.len())
    }

    pub fn rejected_count(&self, queue: &str) -> usize {
        self.with_contents(queue, |c| c.rejected.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.with_contents(queue, |c| c.consumers)
    }

    fn with_contents<T: Default>(&self, queue: &str, f: impl FnOnce(&QueueContents) -> T) -> T {
        let queues = self.inner.queues.lock().unwrap();
        queues
            .get(queue)
            .map(|state| f(&state.contents.lock().unwrap()))
            .unwrap_or_default()
    }

    fn route(&self, destination: &Destination) -> Vec<String> {
        if destination.exchange.is_empty() {
            let queues = self.inner.queues.lock().unwrap();
            return queues
                .contains_key(&destination.routing_key)
                .then(|| vec![destination.routing_key.clone()])
                .unwrap_or_default();
        }

        self.inner
            .bindings
            .lock()
            .unwrap()
            .get(&(destination.exchange.clone(), destination.routing_key.clone()))
            .cloned()
            .unwrap_or_default()
    }

    fn queue_state(&self, name: &str) -> Arc<QueueState> {
        let mut queues = self.inner.queues.lock().unwrap();
        Arc::clone(queues.entry(name.to_string()).or_default())
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryPublisher {
    broker: InMemoryBroker,
    destination: Destination,
}

#[async_trait]
impl Publish for InMemoryPublisher {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn publish(&self, envelope: &Envelope) -> Result<()> {
        let data = envelope.encode()?;
        self.broker.publish_raw(
            &self.destination,
            data,
            envelope.correlation_id().map(str::to_string),
        )
    }
}

#[derive(Debug, Clone)]
pub struct InMemorySubscriber {
    broker: InMemoryBroker,
    queue: String,
}

/// Decrements the queue's consumer count when the stream is dropped.
struct ConsumerGuard {
    state: Arc<QueueState>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let mut contents = self.state.contents.lock().unwrap();
        contents.consumers = contents.consumers.saturating_sub(1);
    }
}

#[async_trait]
impl Subscribe for InMemorySubscriber {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn start_consuming(&self) -> Result<DeliveryStream> {
        let state = {
            let queues = self.broker.inner.queues.lock().unwrap();
            queues
                .get(&self.queue)
                .cloned()
                .ok_or_else(|| Error::Transport(format!("queue '{}' not declared", self.queue)))?
        };

        {
            let mut contents = state.contents.lock().unwrap();
            if contents.closed {
                return Err(Error::Transport("broker closed".to_string()));
            }
            contents.consumers += 1;
        }

        let guard = ConsumerGuard {
            state: Arc::clone(&state),
        };
        let stream = futures::stream::unfold(guard, |guard| async move {
            let delivery = guard.state.next().await?;
            Some((Ok(delivery), guard))
        });

        Ok(stream.boxed())
    }
}
