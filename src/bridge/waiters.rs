use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::envelope::DecodedMessage;
use crate::utils::error::{Error, Result};

pub(crate) type ReplyReceiver = oneshot::Receiver<Result<DecodedMessage>>;

/// RAII guard that removes the registered waiter on drop, so a cancelled
/// `send` (client disconnect, task abort, timeout) never leaves a stale entry.
pub(crate) struct WaiterGuard<'a> {
    waiters: &'a ReplyWaiters,
    correlation_id: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.remove(&self.correlation_id);
    }
}

#[derive(Default)]
struct Table {
    senders: HashMap<String, oneshot::Sender<Result<DecodedMessage>>>,
    closed: bool,
}

/// Correlation id → one-shot reply slot for every in-flight `send`.
#[derive(Default)]
pub(crate) struct ReplyWaiters {
    table: Mutex<Table>,
}

impl ReplyWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, correlation_id: &str) -> Result<(ReplyReceiver, WaiterGuard<'_>)> {
        let mut table = self.table.lock().unwrap();
        if table.closed {
            return Err(Error::Closed);
        }
        if table.senders.contains_key(correlation_id) {
            return Err(Error::DuplicateCorrelation(correlation_id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        table.senders.insert(correlation_id.to_string(), tx);
        Ok((
            rx,
            WaiterGuard {
                waiters: self,
                correlation_id: correlation_id.to_string(),
            },
        ))
    }

    /// Hands `reply` to the waiter for `correlation_id`. Returns false when
    /// nobody is waiting for it anymore.
    pub fn resolve(&self, correlation_id: &str, reply: Result<DecodedMessage>) -> bool {
        let sender = self.table.lock().unwrap().senders.remove(correlation_id);
        match sender {
            Some(sender) => sender.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, correlation_id: &str) {
        self.table.lock().unwrap().senders.remove(correlation_id);
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().senders.len()
    }

    /// Fails every waiter with `Error::Closed` and refuses new registrations.
    pub fn close(&self) {
        let senders = {
            let mut table = self.table.lock().unwrap();
            table.closed = true;
            std::mem::take(&mut table.senders)
        };
        for (_, sender) in senders {
            let _ = sender.send(Err(Error::Closed));
        }
    }
}
