//! In-process broker for tests and development.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::broker::{BrokerConsumer, BrokerMessage, BrokerProducer};
use crate::error::{ErrorCode, Result, RollupError};

#[derive(Default)]
struct Log {
    messages: Vec<BrokerMessage>,
    committed: HashSet<String>,
}

#[derive(Default)]
struct Shared {
    log: Mutex<Log>,
    notify: Notify,
    unavailable: AtomicBool,
}

/// An append-only topic with a single consumer group.
///
/// Cloning shares the topic. Every [`consumer`](Self::consumer) starts from the
/// beginning and skips committed messages, so dropping a consumer and creating
/// a new one behaves like a process restart.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message; `None` publishes one without a key.
    pub fn send(&self, key: Option<&str>, value: impl Into<Vec<u8>>) -> String {
        let id = {
            let mut log = self.shared.log.lock();
            let id = format!("{}-0", log.messages.len());
            log.messages.push(BrokerMessage::new(id.clone(), key, value));
            id
        };
        self.shared.notify.notify_waiters();
        id
    }

    /// A consumer positioned at the first uncommitted message.
    pub fn consumer(&self) -> InMemoryConsumer {
        self.consumer_with_poll_timeout(Duration::from_millis(50))
    }

    pub fn consumer_with_poll_timeout(&self, poll_timeout: Duration) -> InMemoryConsumer {
        InMemoryConsumer {
            shared: self.shared.clone(),
            cursor: 0,
            poll_timeout,
        }
    }

    pub fn is_committed(&self, id: &str) -> bool {
        self.shared.log.lock().committed.contains(id)
    }

    pub fn committed_count(&self) -> usize {
        self.shared.log.lock().committed.len()
    }

    pub fn len(&self) -> usize {
        self.shared.log.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulate a lost broker connection: polls and commits fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerProducer for InMemoryBroker {
    async fn publish(&self, key: &str, value: &[u8]) -> Result<String> {
        Ok(self.send(Some(key), value))
    }
}

/// Consumer side of an [`InMemoryBroker`].
pub struct InMemoryConsumer {
    shared: Arc<Shared>,
    cursor: usize,
    poll_timeout: Duration,
}

impl InMemoryConsumer {
    fn check_available(&self) -> Result<()> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(RollupError::new(
                ErrorCode::BrokerConnectionFailed,
                "Broker connection lost",
            ));
        }
        Ok(())
    }

    fn next_uncommitted(&mut self) -> Option<BrokerMessage> {
        let log = self.shared.log.lock();
        while self.cursor < log.messages.len() {
            let message = &log.messages[self.cursor];
            self.cursor += 1;
            if !log.committed.contains(&message.id) {
                return Some(message.clone());
            }
        }
        None
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn poll(&mut self) -> Result<Option<BrokerMessage>> {
        self.check_available()?;
        let shared = self.shared.clone();
        let notified = shared.notify.notified();
        if let Some(message) = self.next_uncommitted() {
            return Ok(Some(message));
        }
        let _ = tokio::time::timeout(self.poll_timeout, notified).await;
        self.check_available()?;
        Ok(self.next_uncommitted())
    }

    async fn commit(&mut self, message: &BrokerMessage) -> Result<()> {
        self.check_available()?;
        self.shared.log.lock().committed.insert(message.id.clone());
        Ok(())
    }

    async fn rewind(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }
}
