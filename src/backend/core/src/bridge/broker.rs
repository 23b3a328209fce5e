//! Broker consumer boundary.

use async_trait::async_trait;

use crate::error::Result;

/// One message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Broker-assigned position, used to commit
    pub id: String,
    /// Event name; absent keys are treated as unknown
    pub key: Option<String>,
    /// Raw message value, expected to be JSON
    pub value: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(id: impl Into<String>, key: Option<&str>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            key: key.map(str::to_string),
            value: value.into(),
        }
    }
}

/// An at-least-once subscription to one topic.
///
/// Messages are delivered in order. Committing a message records that it has
/// been handled; anything not committed is delivered again after a
/// [`rewind`](BrokerConsumer::rewind) or a restart.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Wait for the next message. `None` means nothing arrived before the poll timed out.
    async fn poll(&mut self) -> Result<Option<BrokerMessage>>;

    /// Mark a message as handled.
    async fn commit(&mut self, message: &BrokerMessage) -> Result<()>;

    /// Continue from the last committed position, redelivering everything after it.
    async fn rewind(&mut self) -> Result<()>;
}

/// Publishes events onto a topic.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Publish one message and return its broker id.
    async fn publish(&self, key: &str, value: &[u8]) -> Result<String>;
}

#[async_trait]
impl<T: BrokerConsumer + ?Sized> BrokerConsumer for Box<T> {
    async fn poll(&mut self) -> Result<Option<BrokerMessage>> {
        (**self).poll().await
    }

    async fn commit(&mut self, message: &BrokerMessage) -> Result<()> {
        (**self).commit(message).await
    }

    async fn rewind(&mut self) -> Result<()> {
        (**self).rewind().await
    }
}
