//! Redis Streams broker.
//!
//! A consumer group on one stream. Each entry carries a `key` field (the event
//! name) and a `value` field (the JSON payload). Committing is `XACK`; entries
//! delivered but not acknowledged stay in the consumer's pending list and are
//! read again, starting from ID `0`, after a restart or rewind.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::VecDeque;
use std::time::Duration;

use super::broker::{BrokerConsumer, BrokerMessage, BrokerProducer};
use crate::config::BrokerConfig;
use crate::error::{ErrorCode, Result, RollupError};

const BATCH_SIZE: usize = 64;

fn broker_error(message: &'static str, e: redis::RedisError) -> RollupError {
    let code = if e.is_connection_dropped() || e.is_connection_refusal() {
        ErrorCode::BrokerConnectionFailed
    } else {
        ErrorCode::BrokerError
    };
    RollupError::with_internal(code, message, e.to_string())
}

fn to_message(entry: &StreamId) -> BrokerMessage {
    BrokerMessage {
        id: entry.id.clone(),
        key: entry.get::<String>("key"),
        value: entry.get::<Vec<u8>>("value").unwrap_or_default(),
    }
}

/// Reads where the consumer currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadPosition {
    /// Re-reading this consumer's unacknowledged entries after the given ID
    Pending(String),
    /// Reading entries never delivered to the group
    New,
}

/// Consumer-group reader for one stream.
pub struct RedisStreamConsumer {
    conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    block: Duration,
    position: ReadPosition,
    buffer: VecDeque<BrokerMessage>,
}

impl RedisStreamConsumer {
    /// Join (creating if needed) the consumer group and start from the pending entries.
    ///
    /// The connection should be dedicated: blocking reads hold it for up to `block_ms`.
    pub async fn connect(conn: ConnectionManager, config: &BrokerConfig) -> Result<Self> {
        let mut consumer = Self {
            conn,
            stream: config.topic.clone(),
            group: config.group.clone(),
            consumer: config.consumer.clone(),
            block: Duration::from_millis(config.block_ms),
            position: ReadPosition::Pending("0".to_string()),
            buffer: VecDeque::new(),
        };
        consumer.ensure_group().await?;

        tracing::info!(
            stream = %consumer.stream,
            group = %consumer.group,
            consumer = %consumer.consumer,
            "Joined stream consumer group"
        );
        Ok(consumer)
    }

    async fn ensure_group(&mut self) -> Result<()> {
        let created: redis::RedisResult<()> = self
            .conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(broker_error("Failed to create consumer group", e)),
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let (id, options) = match &self.position {
            ReadPosition::Pending(after) => (
                after.clone(),
                StreamReadOptions::default()
                    .group(&self.group, &self.consumer)
                    .count(BATCH_SIZE),
            ),
            ReadPosition::New => (
                ">".to_string(),
                StreamReadOptions::default()
                    .group(&self.group, &self.consumer)
                    .count(BATCH_SIZE)
                    .block(self.block.as_millis() as usize),
            ),
        };

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream], &[&id], &options)
            .await
            .map_err(|e| broker_error("Failed to read from stream", e))?;

        let entries: Vec<BrokerMessage> = reply
            .map(|r| r.keys.iter().flat_map(|k| k.ids.iter().map(to_message)).collect())
            .unwrap_or_default();

        if let ReadPosition::Pending(_) = self.position {
            match entries.last() {
                Some(last) => self.position = ReadPosition::Pending(last.id.clone()),
                None => {
                    tracing::debug!(stream = %self.stream, "Pending entries drained, reading new entries");
                    self.position = ReadPosition::New;
                }
            }
        }

        self.buffer.extend(entries);
        Ok(())
    }
}

#[async_trait]
impl BrokerConsumer for RedisStreamConsumer {
    async fn poll(&mut self) -> Result<Option<BrokerMessage>> {
        if self.buffer.is_empty() {
            let was_pending = matches!(self.position, ReadPosition::Pending(_));
            self.fill().await?;
            // An empty pending read only switches position; read new entries right away.
            if was_pending && self.buffer.is_empty() && self.position == ReadPosition::New {
                self.fill().await?;
            }
        }
        Ok(self.buffer.pop_front())
    }

    async fn commit(&mut self, message: &BrokerMessage) -> Result<()> {
        let _: i64 = self
            .conn
            .xack(&self.stream, &self.group, &[&message.id])
            .await
            .map_err(|e| broker_error("Failed to acknowledge stream entry", e))?;
        Ok(())
    }

    async fn rewind(&mut self) -> Result<()> {
        self.buffer.clear();
        self.position = ReadPosition::Pending("0".to_string());
        Ok(())
    }
}

/// Appends events to a stream.
#[derive(Clone)]
pub struct RedisStreamProducer {
    conn: ConnectionManager,
    stream: String,
}

impl RedisStreamProducer {
    pub fn new(conn: ConnectionManager, stream: impl Into<String>) -> Self {
        Self {
            conn,
            stream: stream.into(),
        }
    }
}

#[async_trait]
impl BrokerProducer for RedisStreamProducer {
    async fn publish(&self, key: &str, value: &[u8]) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(&self.stream, "*", &[("key", key.as_bytes()), ("value", value)])
            .await
            .map_err(|e| broker_error("Failed to publish to stream", e))?;

        tracing::debug!(stream = %self.stream, key, id = %id, "Published event");
        Ok(id)
    }
}
