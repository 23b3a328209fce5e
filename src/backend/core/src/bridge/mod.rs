//! Ingestion bridge: broker events in, durable jobs out.
//!
//! Messages are handled one at a time. A message is committed only after its
//! job has been enqueued, so a crash or queue outage between the two leads to
//! redelivery (and possibly a duplicate job), never to a lost event.

pub mod broker;
pub mod memory;
pub mod redis_stream;

use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::aggregate::EventNames;
use crate::error::{Result, RollupError};
use crate::jobs::{JobId, JobQueue};

pub use broker::{BrokerConsumer, BrokerMessage, BrokerProducer};
pub use memory::{InMemoryBroker, InMemoryConsumer};
pub use redis_stream::{RedisStreamConsumer, RedisStreamProducer};

/// What the bridge did with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Enqueued as a job, then committed
    Enqueued(JobId),
    /// Key matched no configured event; committed without a job
    Ignored,
    /// Value was not JSON; committed without a job
    Malformed,
}

/// Counters for a running bridge.
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    pub received: Arc<AtomicU64>,
    pub enqueued: Arc<AtomicU64>,
    pub ignored: Arc<AtomicU64>,
    pub malformed: Arc<AtomicU64>,
    pub errors: Arc<AtomicU64>,
}

impl BridgeStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Moves events from a broker consumer onto the job queue.
pub struct IngestionBridge<C> {
    consumer: C,
    queue: Arc<JobQueue>,
    names: EventNames,
    reconnect_backoff: Duration,
    stats: BridgeStats,
}

impl<C: BrokerConsumer> IngestionBridge<C> {
    pub fn new(consumer: C, queue: Arc<JobQueue>, names: EventNames) -> Self {
        Self {
            consumer,
            queue,
            names,
            reconnect_backoff: Duration::from_secs(2),
            stats: BridgeStats::default(),
        }
    }

    /// Pause after a broker or queue error before reading again.
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats.clone()
    }

    /// Give the consumer back, e.g. to simulate a restart.
    pub fn into_consumer(self) -> C {
        self.consumer
    }

    /// Handle one message: enqueue if its key is known, then commit.
    ///
    /// On error nothing is committed.
    pub async fn handle(&mut self, message: &BrokerMessage) -> Result<MessageOutcome> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let known = message
            .key
            .as_deref()
            .filter(|key| self.names.kind_of(key).is_some());

        let outcome = match known {
            None => {
                tracing::debug!(message_id = %message.id, key = ?message.key, "Ignoring message with unknown key");
                self.consumer.commit(message).await?;
                self.stats.ignored.fetch_add(1, Ordering::Relaxed);
                MessageOutcome::Ignored
            }
            Some(key) => match serde_json::from_slice::<serde_json::Value>(&message.value) {
                Err(e) => {
                    let error = RollupError::malformed_message(&message.id, e).with_context("key", key);
                    tracing::warn!(message_id = %message.id, key, error = %error, "Skipping message that is not JSON");
                    self.consumer.commit(message).await?;
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    MessageOutcome::Malformed
                }
                Ok(payload) => {
                    let job_id = self.queue.enqueue(key, payload).await?;
                    self.consumer.commit(message).await?;
                    self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(message_id = %message.id, key, job_id = %job_id, "Event enqueued");
                    MessageOutcome::Enqueued(job_id)
                }
            },
        };

        let label = match outcome {
            MessageOutcome::Enqueued(_) => "enqueued",
            MessageOutcome::Ignored => "ignored",
            MessageOutcome::Malformed => "malformed",
        };
        counter!("rollup_bridge_messages_total", "outcome" => label).increment(1);
        Ok(outcome)
    }

    /// Poll once and handle the message, if any.
    pub async fn step(&mut self) -> Result<Option<MessageOutcome>> {
        match self.consumer.poll().await? {
            Some(message) => self.handle(&message).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Errors never stop the loop: the bridge waits `reconnect_backoff`,
    /// rewinds to the last committed message and carries on.
    pub async fn run(mut self, shutdown: CancellationToken) -> BridgeStats {
        tracing::info!(queue = %self.queue.name(), "Ingestion bridge started");

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.consumer.poll() => polled,
            };

            let result = match polled {
                Ok(Some(message)) => self.handle(&message).await.map(|_| ()),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                counter!("rollup_bridge_errors_total", "code" => e.code().to_string()).increment(1);
                tracing::warn!(
                    error = %e,
                    backoff_ms = self.reconnect_backoff.as_millis() as u64,
                    "Bridge error, resuming from last committed message"
                );

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.reconnect_backoff) => {}
                }
                if let Err(e) = self.consumer.rewind().await {
                    tracing::warn!(error = %e, "Rewinding consumer failed");
                }
            }
        }

        tracing::info!(
            received = self.stats.received(),
            enqueued = self.stats.enqueued(),
            "Ingestion bridge stopped"
        );
        self.stats
    }
}
