//! Publish command.
//!
//! Appends one review event to the broker stream under the configured event name.

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};

use rollup_core::aggregate::{DomainEvent, EntityId, EventKind, EventNames};
use rollup_core::bridge::BrokerProducer;

use crate::client::Backends;
use crate::output::{self, OutputFormat};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Kind {
    Added,
    Updated,
    Removed,
}

impl From<Kind> for EventKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Added => EventKind::Added,
            Kind::Updated => EventKind::Updated,
            Kind::Removed => EventKind::Removed,
        }
    }
}

#[derive(Args)]
pub struct PublishArgs {
    /// Event kind
    kind: Kind,

    /// Entity ID (e.g. product ID)
    entity: EntityId,

    /// Observed value (e.g. rating)
    value: f64,

    /// Value being replaced; required for `updated`
    #[arg(short, long)]
    previous: Option<f64>,
}

pub async fn execute(args: PublishArgs, backends: &Backends, format: OutputFormat) -> Result<()> {
    let event = match (args.kind, args.previous) {
        (Kind::Updated, Some(previous)) => DomainEvent::updated(args.entity, previous, args.value),
        (Kind::Updated, None) => anyhow::bail!("--previous is required for updated events"),
        (Kind::Added, _) => DomainEvent::added(args.entity, args.value),
        (Kind::Removed, _) => DomainEvent::removed(args.entity, args.value),
    };
    event.change().context("Refusing to publish an invalid event")?;

    let names = EventNames::from(&backends.config().broker.events);
    let key = names.name_of(EventKind::from(args.kind));
    let payload = serde_json::to_vec(&event.to_payload())?;

    let producer = backends.producer().await?;
    let id = producer.publish(key, &payload).await?;

    match format {
        OutputFormat::Table => output::print_success(&format!(
            "Published {} for entity {} to {} ({})",
            key,
            event.entity_id,
            backends.config().broker.topic,
            id
        )),
        _ => output::print_item(
            &serde_json::json!({
                "id": id,
                "topic": backends.config().broker.topic,
                "key": key,
                "payload": event.to_payload(),
            }),
            format,
        ),
    }

    Ok(())
}
