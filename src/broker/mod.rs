//! Channel-based publish/subscribe broker.
//!
//! The relay only needs two operations from a broker: publish a payload on a
//! named channel, and consume a channel's messages in publish order. Three
//! backends implement that contract and are picked by the `BROKER_URL`
//! scheme: an in-process broadcast bus, Redis PUBLISH/SUBSCRIBE, and
//! Postgres LISTEN/NOTIFY.

pub mod memory;
pub mod pg_notify;
pub mod redis_pubsub;

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{Error, Result};
use crate::event::Envelope;
use crate::model::ProjectId;
use crate::telemetry::metrics;

pub use memory::MemoryBroker;
pub use pg_notify::PgBroker;
pub use redis_pubsub::RedisBroker;

/// Name of the channel carrying system-wide events.
pub const GLOBAL_CHANNEL: &str = "websocket:broadcast";

/// A publish/subscribe backend.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish one payload. Delivery to zero subscribers is not an error.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Open a subscription to one channel.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BrokerSubscription>>;

    /// Short backend name for logs and metrics.
    fn backend(&self) -> &'static str;
}

/// A live subscription to a single channel.
#[async_trait]
pub trait BrokerSubscription: Send {
    /// Next message in publish order. `None` means the subscription's
    /// connection was lost and the caller should subscribe again.
    async fn next_message(&mut self) -> Option<String>;

    /// Tell the broker to stop delivering this channel.
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Open the backend named by `url`.
pub async fn connect(url: &SecretString) -> Result<Arc<dyn Broker>> {
    let raw = url.expose_secret();
    let scheme = raw.split_once("://").map(|(scheme, _)| scheme).unwrap_or("");
    match scheme {
        "memory" => Ok(Arc::new(MemoryBroker::new())),
        "redis" | "rediss" => Ok(Arc::new(RedisBroker::open(raw)?)),
        "postgres" | "postgresql" => Ok(Arc::new(PgBroker::connect(raw).await?)),
        other => Err(Error::Config(format!(
            "unsupported broker scheme {other:?} (expected memory, redis or postgres)"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Channel names
// ---------------------------------------------------------------------------

/// A broker channel the relay knows how to route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelName {
    /// `project:{projectId}:events`
    Project(ProjectId),
    /// `websocket:broadcast`
    Global,
}

impl ChannelName {
    pub fn project(project_id: &ProjectId) -> Self {
        ChannelName::Project(project_id.clone())
    }

    /// The channel an envelope belongs on: its project, or global.
    pub fn for_envelope(envelope: &Envelope) -> Self {
        match &envelope.project_id {
            Some(project_id) => ChannelName::project(project_id),
            None => ChannelName::Global,
        }
    }

    /// `"project"` or `"global"`, for metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelName::Project(_) => "project",
            ChannelName::Global => "global",
        }
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelName::Project(id) => write!(f, "project:{id}:events"),
            ChannelName::Global => f.write_str(GLOBAL_CHANNEL),
        }
    }
}

impl std::str::FromStr for ChannelName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == GLOBAL_CHANNEL {
            return Ok(ChannelName::Global);
        }
        s.strip_prefix("project:")
            .and_then(|rest| rest.strip_suffix(":events"))
            .ok_or_else(|| Error::Broker(format!("unrecognized channel name: {s}")))
            .and_then(ProjectId::new)
            .map(ChannelName::Project)
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Serializes envelopes and publishes them on the channel they belong to.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Publish on the envelope's project channel, or the global channel when
    /// it has no project.
    pub async fn publish(&self, envelope: &Envelope) -> Result<()> {
        self.publish_to(&ChannelName::for_envelope(envelope), envelope)
            .await
    }

    pub async fn publish_to(&self, channel: &ChannelName, envelope: &Envelope) -> Result<()> {
        let payload = envelope.to_json()?;
        let result = self.broker.publish(&channel.to_string(), &payload).await;
        metrics::broker_messages().add(
            1,
            &[
                KeyValue::new("direction", "publish"),
                KeyValue::new("channel_kind", channel.kind()),
                KeyValue::new("result", if result.is_ok() { "ok" } else { "error" }),
            ],
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_round_trip() {
        let project = ChannelName::project(&ProjectId::new("P1").unwrap());
        assert_eq!(project.to_string(), "project:P1:events");
        assert_eq!("project:P1:events".parse::<ChannelName>().unwrap(), project);
        assert_eq!(
            "websocket:broadcast".parse::<ChannelName>().unwrap(),
            ChannelName::Global
        );
    }

    #[test]
    fn malformed_channel_names_are_rejected() {
        assert!("project:P1".parse::<ChannelName>().is_err());
        assert!("project::events".parse::<ChannelName>().is_err());
        assert!("other:P1:events".parse::<ChannelName>().is_err());
    }

    #[tokio::test]
    async fn unknown_scheme_is_a_config_error() {
        let url = SecretString::from("amqp://localhost");
        assert!(matches!(connect(&url).await, Err(Error::Config(_))));
    }
}
