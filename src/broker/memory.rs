//! In-process broker built on `tokio::sync::broadcast`.
//!
//! Used for single-node deployments and tests. Publishing to a channel with
//! no subscribers drops the message, matching Redis semantics.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::{Broker, BrokerSubscription};
use crate::error::Result;

const DEFAULT_CAPACITY: usize = 1024;

pub struct MemoryBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` is the number of messages a slow subscriber may fall
    /// behind before it starts losing the oldest ones.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels()
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<String>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut channels = self.channels();
        if let Some(tx) = channels.get(channel) {
            if tx.receiver_count() == 0 {
                channels.remove(channel);
            } else {
                // Only fails when every receiver is gone.
                let _ = tx.send(payload.to_string());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BrokerSubscription>> {
        let mut channels = self.channels();
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(Box::new(MemorySubscription {
            channel: channel.to_string(),
            rx: Some(tx.subscribe()),
        }))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemorySubscription {
    channel: String,
    rx: Option<broadcast::Receiver<String>>,
}

#[async_trait]
impl BrokerSubscription for MemorySubscription {
    async fn next_message(&mut self) -> Option<String> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "subscriber lagged, messages dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.rx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("project:P1:events").await.unwrap();

        for i in 0..5 {
            broker
                .publish("project:P1:events", &format!("m{i}"))
                .await
                .unwrap();
        }

        for i in 0..5 {
            assert_eq!(sub.next_message().await.unwrap(), format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let broker = MemoryBroker::new();
        broker.publish("project:nobody:events", "x").await.unwrap();
        assert_eq!(broker.subscriber_count("project:nobody:events"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_releases_the_channel() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("c").await.unwrap();
        assert_eq!(broker.subscriber_count("c"), 1);
        sub.unsubscribe().await.unwrap();
        assert_eq!(broker.subscriber_count("c"), 0);
        assert!(sub.next_message().await.is_none());
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("a").await.unwrap();
        broker.publish("b", "for-b").await.unwrap();
        broker.publish("a", "for-a").await.unwrap();
        assert_eq!(a.next_message().await.unwrap(), "for-a");
    }
}
