//! Redis PUBLISH/SUBSCRIBE backend.
//!
//! Publishing shares one multiplexed connection. Every subscription gets its
//! own pub/sub connection, so one channel's connection loss never affects
//! another's.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::{MultiplexedConnection, PubSub};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Broker, BrokerSubscription};
use crate::error::Result;

pub struct RedisBroker {
    client: redis::Client,
    publisher: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBroker {
    /// Parse the URL. No connection is made until first use.
    pub fn open(url: &str) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            publisher: Mutex::new(None),
        })
    }

    async fn publish_connection(&self) -> Result<MultiplexedConnection> {
        let mut slot = self.publisher.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.publish_connection().await?;
        let result: redis::RedisResult<i64> = conn.publish(channel, payload).await;
        match result {
            Ok(receivers) => {
                debug!(channel, receivers, "published");
                Ok(())
            }
            Err(e) => {
                // Reconnect on the next publish.
                self.publisher.lock().await.take();
                Err(e.into())
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BrokerSubscription>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(Box::new(RedisSubscription {
            channel: channel.to_string(),
            pubsub,
        }))
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

struct RedisSubscription {
    channel: String,
    pubsub: PubSub,
}

#[async_trait]
impl BrokerSubscription for RedisSubscription {
    async fn next_message(&mut self) -> Option<String> {
        loop {
            let msg = self.pubsub.on_message().next().await?;
            match msg.get_payload::<String>() {
                Ok(payload) => return Some(payload),
                Err(e) => {
                    warn!(channel = %self.channel, "dropping non-text redis payload: {e}");
                }
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.pubsub.unsubscribe(&self.channel).await?;
        Ok(())
    }
}
