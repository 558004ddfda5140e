//! Postgres LISTEN/NOTIFY backend.
//!
//! Payloads travel through `pg_notify`, so they are limited to what a NOTIFY
//! payload can carry (8000 bytes by default). Channel identifiers are capped
//! at 63 bytes. Longer relay channel names are cut and suffixed with the
//! first 8 bytes of their SHA-256, hex encoded, so every relay build and
//! every publisher agrees on the identifier.

use std::fmt::Write as _;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tracing::warn;

use super::{Broker, BrokerSubscription};
use crate::error::Result;

const MAX_IDENTIFIER_LEN: usize = 63;

pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Postgres-safe channel identifier for a relay channel name.
pub fn pg_channel(channel: &str) -> String {
    if channel.len() <= MAX_IDENTIFIER_LEN {
        return channel.to_string();
    }
    let digest = Sha256::digest(channel.as_bytes())[..8].iter().fold(
        String::with_capacity(16),
        |mut hex, byte| {
            let _ = write!(hex, "{byte:02x}");
            hex
        },
    );
    let mut cut = MAX_IDENTIFIER_LEN - digest.len() - 1;
    while !channel.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}~{digest}", &channel[..cut])
}

#[async_trait]
impl Broker for PgBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(pg_channel(channel))
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BrokerSubscription>> {
        let channel = pg_channel(channel);
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&channel).await?;
        Ok(Box::new(PgSubscription { channel, listener }))
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

struct PgSubscription {
    channel: String,
    listener: PgListener,
}

#[async_trait]
impl BrokerSubscription for PgSubscription {
    async fn next_message(&mut self) -> Option<String> {
        // try_recv yields Ok(None) when the connection drops; notifications
        // sent while disconnected are lost, so report it to the caller.
        match self.listener.try_recv().await {
            Ok(Some(notification)) => Some(notification.payload().to_string()),
            Ok(None) => {
                warn!(channel = %self.channel, "postgres listener connection lost");
                None
            }
            Err(e) => {
                warn!(channel = %self.channel, "postgres listener error: {e}");
                None
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.listener.unlisten(&self.channel).await?;
        Ok(())
    }
}
