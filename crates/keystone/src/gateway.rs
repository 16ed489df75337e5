//! Metadata persistence and recovery.
//!
//! The master reloads metadata from here when it is elected; every node
//! writes committed metadata back after applying a change.

use anyhow::{Context, Result};
use keystone_common::Metadata;
use keystone_common::constants::redis_keys;
use parking_lot::RwLock;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::{AppConfig, GatewayKind};

/// On-disk (in-Redis) representation
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedMetadata {
    metadata: Metadata,
    /// Unix timestamp of the write
    saved_at: i64,
}

/// Metadata persistence backend
#[derive(Clone)]
pub enum Gateway {
    Memory(MemoryGateway),
    Redis(RedisGateway),
}

impl Gateway {
    /// Build the backend selected in configuration
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        match config.cluster.gateway {
            GatewayKind::Memory => Ok(Self::Memory(MemoryGateway::default())),
            GatewayKind::Redis => Ok(Self::Redis(RedisGateway::connect(&config.redis_url).await?)),
        }
    }

    /// Load the last persisted metadata (empty if nothing was ever written)
    pub async fn load(&self) -> Result<Metadata> {
        match self {
            Self::Memory(gateway) => gateway.load(),
            Self::Redis(gateway) => gateway.load().await,
        }
    }

    pub async fn persist(&self, metadata: &Metadata) -> Result<()> {
        match self {
            Self::Memory(gateway) => {
                gateway.persist(metadata);
                Ok(())
            }
            Self::Redis(gateway) => gateway.persist(metadata).await,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Redis(_) => "redis",
        }
    }
}

/// Process-local gateway; clones share the same storage
#[derive(Clone, Default)]
pub struct MemoryGateway {
    stored: Arc<RwLock<Option<PersistedMetadata>>>,
    /// Loads left to fail before the store answers again
    failing_loads: Arc<AtomicU32>,
}

impl MemoryGateway {
    /// Gateway pre-seeded with metadata, as if left by a previous run
    #[cfg(test)]
    pub fn with_metadata(metadata: Metadata) -> Self {
        let gateway = Self::default();
        gateway.persist(&metadata);
        gateway
    }

    /// Make the next `count` loads fail, as an unreachable store would
    #[cfg(test)]
    pub fn fail_next_loads(&self, count: u32) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    fn load(&self) -> Result<Metadata> {
        if self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("Memory gateway unavailable");
        }

        Ok(self
            .stored
            .read()
            .as_ref()
            .map(|p| p.metadata.clone())
            .unwrap_or_default())
    }

    fn persist(&self, metadata: &Metadata) {
        *self.stored.write() = Some(PersistedMetadata {
            metadata: metadata.clone(),
            saved_at: chrono::Utc::now().timestamp(),
        });
    }

    /// Last persisted metadata, if any
    #[cfg(test)]
    pub fn stored(&self) -> Option<Metadata> {
        self.stored.read().as_ref().map(|p| p.metadata.clone())
    }
}

/// Redis-backed gateway storing one JSON document
#[derive(Clone)]
pub struct RedisGateway {
    /// Redis connection manager (auto-reconnecting)
    redis: ConnectionManager,
}

impl RedisGateway {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let redis = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        Ok(Self { redis })
    }

    async fn load(&self) -> Result<Metadata> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn
            .get(redis_keys::METADATA)
            .await
            .context("Failed to read metadata from Redis")?;

        match data {
            Some(d) => {
                let persisted: PersistedMetadata =
                    serde_json::from_str(&d).context("Failed to parse persisted metadata")?;
                tracing::debug!(saved_at = persisted.saved_at, "Loaded metadata from Redis");
                Ok(persisted.metadata)
            }
            None => Ok(Metadata::default()),
        }
    }

    async fn persist(&self, metadata: &Metadata) -> Result<()> {
        let data = serde_json::to_string(&PersistedMetadata {
            metadata: metadata.clone(),
            saved_at: chrono::Utc::now().timestamp(),
        })?;

        let mut conn = self.redis.clone();
        let _: () = conn
            .set(redis_keys::METADATA, data)
            .await
            .context("Failed to persist metadata to Redis")?;

        Ok(())
    }

    /// Connectivity probe for readiness checks
    pub async fn ping(&self) -> bool {
        let mut conn = self.redis.clone();
        let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        result.is_ok()
    }
}
