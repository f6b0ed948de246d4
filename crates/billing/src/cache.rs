//! Balance cache
//!
//! Read-side cache for aggregated feature balances. Entries are invalidated
//! on every ledger write for the customer, so the TTL is only a backstop
//! against missed invalidations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tally_shared::CustomerId;
use tokio::sync::RwLock;

use crate::balance::FeatureBalance;
use crate::error::{BillingError, BillingResult};

const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Storage backend for cached balance snapshots
#[async_trait]
pub trait BalanceCache: Send + Sync {
    async fn get(&self, customer_id: CustomerId) -> BillingResult<Option<Vec<FeatureBalance>>>;
    async fn set(&self, customer_id: CustomerId, balances: &[FeatureBalance]) -> BillingResult<()>;
    async fn invalidate(&self, customer_id: CustomerId) -> BillingResult<()>;
}

fn cache_key(customer_id: CustomerId) -> String {
    format!("tally:balances:{}", customer_id)
}

/// Redis-backed cache shared across API instances
#[derive(Clone)]
pub struct RedisBalanceCache {
    client: redis::Client,
    ttl: Duration,
}

impl RedisBalanceCache {
    pub fn new(url: &str) -> BillingResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| BillingError::Config(format!("Failed to create Redis client: {}", e)))?;
        Ok(Self {
            client,
            ttl: DEFAULT_TTL,
        })
    }

    async fn connection(&self) -> BillingResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BillingError::Internal(format!("Failed to get Redis connection: {}", e)))
    }
}

#[async_trait]
impl BalanceCache for RedisBalanceCache {
    async fn get(&self, customer_id: CustomerId) -> BillingResult<Option<Vec<FeatureBalance>>> {
        let mut conn = self.connection().await?;
        let raw: Option<Vec<u8>> = redis::cmd("GET")
            .arg(cache_key(customer_id))
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(|e| BillingError::Internal(format!("Redis GET failed: {}", e)))?;

        match raw {
            // A corrupt entry is treated as a miss, not an error
            Some(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            None => Ok(None),
        }
    }

    async fn set(&self, customer_id: CustomerId, balances: &[FeatureBalance]) -> BillingResult<()> {
        let mut conn = self.connection().await?;
        let bytes =
            serde_json::to_vec(balances).map_err(|e| BillingError::Internal(e.to_string()))?;
        redis::cmd("SETEX")
            .arg(cache_key(customer_id))
            .arg(self.ttl.as_secs())
            .arg(bytes)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| BillingError::Internal(format!("Redis SETEX failed: {}", e)))?;
        Ok(())
    }

    async fn invalidate(&self, customer_id: CustomerId) -> BillingResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(cache_key(customer_id))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| BillingError::Internal(format!("Redis DEL failed: {}", e)))?;
        Ok(())
    }
}

/// Process-local cache for tests and single-instance deployments
#[derive(Clone, Default)]
pub struct InMemoryBalanceCache {
    entries: Arc<RwLock<HashMap<CustomerId, Vec<FeatureBalance>>>>,
}

impl InMemoryBalanceCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BalanceCache for InMemoryBalanceCache {
    async fn get(&self, customer_id: CustomerId) -> BillingResult<Option<Vec<FeatureBalance>>> {
        Ok(self.entries.read().await.get(&customer_id).cloned())
    }

    async fn set(&self, customer_id: CustomerId, balances: &[FeatureBalance]) -> BillingResult<()> {
        self.entries
            .write()
            .await
            .insert(customer_id, balances.to_vec());
        Ok(())
    }

    async fn invalidate(&self, customer_id: CustomerId) -> BillingResult<()> {
        self.entries.write().await.remove(&customer_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_roundtrip_and_invalidate() {
        let cache = InMemoryBalanceCache::new();
        let customer_id = CustomerId::new();

        assert!(cache.get(customer_id).await.expect("get").is_none());

        cache.set(customer_id, &[]).await.expect("set");
        assert_eq!(cache.get(customer_id).await.expect("get"), Some(vec![]));

        cache.invalidate(customer_id).await.expect("invalidate");
        assert!(cache.get(customer_id).await.expect("get").is_none());
    }
}
