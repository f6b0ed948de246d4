//! Shared service handles for worker jobs

use std::sync::Arc;

use sqlx::PgPool;
use tally_billing::cache::{BalanceCache, RedisBalanceCache};
use tally_billing::catalog::CatalogService;
use tally_billing::events::BillingEventLogger;
use tally_billing::ledger::LedgerService;
use tally_billing::processor::ProcessorClient;
use tally_billing::verifier::ConsistencyVerifier;

#[derive(Clone)]
pub struct WorkerServices {
    pub pool: PgPool,
    pub ledger: LedgerService,
    pub catalog: CatalogService,
    pub processor: ProcessorClient,
    pub events: BillingEventLogger,
    pub cache: Arc<dyn BalanceCache>,
    pub verifier: ConsistencyVerifier,
}

impl WorkerServices {
    pub fn from_env(pool: PgPool) -> anyhow::Result<Self> {
        let redis_url = std::env::var("REDIS_URL")
            .map_err(|_| anyhow::anyhow!("REDIS_URL must be set"))?;

        let processor = ProcessorClient::from_env()?;
        let cache: Arc<dyn BalanceCache> = Arc::new(RedisBalanceCache::new(&redis_url)?);
        let ledger = LedgerService::new(pool.clone());
        let catalog = CatalogService::new(pool.clone());
        let events = BillingEventLogger::new(pool.clone());
        let verifier = ConsistencyVerifier::new(
            ledger.clone(),
            catalog.clone(),
            processor.clone(),
            events.clone(),
        );

        Ok(Self {
            pool,
            ledger,
            catalog,
            processor,
            events,
            cache,
            verifier,
        })
    }
}
