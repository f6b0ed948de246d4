//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;
use tally_billing::cache::{BalanceCache, RedisBalanceCache};
use tally_billing::catalog::CatalogService;
use tally_billing::context::BillingContextBuilder;
use tally_billing::events::BillingEventLogger;
use tally_billing::executor::PlanExecutor;
use tally_billing::ledger::LedgerService;
use tally_billing::processor::ProcessorClient;
use tally_billing::usage::UsageService;
use tally_billing::verifier::ConsistencyVerifier;
use tally_billing::webhooks::WebhookHandler;

use crate::config::Config;

/// Shared application state available to all routes
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub catalog: CatalogService,
    pub ledger: LedgerService,
    pub context: BillingContextBuilder,
    pub executor: PlanExecutor,
    pub usage: UsageService,
    pub verifier: ConsistencyVerifier,
    pub webhooks: WebhookHandler,
    pub processor: ProcessorClient,
    pub events: BillingEventLogger,
}

impl AppState {
    pub fn new(config: Config, pool: PgPool) -> anyhow::Result<Self> {
        let processor = ProcessorClient::from_env()?;
        let cache: Arc<dyn BalanceCache> = Arc::new(RedisBalanceCache::new(&config.redis_url)?);

        let catalog = CatalogService::new(pool.clone());
        let ledger = LedgerService::new(pool.clone());
        let events = BillingEventLogger::new(pool.clone());
        let context =
            BillingContextBuilder::new(ledger.clone(), catalog.clone(), processor.clone());
        let executor = PlanExecutor::new(
            ledger.clone(),
            processor.clone(),
            events.clone(),
            cache.clone(),
        );
        let usage = UsageService::new(
            ledger.clone(),
            catalog.clone(),
            events.clone(),
            cache.clone(),
        );
        let verifier = ConsistencyVerifier::new(
            ledger.clone(),
            catalog.clone(),
            processor.clone(),
            events.clone(),
        );
        let webhook_secret = processor.config().webhook_secret.clone();
        let webhooks = WebhookHandler::new(
            ledger.clone(),
            context.clone(),
            executor.clone(),
            events.clone(),
            cache,
            webhook_secret,
        );

        Ok(Self {
            config: Arc::new(config),
            pool,
            catalog,
            ledger,
            context,
            executor,
            usage,
            verifier,
            webhooks,
            processor,
            events,
        })
    }
}
