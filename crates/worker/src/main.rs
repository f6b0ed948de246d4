//! Tally background worker
//!
//! Runs the periodic jobs the billing core depends on: reset boundary
//! sweeps, scheduled phase activation, reconciliation of failed executions,
//! and consistency verification.

mod phases;
mod reconcile;
mod resets;
mod services;
mod verify;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::services::WorkerServices;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tally_worker=info,tally_billing=info")),
        )
        .init();

    info!("Starting Tally worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = tally_shared::create_pool(&database_url).await?;
    tally_shared::run_migrations(&pool).await?;

    let services = WorkerServices::from_env(pool)?;
    let mut scheduler = JobScheduler::new().await?;

    // Reset boundaries, every minute
    let reset_services = services.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let services = reset_services.clone();
            Box::pin(async move {
                resets::run_reset_sweep(&services).await;
            })
        })?)
        .await?;

    // Scheduled phase activation, every minute offset from the resets
    let phase_services = services.clone();
    scheduler
        .add(Job::new_async("30 * * * * *", move |_uuid, _l| {
            let services = phase_services.clone();
            Box::pin(async move {
                phases::run_phase_sweep(&services).await;
            })
        })?)
        .await?;

    // Reconciliation queue, every 5 minutes
    let reconcile_services = services.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let services = reconcile_services.clone();
            Box::pin(async move {
                reconcile::run_reconciliation(&services).await;
            })
        })?)
        .await?;

    // Consistency verification, every 10 minutes
    let verify_services = services.clone();
    scheduler
        .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
            let services = verify_services.clone();
            Box::pin(async move {
                verify::run_verification_sweep(&services).await;
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Worker scheduler started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down worker");
    scheduler.shutdown().await?;
    Ok(())
}
