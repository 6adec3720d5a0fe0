use chrono::Utc;
use saju_gateway::{
    config::AppConfig,
    db::{self, CreditLedger, PgStore},
    services::{backend::HttpAnalysisBackend, jobs::JobService},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting sweeper worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    let store = Arc::new(PgStore::new(db_pool));

    let backend = HttpAnalysisBackend::new(
        &config.analysis_api_url,
        Duration::from_secs(config.backend_start_timeout_secs),
        Duration::from_secs(config.backend_status_timeout_secs),
    )
    .expect("Failed to initialize analysis backend client");

    let jobs = JobService::new(
        store.clone(),
        store.clone(),
        Arc::new(backend),
        config.stale_job_threshold(),
    );

    tracing::info!(
        interval_secs = config.sweep_interval_secs,
        abandoned_after_secs = config.abandoned_job_secs,
        "Worker ready, starting sweep loop"
    );

    loop {
        sweep_once(store.as_ref(), &jobs, config.abandoned_job_threshold()).await;
        sleep(config.sweep_interval()).await;
    }
}

/// One pass: expire credits and lapsed subscriptions, then fail abandoned
/// jobs. Errors are logged and the next pass tries again.
async fn sweep_once(ledger: &dyn CreditLedger, jobs: &JobService, abandoned_after: Duration) {
    match ledger.expire_credits(Utc::now()).await {
        Ok(summary) if summary.transactions > 0 => {
            tracing::info!(
                transactions = summary.transactions,
                users = summary.users,
                credits = summary.credits,
                "Expired credits"
            );
        }
        Ok(_) => tracing::trace!("No credits to expire"),
        Err(e) => tracing::error!(error = %e, "Credit expiry failed, will retry"),
    }

    match ledger.expire_subscriptions(Utc::now()).await {
        Ok(0) => tracing::trace!("No subscriptions to expire"),
        Ok(count) => tracing::info!(count, "Expired subscriptions"),
        Err(e) => tracing::error!(error = %e, "Subscription expiry failed, will retry"),
    }

    match jobs.sweep_abandoned(abandoned_after).await {
        Ok(0) => tracing::trace!("No abandoned jobs"),
        Ok(count) => tracing::info!(count, "Failed abandoned jobs"),
        Err(e) => tracing::error!(error = %e, "Abandoned job sweep failed, will retry"),
    }
}
