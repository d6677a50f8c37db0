//! Periodic ledger sweep: logs per-status counts, reclaimable leases and
//! protocol counters. One sweeper reports at a time; extra instances stand by
//! on a resource lock and take over when the active one stops refreshing it.

use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};

use workhorse_core::OwnerId;
use workhorse_infra::{LeaseManager, PostgresLeaseStore, ResourceMutex, SweeperConfig};
use workhorse_observability::LeaseMetrics;

const SWEEPER_LOCK: &str = "workhorse:sweeper";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    workhorse_observability::init();

    let config = SweeperConfig::from_env()?;
    let store = Arc::new(
        PostgresLeaseStore::connect(&config.database_url, config.max_connections)
            .await
            .context("failed to connect to Postgres")?,
    );
    store
        .ensure_schema()
        .await
        .context("failed to bootstrap lease schema")?;

    let metrics = Arc::new(LeaseMetrics::new());
    let manager = LeaseManager::new(store.clone()).with_metrics(metrics.clone());
    let mutex = ResourceMutex::new(store).with_metrics(metrics.clone());

    let owner = OwnerId::generate();
    // Three missed sweeps and a standby instance takes over.
    let staleness_window = config.sweep_interval * 3;

    info!(
        owner = %owner,
        interval_secs = config.sweep_interval.as_secs(),
        "sweeper started"
    );

    let mut ticker = tokio::time::interval(config.sweep_interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => break,
        }

        match mutex.try_acquire(&owner, SWEEPER_LOCK, staleness_window).await {
            Ok(outcome) if outcome.is_acquired() => {}
            Ok(_) => {
                debug!("another sweeper is active; standing by");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "could not check sweeper lock");
                continue;
            }
        }

        match manager.sweep().await {
            Ok(report) => {
                let stats = serde_json::to_string(&report.stats)?;
                let counters = serde_json::to_string(&metrics.snapshot())?;
                info!(stats = %stats, metrics = %counters, "ledger sweep");
            }
            Err(e) => warn!(error = %e, "sweep failed; retrying next interval"),
        }
    }

    if let Err(e) = mutex.release(&owner, SWEEPER_LOCK).await {
        warn!(error = %e, "failed to release sweeper lock");
    }
    info!("sweeper stopped");
    Ok(())
}
