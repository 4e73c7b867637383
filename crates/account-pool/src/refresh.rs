//! Token refresh loop
//!
//! Walks accounts due for renewal (token near expiry, or degraded and
//! awaiting a retry), refreshing each outside the store lock. The refresher
//! itself enforces the per-account rate floor, so a cycle that comes around
//! early simply defers those accounts to a later pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::pool::Pool;
use crate::refresher::Refresher;

/// Spawn the background refresh task.
///
/// The first tick is skipped: tokens were just loaded or provisioned, and
/// refreshing immediately would only bounce off the rate floor.
pub fn spawn_refresh_task(
    pool: Arc<Pool>,
    refresher: Arc<dyn Refresher>,
    interval: Duration,
    margin: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_refresh_cycle(&pool, refresher.as_ref(), margin).await;
        }
    })
}

/// Refresh every due account once. Returns the number of successful
/// renewals.
pub async fn run_refresh_cycle(pool: &Pool, refresher: &dyn Refresher, margin: Duration) -> usize {
    let jobs = match pool.refresh_candidates(margin).await {
        Ok(jobs) => jobs,
        Err(e) => {
            error!(error = %e, "could not select refresh candidates");
            return 0;
        }
    };
    if jobs.is_empty() {
        return 0;
    }
    debug!(candidates = jobs.len(), "refresh cycle starting");

    let mut renewed = 0usize;
    for job in &jobs {
        let outcome = refresher.refresh(&job.refresh_token, job.last_refresh_at).await;
        let succeeded = outcome.is_ok();
        if let Err(e) = pool.complete_refresh(job, outcome).await {
            error!(account_id = %job.id, error = %e, "could not commit refresh outcome");
            continue;
        }
        if succeeded {
            renewed += 1;
        }
    }
    if renewed > 0 {
        info!(renewed, candidates = jobs.len(), "refresh cycle complete");
    }
    renewed
}
