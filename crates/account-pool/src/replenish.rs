//! Replenishment loop
//!
//! Periodically tops the pool back up to its minimum size by driving the
//! registrar, and performs the pool's housekeeping (lease reaping, stuck
//! state recovery, gauge refresh) on the same cadence.
//!
//! Capacity is reserved one placeholder at a time, so concurrent manual
//! replenish requests and the background loop can never overshoot the pool
//! bounds between counting and registering.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::pool::Pool;
use crate::registrar::{Registered, Registrar, RegistrationError};

#[derive(Debug, Clone)]
pub struct ReplenishConfig {
    /// Cycle cadence
    pub interval: Duration,
    /// Wall-clock budget for one registration attempt
    pub registration_deadline: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Attempts per placeholder before the cycle gives up
    pub max_attempts: u32,
}

impl Default for ReplenishConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            registration_deadline: Duration::from_secs(180),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// Spawn the background replenishment task. The first cycle runs
/// immediately so a cold-started pool doesn't wait a full interval before
/// filling up.
pub fn spawn_replenish_task(
    pool: Arc<Pool>,
    registrar: Arc<dyn Registrar>,
    config: ReplenishConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        loop {
            ticker.tick().await;
            housekeeping(&pool).await;
            let provisioned = run_replenish_cycle(&pool, registrar.as_ref(), &config, None).await;
            if provisioned > 0 {
                info!(provisioned, "replenishment cycle complete");
            }
            pool.update_gauges().await;
        }
    })
}

async fn housekeeping(pool: &Pool) {
    match pool.reap_expired_leases().await {
        Ok(0) => {}
        Ok(reaped) => info!(reaped, "reaped expired leases"),
        Err(e) => error!(error = %e, "lease reaping failed"),
    }
    match pool.revert_stuck().await {
        Ok(0) => {}
        Ok(reverted) => warn!(reverted, "reverted accounts stuck in transient states"),
        Err(e) => error!(error = %e, "stuck state recovery failed"),
    }
}

/// Run one replenishment cycle.
///
/// With `budget: None` this fills the shortfall below `min_size`; with
/// `Some(n)` it provisions up to `n` accounts regardless of the minimum
/// (manual replenish), still bounded by `max_size`. Returns the number of
/// accounts that became available.
pub async fn run_replenish_cycle(
    pool: &Pool,
    registrar: &dyn Registrar,
    config: &ReplenishConfig,
    budget: Option<usize>,
) -> usize {
    let mut provisioned = 0usize;
    let mut remaining = budget;
    loop {
        if remaining == Some(0) {
            break;
        }
        let reservation = if budget.is_some() {
            pool.begin_provisioning_manual().await
        } else {
            pool.begin_provisioning().await
        };
        let id = match reservation {
            Ok(Some(id)) => id,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "could not reserve provisioning slot");
                break;
            }
        };
        debug!(account_id = %id, "provisioning slot reserved");

        match register_with_backoff(registrar, config).await {
            Some(registered) => {
                let email = registered.email.clone();
                match pool.complete_provisioning(&id, registered).await {
                    Ok(()) => {
                        metrics::counter!("pool_registrations_total", "outcome" => "ok")
                            .increment(1);
                        info!(account_id = %id, email, "account registered");
                        provisioned += 1;
                        if let Some(n) = remaining.as_mut() {
                            *n -= 1;
                        }
                    }
                    Err(e) => {
                        // Watchdog stole the placeholder mid-registration;
                        // the credential is lost but the cycle continues
                        warn!(account_id = %id, error = %e, "could not commit registered account");
                        if let Err(e) = pool.abort_provisioning(&id).await {
                            error!(account_id = %id, error = %e, "placeholder cleanup failed");
                        }
                    }
                }
            }
            None => {
                metrics::counter!("pool_registrations_total", "outcome" => "failed").increment(1);
                if let Err(e) = pool.abort_provisioning(&id).await {
                    error!(account_id = %id, error = %e, "placeholder cleanup failed");
                }
                // Registration is failing outright; retrying the rest of the
                // shortfall this cycle would just burn attempts
                warn!("registration attempts exhausted, ending cycle early");
                break;
            }
        }
    }
    provisioned
}

/// Drive one registration to completion with exponential backoff on
/// retryable errors. Returns `None` when attempts are exhausted or the
/// registrar reports a fatal error.
async fn register_with_backoff(
    registrar: &dyn Registrar,
    config: &ReplenishConfig,
) -> Option<Registered> {
    let mut delay = config.backoff_base;
    for attempt in 1..=config.max_attempts {
        match registrar.register(config.registration_deadline).await {
            Ok(registered) => return Some(registered),
            Err(RegistrationError { cause, retryable }) => {
                if !retryable || attempt == config.max_attempts {
                    warn!(attempt, error = %cause, "registration failed");
                    return None;
                }
                debug!(attempt, error = %cause, delay_ms = delay.as_millis() as u64, "registration retry");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(config.backoff_cap);
            }
        }
    }
    None
}
