//! Pool coordinator
//!
//! Owns every account state transition. All mutating operations run inside a
//! single `AccountStore::mutate` closure, so the store's mutex is the
//! pool-wide sequence point: two concurrent allocations can never select the
//! same account, and derived counts are always consistent. Network I/O
//! (registration, refresh) happens strictly outside that lock with
//! copy-in/copy-out semantics.
//!
//! Selection order among available accounts is oldest-`last_refresh_at`
//! first with lowest-id tie-break, which spreads usage and keeps refresh
//! timing predictable.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountStatus, LeasedCredential, PoolSnapshot, now_millis};
use crate::error::{Error, Result};
use crate::refresher::{RefreshError, Refreshed, Refresher};
use crate::registrar::Registered;
use crate::store::AccountStore;

/// What allocate does when fewer accounts are available than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Return whatever is available, 0..count, never blocking (default)
    #[default]
    BestEffort,
    /// Refuse the whole request with `InsufficientPool`
    AllOrNothing,
}

/// Pool sizing and lease behavior.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    /// Accounts handed out per allocation call when the caller doesn't say
    pub accounts_per_request: usize,
    pub lease_ttl: Duration,
    /// Failures after which a degraded account is retired
    pub degraded_retry_threshold: u32,
    /// Grace period before the watchdog reverts a stuck transient state
    pub stuck_grace: Duration,
    pub allocation_policy: AllocationPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 20,
            accounts_per_request: 1,
            lease_ttl: Duration::from_secs(1_800),
            degraded_retry_threshold: 3,
            stuck_grace: Duration::from_secs(600),
            allocation_policy: AllocationPolicy::BestEffort,
        }
    }
}

/// A refresh reserved by the coordinator: the account is parked in
/// `Refreshing` and its token material copied out so the network call runs
/// without any lock held.
#[derive(Debug, Clone)]
pub struct RefreshJob {
    pub id: String,
    pub refresh_token: String,
    pub last_refresh_at: u64,
    /// Status to restore on `TooSoon`
    prior: AccountStatus,
}

#[derive(Debug, Default)]
struct Counts {
    available: usize,
    allocated: usize,
    provisioning: usize,
    degraded: usize,
}

impl Counts {
    fn tracked(&self) -> usize {
        self.available + self.allocated + self.provisioning + self.degraded
    }

    /// Basis for the replenishment shortfall: degraded accounts don't count
    /// toward a healthy pool.
    fn healthy(&self) -> usize {
        self.available + self.allocated + self.provisioning
    }
}

fn count_statuses(accounts: &std::collections::HashMap<String, Account>) -> Counts {
    let mut counts = Counts::default();
    for account in accounts.values() {
        match account.status {
            AccountStatus::Available | AccountStatus::Refreshing => counts.available += 1,
            AccountStatus::Allocated => counts.allocated += 1,
            AccountStatus::Provisioning => counts.provisioning += 1,
            AccountStatus::Degraded => counts.degraded += 1,
            AccountStatus::Retired => {}
        }
    }
    counts
}

/// Account pool coordinator.
pub struct Pool {
    config: PoolConfig,
    pub(crate) store: Arc<AccountStore>,
    refresher: Arc<dyn Refresher>,
}

impl Pool {
    pub fn new(config: PoolConfig, store: Arc<AccountStore>, refresher: Arc<dyn Refresher>) -> Self {
        Self {
            config,
            store,
            refresher,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Direct store access, for startup inspection and tests.
    pub fn store_handle(&self) -> &AccountStore {
        &self.store
    }

    /// Lease up to `count` accounts to `requester`.
    ///
    /// Fresh-token accounts are granted lock-locally. Only when the grant
    /// would otherwise fall short are expired-token candidates refreshed,
    /// outside the lock, one by one. Under all-or-nothing only fresh-token
    /// accounts satisfy the grant. Never blocks waiting for replenishment.
    pub async fn allocate(&self, count: usize, requester: &str) -> Result<Vec<LeasedCredential>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let now = now_millis();
        let lease_ttl = self.config.lease_ttl.as_millis() as u64;
        let policy = self.config.allocation_policy;

        let plan = self
            .store
            .mutate(|accounts| {
                let mut candidates: Vec<(u64, String, bool)> = accounts
                    .values()
                    .filter(|a| a.status == AccountStatus::Available)
                    .map(|a| (a.last_refresh_at, a.id.clone(), a.token_expired(now)))
                    .collect();
                candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

                if policy == AllocationPolicy::AllOrNothing {
                    // An all-or-nothing grant is committed in full under this
                    // lock: expired-token candidates need an out-of-lock
                    // refresh that can still fail, so they do not count
                    candidates.retain(|(_, _, expired)| !expired);
                    if candidates.len() < count {
                        return Err(Error::InsufficientPool {
                            requested: count,
                            available: candidates.len(),
                        });
                    }
                }

                let mut granted = Vec::new();
                let mut lazy = Vec::new();
                for (_, id, expired) in candidates {
                    if granted.len() + lazy.len() >= count {
                        break;
                    }
                    let Some(account) = accounts.get_mut(&id) else {
                        continue;
                    };
                    if expired {
                        // Reserve for lazy refresh so no concurrent caller
                        // grabs it meanwhile
                        lazy.push(RefreshJob {
                            id: account.id.clone(),
                            refresh_token: account.refresh_token.clone(),
                            last_refresh_at: account.last_refresh_at,
                            prior: AccountStatus::Available,
                        });
                        account.status = AccountStatus::Refreshing;
                        account.updated_at = now;
                    } else {
                        account.status = AccountStatus::Allocated;
                        account.lease_holder = Some(requester.to_string());
                        account.lease_expires_at = Some(now + lease_ttl);
                        account.updated_at = now;
                        granted.push(LeasedCredential {
                            id: account.id.clone(),
                            access_token: account.access_token.clone(),
                            expires_at: account.token_expires_at,
                        });
                    }
                }
                Ok((granted, lazy))
            })
            .await?;
        let (mut granted, lazy) = plan?;

        // Lazy refresh of expired-token candidates, outside the store lock
        for job in lazy {
            match self.refresher.refresh(&job.refresh_token, job.last_refresh_at).await {
                Ok(refreshed) => {
                    let view = self
                        .store
                        .mutate(|accounts| {
                            let account = accounts.get_mut(&job.id)?;
                            let now = now_millis();
                            commit_tokens(account, &refreshed, now);
                            account.status = AccountStatus::Allocated;
                            account.lease_holder = Some(requester.to_string());
                            account.lease_expires_at = Some(now + lease_ttl);
                            account.updated_at = now;
                            Some(LeasedCredential {
                                id: account.id.clone(),
                                access_token: account.access_token.clone(),
                                expires_at: account.token_expires_at,
                            })
                        })
                        .await?;
                    if let Some(view) = view {
                        debug!(account_id = %view.id, "expired token refreshed at allocation");
                        granted.push(view);
                    }
                }
                Err(RefreshError::TooSoon { retry_after }) => {
                    debug!(account_id = %job.id, ?retry_after, "expired token inside refresh floor, skipping");
                    self.restore_status(&job.id, job.prior).await?;
                }
                Err(RefreshError::Failed(cause)) => {
                    warn!(account_id = %job.id, error = %cause, "allocation-time refresh failed");
                    self.mark_degraded(&job.id, &cause).await?;
                }
            }
        }

        metrics::counter!("pool_leases_granted_total").increment(granted.len() as u64);
        info!(
            requester,
            requested = count,
            granted = granted.len(),
            "allocation"
        );
        Ok(granted)
    }

    /// Release a lease. Returns whether a lease was actually released.
    ///
    /// Idempotent: releasing an account nobody holds is a no-op `Ok(false)`,
    /// since the reaper may legitimately race a client release. Releasing a
    /// lease held by someone else is `NotOwner`.
    pub async fn release(&self, id: &str, requester: &str) -> Result<bool> {
        let released = self
            .store
            .mutate(|accounts| {
                let Some(account) = accounts.get_mut(id) else {
                    return Err(Error::NotFound(id.to_string()));
                };
                match account.status {
                    AccountStatus::Allocated => {
                        if account.lease_holder.as_deref() != Some(requester) {
                            return Err(Error::NotOwner(id.to_string()));
                        }
                        account.status = AccountStatus::Available;
                        account.lease_holder = None;
                        account.lease_expires_at = None;
                        account.updated_at = now_millis();
                        Ok(true)
                    }
                    AccountStatus::Retired => Err(Error::NotFound(id.to_string())),
                    _ => Ok(false),
                }
            })
            .await??;
        if released {
            metrics::counter!("pool_leases_released_total").increment(1);
            debug!(account_id = id, requester, "lease released");
        }
        Ok(released)
    }

    /// Force-release allocated accounts whose lease deadline has passed.
    pub async fn reap_expired_leases(&self) -> Result<usize> {
        let now = now_millis();
        let reaped = self
            .store
            .mutate(|accounts| {
                let mut reaped = 0usize;
                for account in accounts.values_mut() {
                    if account.status == AccountStatus::Allocated
                        && account.lease_expires_at.is_some_and(|at| at <= now)
                    {
                        warn!(
                            account_id = %account.id,
                            holder = account.lease_holder.as_deref().unwrap_or(""),
                            "reaping abandoned lease"
                        );
                        account.status = AccountStatus::Available;
                        account.lease_holder = None;
                        account.lease_expires_at = None;
                        account.updated_at = now;
                        reaped += 1;
                    }
                }
                reaped
            })
            .await?;
        if reaped > 0 {
            metrics::counter!("pool_leases_reaped_total").increment(reaped as u64);
        }
        Ok(reaped)
    }

    /// Read-only pool snapshot. Never mutates.
    pub async fn status(&self) -> PoolSnapshot {
        self.store
            .read(|accounts| {
                let counts = count_statuses(accounts);
                PoolSnapshot {
                    available: counts.available,
                    allocated: counts.allocated,
                    provisioning: counts.provisioning,
                    degraded: counts.degraded,
                    min_size: self.config.min_size,
                    max_size: self.config.max_size,
                }
            })
            .await
    }

    /// Registrations the pool can still absorb before hitting `max_size`.
    pub async fn capacity_remaining(&self) -> usize {
        let max = self.config.max_size;
        self.store
            .read(|accounts| max.saturating_sub(count_statuses(accounts).tracked()))
            .await
    }

    /// Record a failure against an account.
    ///
    /// Increments `failure_count`; reaching the retry threshold retires the
    /// account. Provisioning placeholders are deleted outright since they
    /// carry no credential worth auditing.
    pub async fn mark_degraded(&self, id: &str, reason: &str) -> Result<()> {
        let threshold = self.config.degraded_retry_threshold;
        let outcome = self
            .store
            .mutate(|accounts| {
                let Some(account) = accounts.get_mut(id) else {
                    return None;
                };
                if account.status == AccountStatus::Retired {
                    return Some(AccountStatus::Retired);
                }
                if account.is_placeholder() {
                    accounts.remove(id);
                    return None;
                }
                account.failure_count += 1;
                account.lease_holder = None;
                account.lease_expires_at = None;
                account.status = if account.failure_count >= threshold {
                    AccountStatus::Retired
                } else {
                    AccountStatus::Degraded
                };
                account.updated_at = now_millis();
                Some(account.status)
            })
            .await?;
        match outcome {
            Some(AccountStatus::Retired) => {
                warn!(account_id = id, reason, "account retired after repeated failures");
            }
            Some(status) => {
                warn!(account_id = id, reason, status = status.label(), "account failure recorded");
            }
            None => debug!(account_id = id, reason, "degraded placeholder dropped"),
        }
        Ok(())
    }

    /// Watchdog: revert accounts stranded in a transient state.
    ///
    /// A crashed or timed-out task can leave an account in `Provisioning` or
    /// `Refreshing` forever; past the grace period those are degraded
    /// (placeholders deleted) so they re-enter the normal retry path.
    pub async fn revert_stuck(&self) -> Result<usize> {
        let now = now_millis();
        let grace = self.config.stuck_grace.as_millis() as u64;
        let stuck: Vec<String> = self
            .store
            .read(|accounts| {
                accounts
                    .values()
                    .filter(|a| {
                        matches!(
                            a.status,
                            AccountStatus::Provisioning | AccountStatus::Refreshing
                        ) && now.saturating_sub(a.updated_at) > grace
                    })
                    .map(|a| a.id.clone())
                    .collect()
            })
            .await;
        for id in &stuck {
            self.mark_degraded(id, "stuck in transient state past grace period")
                .await?;
        }
        Ok(stuck.len())
    }

    /// Reserve a Provisioning placeholder toward the `min_size` shortfall.
    ///
    /// Returns `None` once the shortfall is closed or `max_size` is reached,
    /// so concurrent replenishment can never overshoot either bound.
    pub async fn begin_provisioning(&self) -> Result<Option<String>> {
        let min = self.config.min_size;
        let max = self.config.max_size;
        self.store
            .mutate(|accounts| {
                let counts = count_statuses(accounts);
                if counts.healthy() >= min || counts.tracked() >= max {
                    return None;
                }
                let placeholder = Account::placeholder();
                let id = placeholder.id.clone();
                accounts.insert(id.clone(), placeholder);
                Some(id)
            })
            .await
    }

    /// Reserve a placeholder for a manual replenish request.
    ///
    /// Manual replenishment may push the pool past `min_size` but never past
    /// `max_size`.
    pub async fn begin_provisioning_manual(&self) -> Result<Option<String>> {
        let max = self.config.max_size;
        self.store
            .mutate(|accounts| {
                if count_statuses(accounts).tracked() >= max {
                    return None;
                }
                let placeholder = Account::placeholder();
                let id = placeholder.id.clone();
                accounts.insert(id.clone(), placeholder);
                Some(id)
            })
            .await
    }

    /// Fill a placeholder with a freshly-registered account.
    pub async fn complete_provisioning(&self, id: &str, registered: Registered) -> Result<()> {
        self.store
            .mutate(|accounts| {
                let Some(account) = accounts.get_mut(id) else {
                    return Err(Error::NotFound(id.to_string()));
                };
                if account.status != AccountStatus::Provisioning {
                    return Err(Error::Registration(format!(
                        "account {id} is no longer provisioning"
                    )));
                }
                let now = now_millis();
                account.email = registered.email;
                account.access_token = registered.access_token;
                account.refresh_token = registered.refresh_token;
                account.token_issued_at = now;
                account.token_expires_at = now + registered.expires_in_secs * 1_000;
                account.last_refresh_at = now;
                account.failure_count = 0;
                account.status = AccountStatus::Available;
                account.updated_at = now;
                Ok(())
            })
            .await??;
        info!(account_id = id, "account provisioned and available");
        Ok(())
    }

    /// Drop a placeholder whose registration failed.
    pub async fn abort_provisioning(&self, id: &str) -> Result<()> {
        self.store
            .mutate(|accounts| {
                if accounts.get(id).is_some_and(|a| a.status == AccountStatus::Provisioning) {
                    accounts.remove(id);
                }
            })
            .await
    }

    /// Reserve accounts due for renewal: available accounts whose token
    /// expires within `margin`, plus degraded accounts awaiting their
    /// bounded retry. Each is parked in `Refreshing` with its token
    /// material copied out.
    pub async fn refresh_candidates(&self, margin: Duration) -> Result<Vec<RefreshJob>> {
        let now = now_millis();
        let margin_millis = margin.as_millis() as u64;
        self.store
            .mutate(|accounts| {
                let mut jobs = Vec::new();
                for account in accounts.values_mut() {
                    let due = match account.status {
                        AccountStatus::Available => {
                            account.token_expires_at <= now + margin_millis
                        }
                        AccountStatus::Degraded => !account.is_placeholder(),
                        _ => false,
                    };
                    if due {
                        jobs.push(RefreshJob {
                            id: account.id.clone(),
                            refresh_token: account.refresh_token.clone(),
                            last_refresh_at: account.last_refresh_at,
                            prior: account.status,
                        });
                        account.status = AccountStatus::Refreshing;
                        account.updated_at = now;
                    }
                }
                // Deterministic order for logs and tests
                jobs.sort_by(|a, b| a.id.cmp(&b.id));
                jobs
            })
            .await
    }

    /// Commit a refresh outcome for a reserved job.
    pub async fn complete_refresh(
        &self,
        job: &RefreshJob,
        outcome: std::result::Result<Refreshed, RefreshError>,
    ) -> Result<()> {
        match outcome {
            Ok(refreshed) => {
                self.store
                    .mutate(|accounts| {
                        if let Some(account) = accounts.get_mut(&job.id) {
                            let now = now_millis();
                            commit_tokens(account, &refreshed, now);
                            account.status = AccountStatus::Available;
                            account.updated_at = now;
                        }
                    })
                    .await?;
                metrics::counter!("pool_token_refreshes_total", "outcome" => "ok").increment(1);
                info!(account_id = %job.id, "token refresh committed");
            }
            Err(RefreshError::TooSoon { retry_after }) => {
                // Expected: the rate floor hasn't elapsed. Not a failure.
                debug!(account_id = %job.id, ?retry_after, "refresh floor not met, deferring");
                metrics::counter!("pool_token_refreshes_total", "outcome" => "too_soon")
                    .increment(1);
                self.restore_status(&job.id, job.prior).await?;
            }
            Err(RefreshError::Failed(cause)) => {
                metrics::counter!("pool_token_refreshes_total", "outcome" => "failed").increment(1);
                self.mark_degraded(&job.id, &cause).await?;
            }
        }
        Ok(())
    }

    /// Publish per-status account gauges.
    pub async fn update_gauges(&self) {
        let snapshot = self.status().await;
        metrics::gauge!("pool_accounts", "status" => "available").set(snapshot.available as f64);
        metrics::gauge!("pool_accounts", "status" => "allocated").set(snapshot.allocated as f64);
        metrics::gauge!("pool_accounts", "status" => "provisioning")
            .set(snapshot.provisioning as f64);
        metrics::gauge!("pool_accounts", "status" => "degraded").set(snapshot.degraded as f64);
    }

    async fn restore_status(&self, id: &str, status: AccountStatus) -> Result<()> {
        self.store
            .mutate(|accounts| {
                if let Some(account) = accounts.get_mut(id) {
                    if account.status == AccountStatus::Refreshing {
                        account.status = status;
                        account.updated_at = now_millis();
                    }
                }
            })
            .await
    }
}

/// Apply new token material. Refresh-token rotation commits durably here,
/// before any caller learns of the refresh, so a crash mid-refresh never
/// strands the account with a dead token.
fn commit_tokens(account: &mut Account, refreshed: &Refreshed, now: u64) {
    account.access_token = refreshed.access_token.clone();
    if let Some(rotated) = &refreshed.refresh_token {
        account.refresh_token = rotated.clone();
    }
    account.token_issued_at = now;
    account.token_expires_at = refreshed.expires_at;
    account.last_refresh_at = now;
    account.failure_count = 0;
}
