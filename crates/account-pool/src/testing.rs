//! Shared fixtures for pool tests: tempdir-backed pools, seeded accounts,
//! and scripted refreshers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::account::{Account, AccountStatus, now_millis};
use crate::pool::{Pool, PoolConfig};
use crate::refresher::{RefreshError, Refreshed, Refresher};
use crate::store::AccountStore;

/// Refresher for tests that must never attempt a refresh.
pub struct NullRefresher;

impl Refresher for NullRefresher {
    fn refresh<'a>(
        &'a self,
        _refresh_token: &'a str,
        _last_refresh_at: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Refreshed, RefreshError>> + Send + 'a>> {
        Box::pin(async { Err(RefreshError::Failed("refresh not expected in this test".into())) })
    }
}

enum Script {
    Succeed { access_token: String },
    Fail { cause: String },
    TooSoon { retry_after: Duration },
}

/// Refresher that replays a fixed outcome and counts invocations.
pub struct ScriptedRefresher {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedRefresher {
    pub fn succeeding(access_token: &str) -> Self {
        Self {
            script: Script::Succeed {
                access_token: access_token.to_string(),
            },
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(cause: &str) -> Self {
        Self {
            script: Script::Fail {
                cause: cause.to_string(),
            },
            calls: AtomicUsize::new(0),
        }
    }

    pub fn too_soon(retry_after: Duration) -> Self {
        Self {
            script: Script::TooSoon { retry_after },
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Refresher for ScriptedRefresher {
    fn refresh<'a>(
        &'a self,
        _refresh_token: &'a str,
        _last_refresh_at: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Refreshed, RefreshError>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = match &self.script {
            Script::Succeed { access_token } => Ok(Refreshed {
                access_token: access_token.clone(),
                refresh_token: None,
                expires_at: now_millis() + 3_600_000,
            }),
            Script::Fail { cause } => Err(RefreshError::Failed(cause.clone())),
            Script::TooSoon { retry_after } => Err(RefreshError::TooSoon {
                retry_after: *retry_after,
            }),
        };
        Box::pin(async move { outcome })
    }
}

/// Pool backed by a store file inside `dir`.
pub async fn test_pool(
    dir: &tempfile::TempDir,
    config: PoolConfig,
    refresher: Arc<dyn Refresher>,
) -> Pool {
    let store = AccountStore::load(dir.path().join("accounts.json"))
        .await
        .unwrap();
    Pool::new(config, Arc::new(store), refresher)
}

/// Insert an available account with a far-future token expiry.
pub async fn seed_account(pool: &Pool, id: &str, last_refresh_at: u64) {
    let now = now_millis();
    let account = Account {
        id: id.to_string(),
        email: format!("{id}@pool.test"),
        access_token: format!("at_{id}"),
        refresh_token: format!("rt_{id}"),
        token_issued_at: now,
        token_expires_at: now + 3_600_000,
        last_refresh_at,
        status: AccountStatus::Available,
        lease_holder: None,
        lease_expires_at: None,
        failure_count: 0,
        updated_at: now,
    };
    pool.store
        .mutate(|accounts| {
            accounts.insert(account.id.clone(), account);
        })
        .await
        .unwrap();
}
