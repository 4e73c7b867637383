//! Account data model
//!
//! Timestamps are unix milliseconds throughout; the store persists them, so
//! the refresh floor and lease deadlines hold across process restarts.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lifecycle status of a pool account.
///
/// Transitions:
/// - Provisioning → Available (registration completed)
/// - Available ⇄ Allocated (lease grant / release / reap)
/// - Available → Refreshing → Available (token renewal)
/// - Refreshing → Degraded (renewal failed)
/// - Degraded → Refreshing (bounded retry) | Retired (failure threshold)
/// - Provisioning/Refreshing → Degraded (stuck-state watchdog)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Provisioning,
    Available,
    Allocated,
    Refreshing,
    Degraded,
    Retired,
}

impl AccountStatus {
    /// Status label for logging and snapshots.
    pub fn label(&self) -> &'static str {
        match self {
            AccountStatus::Provisioning => "provisioning",
            AccountStatus::Available => "available",
            AccountStatus::Allocated => "allocated",
            AccountStatus::Refreshing => "refreshing",
            AccountStatus::Degraded => "degraded",
            AccountStatus::Retired => "retired",
        }
    }
}

/// One externally-issued account managed by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Opaque unique id, stable for the account's lifetime
    pub id: String,
    /// External-facing identity used at registration
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_issued_at: u64,
    pub token_expires_at: u64,
    /// Most recent successful refresh; governs the refresh floor
    pub last_refresh_at: u64,
    pub status: AccountStatus,
    /// Present iff status is Allocated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_holder: Option<String>,
    /// Present iff status is Allocated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<u64>,
    /// Consecutive refresh/registration failures; drives retirement
    #[serde(default)]
    pub failure_count: u32,
    /// Millis of the last status transition; drives the stuck watchdog
    pub updated_at: u64,
}

impl Account {
    /// A Provisioning placeholder reserved before registration starts.
    ///
    /// Carries no credentials; it exists so pool-size decisions account for
    /// registrations in flight. Placeholders that fail are deleted, not
    /// degraded.
    pub fn placeholder() -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email: String::new(),
            access_token: String::new(),
            refresh_token: String::new(),
            token_issued_at: 0,
            token_expires_at: 0,
            last_refresh_at: 0,
            status: AccountStatus::Provisioning,
            lease_holder: None,
            lease_expires_at: None,
            failure_count: 0,
            updated_at: now,
        }
    }

    /// Whether the access token has expired as of `now`.
    pub fn token_expired(&self, now: u64) -> bool {
        self.token_expires_at <= now
    }

    /// Placeholders have no credentials worth keeping on failure.
    pub fn is_placeholder(&self) -> bool {
        self.refresh_token.is_empty()
    }
}

/// Read-only credential view handed to allocation callers.
///
/// Never carries the refresh token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeasedCredential {
    pub id: String,
    pub access_token: String,
    pub expires_at: u64,
}

/// Pool counts plus configuration, as served by the status endpoint.
///
/// Retired accounts are excluded everywhere. Accounts mid-refresh are
/// counted as available: they return there on success and the failure path
/// is settled when the refresh commits.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub available: usize,
    pub allocated: usize,
    pub provisioning: usize,
    pub degraded: usize,
    pub min_size: usize,
    pub max_size: usize,
}
