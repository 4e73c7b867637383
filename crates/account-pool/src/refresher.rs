//! Token refresh with a rate floor
//!
//! The upstream token service tolerates at most one refresh per account per
//! floor interval (default one hour). This is an external constraint, not an
//! optimization: the floor is checked against the persisted `last_refresh_at`
//! so it holds across process restarts. `TooSoon` is an expected outcome the
//! callers wait out, not an error.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::debug;

use crate::account::now_millis;

/// New token material from a successful refresh.
///
/// Refresh tokens may rotate; `refresh_token` is `None` when the provider
/// kept the old one valid.
#[derive(Debug, Clone)]
pub struct Refreshed {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Absolute expiry, unix millis
    pub expires_at: u64,
}

/// Refresh outcomes other than success.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The refresh floor has not elapsed yet. Expected; retry later.
    #[error("refresh floor not met, retry in {retry_after:?}")]
    TooSoon { retry_after: Duration },

    #[error("refresh failed: {0}")]
    Failed(String),
}

/// Seam for token renewal.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Refresher>` shared by the pool and the refresh loop).
pub trait Refresher: Send + Sync {
    /// Exchange `refresh_token` for new token material.
    ///
    /// Must fail with `TooSoon` when less than the floor has elapsed since
    /// `last_refresh_at`.
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
        last_refresh_at: u64,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Refreshed, RefreshError>> + Send + 'a>>;
}

/// Time still to wait before `last_refresh_at + floor`, or `None` once the
/// floor has elapsed. Boundary-inclusive: exactly `floor` elapsed is allowed.
pub fn floor_remaining(last_refresh_at: u64, now: u64, floor: Duration) -> Option<Duration> {
    let floor_millis = floor.as_millis() as u64;
    let elapsed = now.saturating_sub(last_refresh_at);
    if elapsed >= floor_millis {
        None
    } else {
        Some(Duration::from_millis(floor_millis - elapsed))
    }
}

/// Refresher backed by the Warp token proxy.
pub struct HttpRefresher {
    client: reqwest::Client,
    api_key: String,
    floor: Duration,
    deadline: Duration,
}

impl HttpRefresher {
    pub fn new(client: reqwest::Client, api_key: String, floor: Duration, deadline: Duration) -> Self {
        Self {
            client,
            api_key,
            floor,
            deadline,
        }
    }
}

impl Refresher for HttpRefresher {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
        last_refresh_at: u64,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Refreshed, RefreshError>> + Send + 'a>>
    {
        Box::pin(async move {
            if let Some(retry_after) = floor_remaining(last_refresh_at, now_millis(), self.floor) {
                debug!(?retry_after, "refresh floor not met");
                return Err(RefreshError::TooSoon { retry_after });
            }

            let response = tokio::time::timeout(
                self.deadline,
                warp_auth::refresh_id_token(&self.client, &self.api_key, refresh_token),
            )
            .await
            .map_err(|_| {
                RefreshError::Failed(format!(
                    "token endpoint did not answer within {:?}",
                    self.deadline
                ))
            })?
            .map_err(|e| RefreshError::Failed(e.to_string()))?;

            let now = now_millis();
            Ok(Refreshed {
                access_token: response.access_token,
                refresh_token: response.refresh_token,
                expires_at: now + response.expires_in * 1_000,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3_600);

    #[test]
    fn floor_blocks_at_59_minutes() {
        let last = 1_000_000_000_000u64;
        let now = last + 59 * 60 * 1_000;
        let remaining = floor_remaining(last, now, HOUR).expect("must be too soon");
        assert_eq!(remaining, Duration::from_secs(60));
    }

    #[test]
    fn floor_allows_at_exactly_60_minutes() {
        let last = 1_000_000_000_000u64;
        let now = last + 60 * 60 * 1_000;
        assert!(floor_remaining(last, now, HOUR).is_none());
    }

    #[test]
    fn floor_allows_after_60_minutes() {
        let last = 1_000_000_000_000u64;
        let now = last + 61 * 60 * 1_000;
        assert!(floor_remaining(last, now, HOUR).is_none());
    }

    #[test]
    fn floor_tolerates_clock_skew_before_last_refresh() {
        // now earlier than last_refresh_at must not underflow
        let last = 1_000_000_000_000u64;
        let now = last - 5_000;
        assert!(floor_remaining(last, now, HOUR).is_some());
    }

    #[tokio::test]
    async fn http_refresher_enforces_floor_without_network() {
        // Floor check happens before any I/O: a refresher pointed at nothing
        // still answers TooSoon immediately.
        let refresher = HttpRefresher::new(
            reqwest::Client::new(),
            "key".into(),
            HOUR,
            Duration::from_secs(5),
        );
        let result = refresher.refresh("rt_x", now_millis()).await;
        assert!(matches!(result, Err(RefreshError::TooSoon { .. })));
    }
}
