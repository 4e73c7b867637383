//! Warp Account Pool Service
//!
//! Single-binary Rust service that:
//! 1. Loads the persisted account pool from disk
//! 2. Keeps it topped up via email-link registration
//! 3. Renews tokens ahead of expiry under a per-account rate floor
//! 4. Leases accounts to callers over an HTTP control API

mod api;
mod config;
mod metrics;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use account_pool::{
    AccountStore, HttpRefresher, IdentitySource, Pool, PoolConfig, Registered, Registrar,
    RegistrationError, ReplenishConfig, WarpRegistrar,
};
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warp_auth::MailboxClient;

use crate::api::AppState;
use crate::config::Config;

/// Wraps the real registrar to time each attempt for the registration
/// duration histogram.
struct TimedRegistrar {
    inner: WarpRegistrar,
}

impl Registrar for TimedRegistrar {
    fn register(
        &self,
        deadline: Duration,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Registered, RegistrationError>> + Send + '_>>
    {
        Box::pin(async move {
            let started = std::time::Instant::now();
            let outcome = self.inner.register(deadline).await;
            metrics::record_registration_duration(started.elapsed().as_secs_f64());
            outcome
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting warp-pool-service");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        store_path = %config.pool.store_path.display(),
        min_size = config.pool.min_size,
        max_size = config.pool.max_size,
        sources = config.identity.sources.len(),
        "configuration loaded"
    );

    let store = AccountStore::load(config.pool.store_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to load account store from {}",
                config.pool.store_path.display()
            )
        })?;
    info!(accounts = store.len().await, "account store loaded");

    let firebase_api_key = config
        .identity
        .firebase_api_key
        .as_ref()
        .map(|k| k.expose().clone())
        .context("firebase API key missing after config validation")?;
    let mailbox_api_key = config
        .identity
        .mailbox_api_key
        .as_ref()
        .map(|k| k.expose().clone())
        .unwrap_or_default();

    let http = reqwest::Client::new();

    let refresher = Arc::new(HttpRefresher::new(
        http.clone(),
        firebase_api_key.clone(),
        Duration::from_secs(config.pool.refresh_floor_secs),
        Duration::from_secs(config.refresh.deadline_secs),
    ));

    let sources: Vec<IdentitySource> = config
        .identity
        .sources
        .iter()
        .map(|s| IdentitySource {
            name: s.name.clone(),
            mailbox: MailboxClient::new(http.clone(), s.base_url.clone(), mailbox_api_key.clone()),
            domains: s.domains.clone(),
        })
        .collect();
    let registrar = Arc::new(TimedRegistrar {
        inner: WarpRegistrar::new(
            http.clone(),
            firebase_api_key,
            sources,
            Duration::from_secs(config.identity.challenge_timeout_secs),
            Duration::from_secs(5),
        ),
    });

    let pool_config = PoolConfig {
        min_size: config.pool.min_size,
        max_size: config.pool.max_size,
        accounts_per_request: config.pool.accounts_per_request,
        lease_ttl: Duration::from_secs(config.pool.lease_ttl_secs),
        degraded_retry_threshold: config.pool.degraded_retry_threshold,
        stuck_grace: Duration::from_secs(config.pool.stuck_grace_secs),
        allocation_policy: config.pool.allocation_policy,
    };
    let pool = Arc::new(Pool::new(pool_config, Arc::new(store), refresher.clone()));

    let replenish_config = ReplenishConfig {
        interval: Duration::from_secs(config.replenish.interval_secs),
        registration_deadline: Duration::from_secs(config.replenish.registration_deadline_secs),
        backoff_base: Duration::from_secs(config.replenish.backoff_base_secs),
        backoff_cap: Duration::from_secs(config.replenish.backoff_cap_secs),
        max_attempts: config.replenish.max_attempts,
    };
    let refresh_margin = Duration::from_secs(config.refresh.margin_secs);

    account_pool::spawn_replenish_task(pool.clone(), registrar.clone(), replenish_config.clone());
    account_pool::spawn_refresh_task(
        pool.clone(),
        refresher.clone(),
        Duration::from_secs(config.refresh.interval_secs),
        refresh_margin,
    );

    let app_state = AppState {
        pool,
        registrar,
        refresher,
        replenish: replenish_config,
        refresh_margin,
        started_at: std::time::Instant::now(),
        prometheus: prometheus_handle,
    };

    let app = api::build_router(app_state, config.server.max_connections);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;

    info!(addr = %config.server.listen_addr, "accepting requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
