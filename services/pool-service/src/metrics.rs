//! Prometheus metrics exposition
//!
//! The pool crate emits:
//!
//! - `pool_accounts` (gauge): label `status`
//! - `pool_leases_granted_total` / `pool_leases_released_total` /
//!   `pool_leases_reaped_total` (counters)
//! - `pool_registrations_total` (counter): label `outcome`
//! - `pool_token_refreshes_total` (counter): label `outcome`
//!
//! The service adds `pool_registration_duration_seconds` (histogram).

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering
/// metrics.
///
/// Configures `pool_registration_duration_seconds` with explicit buckets so
/// it renders as a histogram rather than the default summary. Registration
/// runs an email round trip, so buckets span 1s to 300s.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "pool_registration_duration_seconds".to_string(),
            ),
            &[1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 60.0, 120.0, 180.0, 300.0],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record how long one registration attempt took, successful or not.
pub fn record_registration_duration(duration_secs: f64) {
    metrics::histogram!("pool_registration_duration_seconds").record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_registration_duration(12.5);
    }

    /// Create an isolated recorder/handle pair for unit tests. Only one
    /// global recorder can exist per process, so install_recorder() cannot
    /// be called from tests.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "pool_registration_duration_seconds".to_string(),
                ),
                &[1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 60.0, 120.0, 180.0, 300.0],
            )
            .expect("failed to set histogram buckets")
            .build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn registration_duration_renders_as_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_registration_duration(12.5);

        let output = handle.render();
        assert!(
            output.contains("pool_registration_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
        assert!(output.contains("le=\"60\""), "60s bucket must exist");
        assert!(output.contains("le=\"+Inf\""), "+Inf bucket must exist");
    }
}
