//! Prometheus metrics exposition
//!
//! Gateway metrics:
//!
//! - `gateway_requests_total` (counter): labels `route`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `route`
//! - `gateway_leases_total` (counter): label `event`
//!
//! The quota crate adds `quota_decisions_total`, `credential_transitions_total`
//! and the `pool_credentials` gauge through the same recorder.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

fn builder() -> Result<PrometheusBuilder, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("gateway_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
///
/// Request durations render as a histogram with `_bucket` lines. Gateway
/// calls never leave the process, so buckets stop at one second.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record a handled request.
pub fn record_request(route: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "gateway_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "route" => route.to_string())
        .record(duration_secs);
}

/// Record a lease lifecycle event: `acquired`, `released`, `expired`, `rejected`.
pub fn record_lease(event: &'static str) {
    metrics::counter!("gateway_leases_total", "event" => event).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request("/health", 200, 0.001);
        record_lease("acquired");
    }

    #[test]
    fn record_request_renders_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("/v1/leases", 200, 0.0004);
        record_request("/v1/leases", 429, 0.0002);

        let output = handle.render();
        assert!(output.contains("gateway_requests_total"), "{output}");
        assert!(output.contains("route=\"/v1/leases\""), "{output}");
        assert!(output.contains("status=\"429\""), "{output}");
        assert!(
            output.contains("gateway_request_duration_seconds_bucket"),
            "histogram must render _bucket lines, got: {output}"
        );
        assert!(output.contains("le=\"0.0005\""), "{output}");
        assert!(output.contains("le=\"+Inf\""), "{output}");
    }

    #[test]
    fn record_lease_counts_by_event() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_lease("acquired");
        record_lease("expired");

        let output = handle.render();
        assert!(output.contains("gateway_leases_total"), "{output}");
        assert!(output.contains("event=\"acquired\""), "{output}");
        assert!(output.contains("event=\"expired\""), "{output}");
    }
}
