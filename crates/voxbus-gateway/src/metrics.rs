//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

/// Record a new WebSocket connection.
pub fn record_ws_connect() {
    metrics::gauge!("voxbus_ws_connections_active").increment(1.0);
}

/// Record a WebSocket disconnection.
pub fn record_ws_disconnect() {
    metrics::gauge!("voxbus_ws_connections_active").decrement(1.0);
}

/// Record a WS method request with its duration.
pub fn record_request(method: &str, duration_secs: f64) {
    let labels = [("method", method.to_string())];
    metrics::counter!("voxbus_requests_total", &labels).increment(1);
    metrics::histogram!("voxbus_request_duration_seconds", &labels).record(duration_secs);
}

/// Record an arbitration outcome: `accepted` or a rejection reason.
pub fn record_decision(outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("voxbus_proposals_total", &labels).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_prometheus_recorder() {
        // One recorder per process; this is the only test that installs it.
        let handle = install_prometheus_recorder().unwrap();
        record_decision("accepted");
        let output = handle.render();
        assert!(output.contains("voxbus_proposals_total"));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_request("state.get", 0.002);
        record_ws_connect();
        record_ws_disconnect();
    }
}
