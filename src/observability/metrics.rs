//! Metrics collection and exposition.
//!
//! # Metrics
//! - `balancer_picks_total` (counter): picks by outcome
//! - `balancer_ready_sub_conns` (gauge): size of the usable set, by target
//! - `balancer_sub_conn_transitions_total` (counter): state changes by state
//! - `balancer_resolver_errors_total` (counter): failed resolutions
//! - `balancer_calls_total` (counter): finished calls by node and outcome
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - Prometheus exporter is opt-in via configuration

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => {
            tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter")
        }
    }
}

pub fn record_pick(outcome: &'static str) {
    ::metrics::counter!("balancer_picks_total", "outcome" => outcome).increment(1);
}

pub fn record_ready_sub_conns(target: &str, count: usize) {
    ::metrics::gauge!("balancer_ready_sub_conns", "target" => target.to_string()).set(count as f64);
}

pub fn record_sub_conn_transition(state: &'static str) {
    ::metrics::counter!("balancer_sub_conn_transitions_total", "state" => state).increment(1);
}

pub fn record_resolver_error() {
    ::metrics::counter!("balancer_resolver_errors_total").increment(1);
}

pub fn record_call_done(node: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    ::metrics::counter!(
        "balancer_calls_total",
        "node" => node.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}


#[cfg(test)]
mod tests {
    use super::capture::CapturingRecorder;
    use super::*;

    #[test]
    fn test_ready_gauge_is_per_target() {
        let recorder = CapturingRecorder::default();
        ::metrics::with_local_recorder(&recorder, || {
            record_ready_sub_conns("orders", 2);
            record_ready_sub_conns("billing", 1);
        });

        assert_eq!(
            recorder.value("balancer_ready_sub_conns{target=orders}"),
            Some(2.0)
        );
        assert_eq!(
            recorder.value("balancer_ready_sub_conns{target=billing}"),
            Some(1.0)
        );
    }

    #[test]
    fn test_call_outcome_labels() {
        let recorder = CapturingRecorder::default();
        ::metrics::with_local_recorder(&recorder, || {
            record_call_done("node-a", true);
            record_call_done("node-a", true);
            record_call_done("node-a", false);
        });

        assert_eq!(
            recorder.value("balancer_calls_total{node=node-a,outcome=success}"),
            Some(2.0)
        );
        assert_eq!(
            recorder.value("balancer_calls_total{node=node-a,outcome=failure}"),
            Some(1.0)
        );
    }
}
