//! Bridge from bus metrics hooks to the Prometheus registry.

use std::time::Duration;

use void_bus::{ChannelName, MetricsRecorder, RequestOutcome};
use void_telemetry::metrics;

/// Forwards every bus event to the `void-telemetry` Prometheus metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusRecorder;

impl MetricsRecorder for PrometheusRecorder {
    fn record_publish(&self, _message_type: &str, channel: ChannelName, delivered: usize) {
        metrics::record_publish(channel.as_str(), delivered);
    }

    fn record_publish_rejected(&self) {
        metrics::record_publish_rejected();
    }

    fn record_intent(&self, _intent_type: &str, success: bool, elapsed: Duration) {
        metrics::record_intent(success, elapsed.as_secs_f64());
    }

    fn record_request(&self, _intent_type: &str, outcome: RequestOutcome) {
        metrics::record_request(outcome.as_str());
    }

    fn record_transport_swap(&self, from: &str, to: &str) {
        metrics::record_transport_swap(from, to);
    }
}
