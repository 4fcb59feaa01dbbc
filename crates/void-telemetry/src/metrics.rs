//! Prometheus metrics for VoidCore.
//!
//! All metrics follow the naming convention: `void_<area>_<metric>_<unit>`
//!
//! Labels stay low-cardinality: channels, outcomes and transport kinds,
//! never message or intent types.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

use crate::TelemetryError;

lazy_static! {
    /// Registry holding every VoidCore metric
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // PUBLISH PATH
    // =========================================================================

    /// Messages published, by virtual channel
    pub static ref MESSAGES_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("void_bus_messages_published_total", "Messages published"),
        &["channel"]
    ).expect("metric creation failed");

    /// Handler deliveries across all publishes
    pub static ref MESSAGES_DELIVERED: Counter = Counter::new(
        "void_bus_messages_delivered_total",
        "Handlers a published message was delivered to"
    ).expect("metric creation failed");

    pub static ref PUBLISHES_REJECTED: Counter = Counter::new(
        "void_bus_publishes_rejected_total",
        "Publishes rejected for a missing message type"
    ).expect("metric creation failed");

    // =========================================================================
    // INTENTS AND REQUESTS
    // =========================================================================

    pub static ref INTENTS: CounterVec = CounterVec::new(
        Opts::new("void_intent_dispatched_total", "Intents dispatched"),
        &["outcome"]  // success/failure
    ).expect("metric creation failed");

    pub static ref INTENT_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "void_intent_duration_seconds",
            "Time spent in intent handlers"
        ).buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0])
    ).expect("metric creation failed");

    /// Correlated requests, by outcome (resolved/timed_out/dropped)
    pub static ref REQUESTS: CounterVec = CounterVec::new(
        Opts::new("void_requests_total", "Correlated requests completed"),
        &["outcome"]
    ).expect("metric creation failed");

    // =========================================================================
    // TRANSPORT AND PLUGINS
    // =========================================================================

    pub static ref TRANSPORT_SWAPS: CounterVec = CounterVec::new(
        Opts::new("void_transport_swaps_total", "Live transport replacements"),
        &["from", "to"]
    ).expect("metric creation failed");

    pub static ref PLUGINS_REGISTERED: Gauge = Gauge::new(
        "void_plugins_registered",
        "Plugins currently in the plugin store"
    ).expect("metric creation failed");
}

/// Register every metric with [`REGISTRY`]. Calling it again is harmless.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(MESSAGES_PUBLISHED.clone()),
        Box::new(MESSAGES_DELIVERED.clone()),
        Box::new(PUBLISHES_REJECTED.clone()),
        Box::new(INTENTS.clone()),
        Box::new(INTENT_DURATION.clone()),
        Box::new(REQUESTS.clone()),
        Box::new(TRANSPORT_SWAPS.clone()),
        Box::new(PLUGINS_REGISTERED.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

pub fn record_publish(channel: &str, delivered: usize) {
    crate::metric_inc!(MESSAGES_PUBLISHED, &[channel]);
    MESSAGES_DELIVERED.inc_by(delivered as f64);
}

pub fn record_publish_rejected() {
    crate::metric_inc!(PUBLISHES_REJECTED);
}

pub fn record_intent(success: bool, seconds: f64) {
    let outcome = if success { "success" } else { "failure" };
    crate::metric_inc!(INTENTS, &[outcome]);
    INTENT_DURATION.observe(seconds);
}

pub fn record_request(outcome: &str) {
    crate::metric_inc!(REQUESTS, &[outcome]);
}

pub fn record_transport_swap(from: &str, to: &str) {
    crate::metric_inc!(TRANSPORT_SWAPS, &[from, to]);
}

pub fn set_plugin_count(count: usize) {
    PLUGINS_REGISTERED.set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice() {
        register_metrics().unwrap();
        register_metrics().unwrap();
    }

    #[test]
    fn test_publish_counters() {
        let before = MESSAGES_DELIVERED.get();
        record_publish("notice", 3);
        assert!(MESSAGES_DELIVERED.get() >= before + 3.0);
        assert!(MESSAGES_PUBLISHED.with_label_values(&["notice"]).get() >= 1.0);
    }

    #[test]
    fn test_encode_contains_registered_metrics() {
        register_metrics().unwrap();
        record_intent(true, 0.002);
        set_plugin_count(4);

        let text = encode_metrics().unwrap();
        assert!(text.contains("void_intent_dispatched_total"));
        assert!(text.contains("void_plugins_registered 4"));
    }
}
