//! Metrics hooks for bus operations.
//!
//! [`BusMetrics`] keeps in-process counters that back `VoidCore::stats()`.
//! External systems plug in through [`MetricsRecorder`]; the facade calls
//! both on every operation.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::channel::ChannelName;

/// How a correlated request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Resolved,
    TimedOut,
    Dropped,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::TimedOut => "timed_out",
            Self::Dropped => "dropped",
        }
    }
}

/// Thread-safe counters for bus activity.
#[derive(Debug, Default)]
pub struct BusMetrics {
    pub messages_published: AtomicU64,
    pub messages_delivered: AtomicU64,
    /// Publishes rejected for a missing message type.
    pub publishes_rejected: AtomicU64,
    pub intents_dispatched: AtomicU64,
    pub intents_failed: AtomicU64,
    pub requests_resolved: AtomicU64,
    pub requests_timed_out: AtomicU64,
    pub requests_dropped: AtomicU64,
    pub transport_swaps: AtomicU64,
    /// Cumulative intent handling time in nanoseconds
    pub intent_time_ns: AtomicU64,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            publishes_rejected: self.publishes_rejected.load(Ordering::Relaxed),
            intents_dispatched: self.intents_dispatched.load(Ordering::Relaxed),
            intents_failed: self.intents_failed.load(Ordering::Relaxed),
            requests_resolved: self.requests_resolved.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            requests_dropped: self.requests_dropped.load(Ordering::Relaxed),
            transport_swaps: self.transport_swaps.load(Ordering::Relaxed),
            avg_intent_ns: self.avg_intent_time_ns(),
        }
    }

    pub fn avg_intent_time_ns(&self) -> u64 {
        let total = self.intent_time_ns.load(Ordering::Relaxed);
        let count = self.intents_dispatched.load(Ordering::Relaxed);
        if count > 0 {
            total / count
        } else {
            0
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.messages_published,
            &self.messages_delivered,
            &self.publishes_rejected,
            &self.intents_dispatched,
            &self.intents_failed,
            &self.requests_resolved,
            &self.requests_timed_out,
            &self.requests_dropped,
            &self.transport_swaps,
            &self.intent_time_ns,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMetricsSnapshot {
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub publishes_rejected: u64,
    pub intents_dispatched: u64,
    pub intents_failed: u64,
    pub requests_resolved: u64,
    pub requests_timed_out: u64,
    pub requests_dropped: u64,
    pub transport_swaps: u64,
    pub avg_intent_ns: u64,
}

/// Trait for custom metrics recording implementations.
///
/// Implement this to export bus activity to Prometheus or similar.
pub trait MetricsRecorder: Send + Sync {
    fn record_publish(&self, message_type: &str, channel: ChannelName, delivered: usize);

    fn record_publish_rejected(&self);

    fn record_intent(&self, intent_type: &str, success: bool, elapsed: Duration);

    fn record_request(&self, intent_type: &str, outcome: RequestOutcome);

    fn record_transport_swap(&self, from: &str, to: &str);
}

impl MetricsRecorder for BusMetrics {
    fn record_publish(&self, _message_type: &str, _channel: ChannelName, delivered: usize) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.messages_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
    }

    fn record_publish_rejected(&self) {
        self.publishes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn record_intent(&self, _intent_type: &str, success: bool, elapsed: Duration) {
        self.intents_dispatched.fetch_add(1, Ordering::Relaxed);
        self.intent_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        if !success {
            self.intents_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_request(&self, _intent_type: &str, outcome: RequestOutcome) {
        let counter = match outcome {
            RequestOutcome::Resolved => &self.requests_resolved,
            RequestOutcome::TimedOut => &self.requests_timed_out,
            RequestOutcome::Dropped => &self.requests_dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_transport_swap(&self, _from: &str, _to: &str) {
        self.transport_swaps.fetch_add(1, Ordering::Relaxed);
    }
}

/// No-op metrics recorder for when metrics are disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl MetricsRecorder for NoOpMetrics {
    fn record_publish(&self, _: &str, _: ChannelName, _: usize) {}
    fn record_publish_rejected(&self) {}
    fn record_intent(&self, _: &str, _: bool, _: Duration) {}
    fn record_request(&self, _: &str, _: RequestOutcome) {}
    fn record_transport_swap(&self, _: &str, _: &str) {}
}
