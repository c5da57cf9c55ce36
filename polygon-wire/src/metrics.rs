use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// The error taxonomy each service classifies its failures into. Distinct
/// from `WireError` (a parse failure) — this is what backs the "drops by
/// reason" counters and the field a log line stamps when something goes
/// wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    SlowConsumer,
    ProtocolError,
    SubscriptionLimitExceeded,
    AuthFailed,
}

impl DropReason {
    fn as_str(self) -> &'static str {
        match self {
            DropReason::SlowConsumer => "slow_consumer",
            DropReason::ProtocolError => "protocol_error",
            DropReason::SubscriptionLimitExceeded => "subscription_limit_exceeded",
            DropReason::AuthFailed => "auth_failed",
        }
    }
}

/// Plain atomic counters, no exporter attached. Each binary periodically
/// logs a `snapshot()` rather than serving a `/metrics` endpoint.
#[derive(Debug, Default)]
pub struct Metrics {
    reconnects: AtomicU64,
    frames_total: AtomicU64,
    clients_connected: AtomicU64,
    subscriptions_active: AtomicU64,
    drops_slow_consumer: AtomicU64,
    drops_protocol_error: AtomicU64,
    drops_subscription_limit: AtomicU64,
    drops_auth_failed: AtomicU64,
    aggregation_anomalies: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame(&self) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_connected(&self) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.clients_connected.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn subscription_added(&self) {
        self.subscriptions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_removed(&self) {
        self.subscriptions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::SlowConsumer => &self.drops_slow_consumer,
            DropReason::ProtocolError => &self.drops_protocol_error,
            DropReason::SubscriptionLimitExceeded => &self.drops_subscription_limit,
            DropReason::AuthFailed => &self.drops_auth_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(reason = reason.as_str(), "recorded drop");
    }

    pub fn record_aggregation_anomaly(&self) {
        self.aggregation_anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reconnects: self.reconnects.load(Ordering::Relaxed),
            frames_total: self.frames_total.load(Ordering::Relaxed),
            clients_connected: self.clients_connected.load(Ordering::Relaxed),
            subscriptions_active: self.subscriptions_active.load(Ordering::Relaxed),
            drops_slow_consumer: self.drops_slow_consumer.load(Ordering::Relaxed),
            drops_protocol_error: self.drops_protocol_error.load(Ordering::Relaxed),
            drops_subscription_limit: self.drops_subscription_limit.load(Ordering::Relaxed),
            drops_auth_failed: self.drops_auth_failed.load(Ordering::Relaxed),
            aggregation_anomalies: self.aggregation_anomalies.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub reconnects: u64,
    pub frames_total: u64,
    pub clients_connected: u64,
    pub subscriptions_active: u64,
    pub drops_slow_consumer: u64,
    pub drops_protocol_error: u64,
    pub drops_subscription_limit: u64,
    pub drops_auth_failed: u64,
    pub aggregation_anomalies: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = Metrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.frames_total, 0);
        assert_eq!(snap.clients_connected, 0);
    }

    #[test]
    fn client_connect_disconnect_nets_to_zero() {
        let metrics = Metrics::new();
        metrics.client_connected();
        metrics.client_connected();
        metrics.client_disconnected();
        assert_eq!(metrics.snapshot().clients_connected, 1);
    }

    #[test]
    fn drops_bucket_by_reason() {
        let metrics = Metrics::new();
        metrics.record_drop(DropReason::SlowConsumer);
        metrics.record_drop(DropReason::SlowConsumer);
        metrics.record_drop(DropReason::ProtocolError);
        let snap = metrics.snapshot();
        assert_eq!(snap.drops_slow_consumer, 2);
        assert_eq!(snap.drops_protocol_error, 1);
        assert_eq!(snap.drops_auth_failed, 0);
    }
}
