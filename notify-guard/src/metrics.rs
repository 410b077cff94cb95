//! Metrics sink capability and an in-process collector.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;
use crate::notification::NotificationType;
use crate::resilience::CircuitState;

/// Receiver for delivery metrics, keyed by destination name.
///
/// Every method has an empty default so sinks only implement what they
/// export.
pub trait MetricsSink: Send + Sync {
    /// A dispatch to `destination` finished with `outcome`.
    fn record_delivery(
        &self,
        _destination: &str,
        _notification_type: NotificationType,
        _outcome: &str,
        _duration: Duration,
    ) {
    }

    /// A notification did not match the destination's filter.
    fn record_filtered(&self, _destination: &str, _notification_type: NotificationType) {}

    /// The destination's rate limiter rejected a notification.
    fn record_rate_limited(&self, _destination: &str) {}

    /// A retry attempt is about to start.
    fn record_retry(&self, _destination: &str, _attempt: u32) {}

    /// A failed attempt, classified for observability.
    fn record_error(&self, _destination: &str, _category: ErrorCategory) {}

    /// The destination's breaker changed state.
    fn record_circuit_state(&self, _destination: &str, _state: CircuitState) {}

    /// A health probe or live send updated the destination's health.
    fn record_health(&self, _destination: &str, _healthy: bool) {}

    /// Current consecutive-failure count on the destination's breaker.
    fn record_consecutive_failures(&self, _destination: &str, _failures: u32) {}
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {}

fn bump(map: &DashMap<String, AtomicU64>, key: String, by: u64) {
    map.entry(key)
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(by, Ordering::Relaxed);
}

fn set(map: &DashMap<String, AtomicU64>, key: &str, value: u64) {
    map.entry(key.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .store(value, Ordering::Relaxed);
}

fn drain(map: &DashMap<String, AtomicU64>) -> BTreeMap<String, u64> {
    map.iter()
        .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
        .collect()
}

/// In-process metrics collector.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    // Keyed by "destination:type:outcome".
    deliveries: DashMap<String, AtomicU64>,
    delivery_duration_total_ms: DashMap<String, AtomicU64>,
    // Keyed by destination.
    filtered: DashMap<String, AtomicU64>,
    rate_limited: DashMap<String, AtomicU64>,
    retries: DashMap<String, AtomicU64>,
    // Keyed by "destination:category".
    errors: DashMap<String, AtomicU64>,

    // Gauges, keyed by destination.
    circuit_state: DashMap<String, AtomicU64>,
    healthy: DashMap<String, AtomicU64>,
    consecutive_failures: DashMap<String, AtomicU64>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries recorded for a destination and outcome, across types.
    pub fn deliveries(&self, destination: &str, outcome: &str) -> u64 {
        let prefix = format!("{destination}:");
        let suffix = format!(":{outcome}");
        self.deliveries
            .iter()
            .filter(|e| e.key().starts_with(&prefix) && e.key().ends_with(&suffix))
            .map(|e| e.value().load(Ordering::Relaxed))
            .sum()
    }

    pub fn circuit_state(&self, destination: &str) -> Option<u64> {
        self.circuit_state
            .get(destination)
            .map(|v| v.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            deliveries: drain(&self.deliveries),
            delivery_duration_total_ms: drain(&self.delivery_duration_total_ms),
            filtered: drain(&self.filtered),
            rate_limited: drain(&self.rate_limited),
            retries: drain(&self.retries),
            errors: drain(&self.errors),
            circuit_state: drain(&self.circuit_state),
            healthy: drain(&self.healthy),
            consecutive_failures: drain(&self.consecutive_failures),
        }
    }
}

impl MetricsSink for MetricsCollector {
    fn record_delivery(
        &self,
        destination: &str,
        notification_type: NotificationType,
        outcome: &str,
        duration: Duration,
    ) {
        bump(
            &self.deliveries,
            format!("{destination}:{notification_type}:{outcome}"),
            1,
        );
        bump(
            &self.delivery_duration_total_ms,
            destination.to_string(),
            duration.as_millis() as u64,
        );
    }

    fn record_filtered(&self, destination: &str, _notification_type: NotificationType) {
        bump(&self.filtered, destination.to_string(), 1);
    }

    fn record_rate_limited(&self, destination: &str) {
        bump(&self.rate_limited, destination.to_string(), 1);
    }

    fn record_retry(&self, destination: &str, _attempt: u32) {
        bump(&self.retries, destination.to_string(), 1);
    }

    fn record_error(&self, destination: &str, category: ErrorCategory) {
        bump(&self.errors, format!("{destination}:{category}"), 1);
    }

    fn record_circuit_state(&self, destination: &str, state: CircuitState) {
        set(&self.circuit_state, destination, state.as_gauge());
    }

    fn record_health(&self, destination: &str, healthy: bool) {
        set(&self.healthy, destination, u64::from(healthy));
    }

    fn record_consecutive_failures(&self, destination: &str, failures: u32) {
        set(&self.consecutive_failures, destination, u64::from(failures));
    }
}

/// Point-in-time copy of every collected metric.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub deliveries: BTreeMap<String, u64>,
    pub delivery_duration_total_ms: BTreeMap<String, u64>,
    pub filtered: BTreeMap<String, u64>,
    pub rate_limited: BTreeMap<String, u64>,
    pub retries: BTreeMap<String, u64>,
    pub errors: BTreeMap<String, u64>,
    pub circuit_state: BTreeMap<String, u64>,
    pub healthy: BTreeMap<String, u64>,
    pub consecutive_failures: BTreeMap<String, u64>,
}
