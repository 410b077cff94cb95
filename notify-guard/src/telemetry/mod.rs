//! Upstream telemetry for delivery failures and breaker transitions.
//!
//! Everything reported here is scrubbed with [`privacy`] first. Operators get
//! the two transitions they care about most (initial failure, recovery) even
//! when a destination flaps; see [`TelemetryDebouncer`].

pub mod debouncer;
pub mod privacy;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::debug;

pub use debouncer::{DEFAULT_MIN_REPORT_INTERVAL, TelemetryDebouncer};

use crate::Error;
use crate::config::{CircuitBreakerConfig, TelemetryConfig};
use crate::error::ErrorCategory;
use crate::resilience::CircuitState;

/// Severity attached to a telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TelemetryLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl TelemetryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for TelemetryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External reporting sink (error tracker, event collector).
pub trait TelemetryReporter: Send + Sync {
    fn capture_event(
        &self,
        message: &str,
        level: TelemetryLevel,
        tags: &BTreeMap<String, String>,
        contexts: &Value,
    );

    fn is_enabled(&self) -> bool;
}

/// Reporter that is always disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetryReporter;

impl TelemetryReporter for NoopTelemetryReporter {
    fn capture_event(&self, _: &str, _: TelemetryLevel, _: &BTreeMap<String, String>, _: &Value) {
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Connection-level failures point at user configuration (service down,
/// wrong port, DNS), not at something worth an upstream report.
fn is_connection_error(err: &Error) -> bool {
    if let Error::Provider(p) = err
        && p.category == Some(ErrorCategory::Network)
    {
        return true;
    }
    let msg = err.to_string().to_lowercase();
    [
        "connection refused",
        "connection reset",
        "connection closed",
        "no route to host",
        "network is unreachable",
        "network unreachable",
        "host is down",
        "no such host",
        "dns error",
        "broken pipe",
        "connection timed out",
    ]
    .iter()
    .any(|pattern| msg.contains(pattern))
}

fn tags<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    let mut tags: BTreeMap<String, String> = pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    tags.insert("component".to_string(), "notification".to_string());
    tags
}

/// Privacy-safe telemetry for the delivery layer.
pub struct NotificationTelemetry {
    config: TelemetryConfig,
    reporter: Arc<dyn TelemetryReporter>,
    debouncer: TelemetryDebouncer,
}

impl NotificationTelemetry {
    pub fn new(config: TelemetryConfig, reporter: Arc<dyn TelemetryReporter>) -> Self {
        let debouncer = TelemetryDebouncer::new(config.min_report_interval());
        Self {
            config,
            reporter,
            debouncer,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.reporter.is_enabled()
    }

    /// Report a breaker transition, subject to debouncing.
    pub fn circuit_breaker_transition(
        &self,
        destination: &str,
        from: CircuitState,
        to: CircuitState,
        consecutive_failures: u32,
        time_in_previous_state: Duration,
        breaker: &CircuitBreakerConfig,
    ) {
        if !self.is_enabled() || !self.debouncer.should_report(destination, from, to) {
            return;
        }

        let level = if to == CircuitState::Open {
            TelemetryLevel::Warning
        } else {
            TelemetryLevel::Info
        };
        let message = format!("Circuit breaker state transition: {from} -> {to}");
        let tags = tags([
            ("provider", destination.to_string()),
            ("old_state", from.to_string()),
            ("new_state", to.to_string()),
            ("consecutive_failures", consecutive_failures.to_string()),
        ]);
        let contexts = json!({
            "circuit_breaker": {
                "failure_threshold": breaker.max_failures,
                "timeout_seconds": breaker.timeout_secs,
                "half_open_max_requests": breaker.half_open_max_requests,
                "time_in_previous_state_seconds": time_in_previous_state.as_secs_f64(),
            }
        });
        self.reporter.capture_event(&message, level, &tags, &contexts);
    }

    /// Report a failed send.
    ///
    /// Cancellations and connection-level errors are not reported. Timeouts and
    /// 4xx responses are warnings; everything else is an error.
    pub fn provider_request_error(&self, destination: &str, err: &Error, endpoint: Option<&str>) {
        if !self.is_enabled() || err.is_cancelled() || is_connection_error(err) {
            return;
        }

        let status_code = match err {
            Error::Provider(p) => p.status_code,
            _ => None,
        };
        let is_timeout = ErrorCategory::classify(err) == ErrorCategory::Timeout;
        let level = match status_code {
            _ if is_timeout => TelemetryLevel::Warning,
            Some(400..=499) => TelemetryLevel::Warning,
            _ => TelemetryLevel::Error,
        };

        let message = if is_timeout {
            "Provider request timed out".to_string()
        } else {
            privacy::scrub_message(&format!("Provider request failed: {err}"))
        };
        let endpoint_hash = endpoint.map(privacy::anonymize_url).unwrap_or_default();
        let tags = tags([
            ("provider", destination.to_string()),
            (
                "status_code",
                status_code.map(|c| c.to_string()).unwrap_or_default(),
            ),
            ("endpoint_hash", endpoint_hash.clone()),
            ("is_timeout", is_timeout.to_string()),
            ("error_category", ErrorCategory::classify(err).to_string()),
        ]);
        let contexts = json!({
            "request": {
                "endpoint_hash": endpoint_hash,
                "is_timeout": is_timeout,
                "retryable": err.is_retryable(),
            }
        });
        self.reporter.capture_event(&message, level, &tags, &contexts);
    }

    /// Report a provider that could not be registered.
    pub fn provider_initialization_error(&self, destination: &str, error_type: &str, err: &Error) {
        if !self.is_enabled() {
            return;
        }
        let message = format!(
            "Provider initialization failed: {}",
            privacy::scrub_message(&err.to_string())
        );
        let tags = tags([
            ("provider", destination.to_string()),
            ("error_type", error_type.to_string()),
        ]);
        let contexts = json!({ "initialization": { "error_type": error_type } });
        self.reporter
            .capture_event(&message, TelemetryLevel::Error, &tags, &contexts);
    }

    /// Report a panic caught in a worker task.
    pub fn worker_panic_recovered(
        &self,
        worker_type: &str,
        panic_message: &str,
        events_processed: u64,
        events_dropped: u64,
    ) {
        if !self.is_enabled() {
            return;
        }
        let message = privacy::scrub_message(&format!("Worker panic recovered: {panic_message}"));
        let tags = tags([("worker_type", worker_type.to_string())]);
        let contexts = json!({
            "worker_state": {
                "events_processed": events_processed,
                "events_dropped": events_dropped,
            }
        });
        self.reporter
            .capture_event(&message, TelemetryLevel::Critical, &tags, &contexts);
    }

    /// Report sustained rate limiting on a destination.
    ///
    /// Only drop rates at or above the configured threshold are reported.
    pub fn rate_limit_exceeded(
        &self,
        destination: &str,
        dropped: u64,
        drop_rate_percent: f64,
        requests_per_minute: u32,
    ) {
        if !self.is_enabled() {
            return;
        }
        let threshold = if self.config.rate_limit_report_threshold > 0.0 {
            self.config.rate_limit_report_threshold
        } else {
            50.0
        };
        if drop_rate_percent < threshold {
            debug!(
                destination,
                drop_rate_percent, threshold, "Rate limit drop rate below report threshold"
            );
            return;
        }

        let message = format!(
            "Notification rate limit exceeded: {dropped} events dropped ({drop_rate_percent:.1}% drop rate)"
        );
        let tags = tags([
            ("provider", destination.to_string()),
            ("subsystem", "rate_limiter".to_string()),
            ("drop_rate", format!("{drop_rate_percent:.1}")),
        ]);
        let contexts = json!({
            "rate_limiter": {
                "requests_per_minute": requests_per_minute,
                "dropped_count": dropped,
                "drop_rate_percent": drop_rate_percent,
            }
        });
        self.reporter
            .capture_event(&message, TelemetryLevel::Warning, &tags, &contexts);
    }
}

impl std::fmt::Debug for NotificationTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationTelemetry")
            .field("config", &self.config)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
