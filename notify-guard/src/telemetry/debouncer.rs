//! Debouncing of breaker transition reports.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::resilience::CircuitState;

/// Default minimum interval between non-critical reports per destination.
pub const DEFAULT_MIN_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Decides which breaker transitions are forwarded upstream.
///
/// Closed to Open and any transition into Closed are always reported. Other
/// transitions are reported only when the destination's last report is older
/// than the minimum interval.
#[derive(Debug)]
pub struct TelemetryDebouncer {
    min_interval: Duration,
    last_report: Mutex<HashMap<String, Instant>>,
}

impl TelemetryDebouncer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_report: Mutex::new(HashMap::new()),
        }
    }

    fn is_critical(from: CircuitState, to: CircuitState) -> bool {
        matches!(
            (from, to),
            (CircuitState::Closed, CircuitState::Open) | (_, CircuitState::Closed)
        )
    }

    /// Returns true when the transition should be reported, and books it.
    pub fn should_report(&self, destination: &str, from: CircuitState, to: CircuitState) -> bool {
        let now = Instant::now();
        let mut last_report = self.last_report.lock();

        if !Self::is_critical(from, to)
            && let Some(last) = last_report.get(destination)
        {
            let since = now.saturating_duration_since(*last);
            if since < self.min_interval {
                debug!(
                    destination,
                    %from,
                    %to,
                    since_last_report = ?since,
                    "Suppressing circuit breaker transition report"
                );
                return false;
            }
        }

        last_report.insert(destination.to_string(), now);
        true
    }

    /// Forget a destination, e.g. after it is deconfigured.
    pub fn forget(&self, destination: &str) {
        self.last_report.lock().remove(destination);
    }
}

impl Default for TelemetryDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_REPORT_INTERVAL)
    }
}
