//! Configuration for the delivery resilience layer.
//!
//! Every section deserializes with defaults for missing fields. Validation is
//! permissive: callers log validation failures as warnings and keep going, so
//! one misconfigured destination degrades on its own instead of preventing
//! startup.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dispatcher::PushFilter;
use crate::{Error, Result};

/// Circuit breaker settings for one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Whether sends are guarded by a breaker at all.
    pub enabled: bool,
    /// Consecutive failures before the circuit opens.
    pub max_failures: u32,
    /// Seconds to wait in Open before admitting a half-open probe.
    pub timeout_secs: u64,
    /// Probe calls admitted per half-open episode.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: 5,
            timeout_secs: 30,
            half_open_max_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_failures < 1 {
            return Err(Error::validation(format!(
                "max_failures must be at least 1, got {}",
                self.max_failures
            )));
        }
        if self.timeout_secs < 1 {
            return Err(Error::validation(format!(
                "timeout must be at least 1 second, got {}s",
                self.timeout_secs
            )));
        }
        if self.half_open_max_requests < 1 {
            return Err(Error::validation(format!(
                "half_open_max_requests must be at least 1, got {}",
                self.half_open_max_requests
            )));
        }
        Ok(())
    }
}

/// Token bucket settings for one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub enabled: bool,
    /// Tokens added per minute.
    pub requests_per_minute: u32,
    /// Maximum burst capacity; the bucket starts full.
    pub burst_size: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 60,
            burst_size: 10,
        }
    }
}

impl RateLimiterConfig {
    /// Refill period the rate is expressed against.
    pub const INTERVAL: Duration = Duration::from_secs(60);

    pub fn validate(&self) -> Result<()> {
        if self.requests_per_minute == 0 {
            return Err(Error::validation("requests_per_minute must be positive"));
        }
        if self.burst_size == 0 {
            return Err(Error::validation("burst_size must be positive"));
        }
        Ok(())
    }
}

/// Periodic health probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            timeout_secs: 10,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_secs < 1 {
            return Err(Error::validation("interval must be at least 1 second"));
        }
        if self.timeout_secs < 1 {
            return Err(Error::validation("timeout must be at least 1 second"));
        }
        if self.timeout_secs >= self.interval_secs {
            return Err(Error::validation(format!(
                "timeout ({}s) must be less than interval ({}s)",
                self.timeout_secs, self.interval_secs
            )));
        }
        Ok(())
    }
}

/// Send loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Fixed delay between attempts, in milliseconds.
    pub retry_delay_ms: u64,
    /// Per-attempt deadline, in milliseconds. Zero disables the deadline.
    pub default_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            retry_delay_ms: 2000,
            default_timeout_ms: 30_000,
        }
    }
}

impl DispatcherConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_ms > 0).then(|| Duration::from_millis(self.default_timeout_ms))
    }
}

/// Aggregating worker for internally generated error events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Emit per-event debug logs.
    pub debug: bool,
    pub batching_enabled: bool,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    /// Consecutive creation failures before the worker breaker opens.
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    /// Probe events admitted while half-open; that many successes close it.
    pub half_open_max_events: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            debug: false,
            batching_enabled: false,
            batch_size: 10,
            batch_timeout_ms: 100,
            failure_threshold: 5,
            recovery_timeout_secs: 30,
            half_open_max_events: 3,
        }
    }
}

impl WorkerConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batching_enabled && self.batch_size == 0 {
            return Err(Error::validation("batch_size must be positive"));
        }
        if self.failure_threshold < 1 {
            return Err(Error::validation("failure_threshold must be at least 1"));
        }
        if self.half_open_max_events < 1 {
            return Err(Error::validation("half_open_max_events must be at least 1"));
        }
        Ok(())
    }
}

/// Resource alert throttling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceWorkerConfig {
    /// Default cooldown between alerts for the same identity, in seconds.
    pub alert_throttle_secs: u64,
    /// Per resource type overrides (`cpu`, `memory`, `disk`, ...), in seconds.
    pub resource_throttles: HashMap<String, u64>,
    /// How often the throttle map is swept, in seconds.
    pub cleanup_interval_secs: u64,
}

impl Default for ResourceWorkerConfig {
    fn default() -> Self {
        Self {
            alert_throttle_secs: 300,
            resource_throttles: HashMap::new(),
            cleanup_interval_secs: 300,
        }
    }
}

impl ResourceWorkerConfig {
    pub fn alert_throttle(&self) -> Duration {
        Duration::from_secs(self.alert_throttle_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Upstream telemetry reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    /// Minimum drop rate (percent) before rate limiting is reported.
    pub rate_limit_report_threshold: f64,
    /// Debounce window for non-critical breaker transitions, in seconds.
    pub min_report_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_limit_report_threshold: 50.0,
            min_report_interval_secs: 30,
        }
    }
}

impl TelemetryConfig {
    pub fn min_report_interval(&self) -> Duration {
        Duration::from_secs(self.min_report_interval_secs)
    }
}

/// One configured push destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub filter: PushFilter,
    /// Overrides the global breaker settings for this destination.
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Overrides the global rate limiter settings for this destination.
    #[serde(default)]
    pub rate_limiter: Option<RateLimiterConfig>,
}

fn default_true() -> bool {
    true
}

impl DestinationConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            filter: PushFilter::default(),
            circuit_breaker: None,
            rate_limiter: None,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PushConfig {
    pub dispatcher: DispatcherConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub health_check: HealthCheckConfig,
    pub worker: WorkerConfig,
    pub resource_worker: ResourceWorkerConfig,
    pub telemetry: TelemetryConfig,
    pub destinations: Vec<DestinationConfig>,
}

impl PushConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Look up a destination's settings by name.
    pub fn destination(&self, name: &str) -> Option<&DestinationConfig> {
        self.destinations.iter().find(|d| d.name == name)
    }

    /// Breaker settings for a destination, falling back to the global section.
    pub fn circuit_breaker_for(&self, name: &str) -> CircuitBreakerConfig {
        self.destination(name)
            .and_then(|d| d.circuit_breaker.clone())
            .unwrap_or_else(|| self.circuit_breaker.clone())
    }

    /// Limiter settings for a destination, falling back to the global section.
    pub fn rate_limiter_for(&self, name: &str) -> RateLimiterConfig {
        self.destination(name)
            .and_then(|d| d.rate_limiter.clone())
            .unwrap_or_else(|| self.rate_limiter.clone())
    }

    /// Validate every section, logging failures instead of returning them.
    ///
    /// Returns the number of problems found.
    pub fn log_validation_warnings(&self) -> usize {
        let mut problems = 0;
        let mut check = |section: &str, result: Result<()>| {
            if let Err(e) = result {
                problems += 1;
                warn!(section, error = %e, "configuration validation failed, proceeding anyway");
            }
        };

        check("circuit_breaker", self.circuit_breaker.validate());
        check("rate_limiter", self.rate_limiter.validate());
        if self.health_check.enabled {
            check("health_check", self.health_check.validate());
        }
        check("worker", self.worker.validate());
        for dest in &self.destinations {
            if let Some(cb) = &dest.circuit_breaker {
                check(&format!("destinations.{}.circuit_breaker", dest.name), cb.validate());
            }
            if let Some(rl) = &dest.rate_limiter {
                check(&format!("destinations.{}.rate_limiter", dest.name), rl.validate());
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());

        let zero_failures = CircuitBreakerConfig {
            max_failures: 0,
            ..Default::default()
        };
        assert!(zero_failures.validate().is_err());

        let zero_timeout = CircuitBreakerConfig {
            timeout_secs: 0,
            ..Default::default()
        };
        assert!(zero_timeout.validate().is_err());

        let zero_probes = CircuitBreakerConfig {
            half_open_max_requests: 0,
            ..Default::default()
        };
        assert!(zero_probes.validate().is_err());
    }

    #[test]
    fn test_health_check_config_validation() {
        let config = HealthCheckConfig::default();
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());

        let equal = HealthCheckConfig {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 10,
        };
        let err = equal.validate().unwrap_err().to_string();
        assert!(err.contains("timeout (10s) must be less than interval (10s)"));
    }

    #[test]
    fn test_rate_limiter_config_validation() {
        assert!(RateLimiterConfig::default().validate().is_ok());
        let bad = RateLimiterConfig {
            enabled: true,
            requests_per_minute: 0,
            burst_size: 1,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_dispatcher_zero_timeout_disables_deadline() {
        let config = DispatcherConfig {
            default_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.default_timeout(), None);
        assert_eq!(
            DispatcherConfig::default().default_timeout(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_parse_partial_json_uses_defaults() {
        let json = r#"{
            "dispatcher": { "max_retries": 1 },
            "destinations": [
                { "name": "hook", "circuit_breaker": { "max_failures": 2 } },
                { "name": "script", "enabled": false }
            ]
        }"#;
        let config = PushConfig::from_json_str(json).unwrap();

        assert_eq!(config.dispatcher.max_retries, 1);
        assert_eq!(config.dispatcher.retry_delay_ms, 2000);
        assert_eq!(config.destinations.len(), 2);
        assert!(config.destinations[0].enabled);
        assert!(!config.destinations[1].enabled);

        let hook_cb = config.circuit_breaker_for("hook");
        assert_eq!(hook_cb.max_failures, 2);
        assert_eq!(hook_cb.timeout_secs, 30);
        assert_eq!(config.circuit_breaker_for("script").max_failures, 5);
    }

    #[test]
    fn test_invalid_config_is_reported_not_fatal() {
        let mut config = PushConfig::default();
        config.circuit_breaker.max_failures = 0;
        config.health_check.timeout_secs = 120;
        assert_eq!(config.log_validation_warnings(), 2);
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(matches!(
            PushConfig::from_json_str("{ nope"),
            Err(Error::Serialization(_))
        ));
    }
}
