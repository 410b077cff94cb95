//! Per-destination circuit breaker guarding push sends.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{BreakerCore, CircuitState, Rejection, Ticket, Transition};
use crate::config::CircuitBreakerConfig;
use crate::metrics::MetricsSink;
use crate::telemetry::NotificationTelemetry;
use crate::{Error, Result};

/// Snapshot of a breaker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
    pub half_open_requests: u32,
    pub max_failures: u32,
    pub timeout_secs: u64,
    pub half_open_max_requests: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

#[derive(Debug, Default)]
struct Totals {
    successes: u64,
    failures: u64,
    rejections: u64,
}

struct Inner {
    core: BreakerCore,
    totals: Totals,
    entered_state: Instant,
}

/// Three-state breaker wrapping single calls to one destination.
///
/// Admission and booking happen under one lock; the wrapped operation runs
/// outside it. A disabled breaker admits everything and records nothing.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    telemetry: RwLock<Option<Arc<NotificationTelemetry>>>,
    metrics: RwLock<Option<Arc<dyn MetricsSink>>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let core = BreakerCore::new(
            config.max_failures,
            config.timeout(),
            config.half_open_max_requests,
            1,
        );
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                core,
                totals: Totals::default(),
                entered_state: Instant::now(),
            }),
            telemetry: RwLock::new(None),
            metrics: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Wire debounced transition reporting.
    pub fn set_telemetry(&self, telemetry: Arc<NotificationTelemetry>) {
        *self.telemetry.write() = Some(telemetry);
    }

    /// Wire the metrics sink that receives state gauges.
    pub fn set_metrics(&self, metrics: Arc<dyn MetricsSink>) {
        *self.metrics.write() = Some(metrics);
    }

    /// Run `op` under the breaker's admission policy and record its outcome.
    ///
    /// `op` receives the caller's token. A call that fails because the token
    /// was cancelled counts as neither success nor failure.
    pub async fn call<F, Fut, T>(&self, token: &CancellationToken, op: F) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.config.enabled {
            return op(token.clone()).await;
        }
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (ticket, admitted_transition) = {
            let mut inner = self.inner.lock();
            match inner.core.admit(Instant::now()) {
                Ok((ticket, transition)) => {
                    let emitted = transition.map(|t| self.on_transition(&mut inner, t));
                    (ticket, emitted)
                }
                Err(rejection) => {
                    inner.totals.rejections += 1;
                    let failures = inner.core.failures();
                    drop(inner);
                    debug!(destination = %self.name, ?rejection, "Circuit breaker rejected call");
                    return Err(match rejection {
                        Rejection::Open => Error::CircuitOpen {
                            destination: self.name.clone(),
                            failures,
                        },
                        Rejection::TooManyRequests => Error::TooManyRequests {
                            destination: self.name.clone(),
                        },
                    });
                }
            }
        };
        if let Some(report) = admitted_transition {
            self.emit(report);
        }

        let booking = Booking {
            inner: &self.inner,
            ticket,
            armed: true,
        };
        let result = op(token.clone()).await;
        let ticket = booking.settle();

        let report = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let transition = match &result {
                Err(e) if e.is_cancelled() || token.is_cancelled() => {
                    inner.core.release(ticket);
                    debug!(destination = %self.name, "Call cancelled by caller, outcome ignored");
                    None
                }
                Ok(_) => {
                    inner.totals.successes += 1;
                    inner.core.on_success(now)
                }
                Err(_) => {
                    inner.totals.failures += 1;
                    inner.core.on_failure(now)
                }
            };
            transition.map(|t| self.on_transition(&mut inner, t))
        };
        if let Some(report) = report {
            self.emit(report);
        }

        self.record_failures_gauge();
        result
    }

    /// Force Closed and zero the counters.
    pub fn reset(&self) {
        let report = {
            let mut inner = self.inner.lock();
            inner.totals = Totals::default();
            inner
                .core
                .reset(Instant::now())
                .map(|t| self.on_transition(&mut inner, t))
        };
        if let Some(report) = report {
            self.emit(report);
        }
        info!(destination = %self.name, "Circuit breaker reset");
        self.record_failures_gauge();
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().core.state()
    }

    /// Consecutive failures since the last success.
    pub fn failures(&self) -> u32 {
        self.inner.lock().core.failures()
    }

    /// True while the breaker is Closed.
    pub fn is_healthy(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.core.state(),
            consecutive_failures: inner.core.failures(),
            last_failure: inner.core.last_failure(),
            last_state_change: inner.core.last_state_change(),
            half_open_requests: inner.core.half_open_admitted(),
            max_failures: self.config.max_failures,
            timeout_secs: self.config.timeout_secs,
            half_open_max_requests: self.config.half_open_max_requests,
            total_successes: inner.totals.successes,
            total_failures: inner.totals.failures,
            total_rejections: inner.totals.rejections,
        }
    }

    fn on_transition(&self, inner: &mut Inner, transition: Transition) -> TransitionReport {
        let now = Instant::now();
        let time_in_previous_state = now.saturating_duration_since(inner.entered_state);
        inner.entered_state = now;
        TransitionReport {
            transition,
            failures: inner.core.failures(),
            time_in_previous_state,
        }
    }

    /// Side effects of a transition, run after the lock is released.
    fn emit(&self, report: TransitionReport) {
        let Transition { from, to } = report.transition;
        match to {
            CircuitState::Open => warn!(
                destination = %self.name,
                %from,
                %to,
                consecutive_failures = report.failures,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(
                destination = %self.name,
                %from,
                %to,
                "Circuit breaker half-open, probing destination"
            ),
            CircuitState::Closed => info!(
                destination = %self.name,
                %from,
                %to,
                "Circuit breaker closed"
            ),
        }

        if let Some(telemetry) = self.telemetry.read().as_ref() {
            telemetry.circuit_breaker_transition(
                &self.name,
                from,
                to,
                report.failures,
                report.time_in_previous_state,
                &self.config,
            );
        }
        if let Some(metrics) = self.metrics.read().as_ref() {
            metrics.record_circuit_state(&self.name, to);
        }
    }

    fn record_failures_gauge(&self) {
        if let Some(metrics) = self.metrics.read().as_ref() {
            metrics.record_consecutive_failures(&self.name, self.failures());
        }
    }
}

/// Booking of an admitted call while its operation runs.
///
/// Dropped unsettled (the caller abandoned the `call` future, or the operation
/// panicked), it hands a half-open probe slot back to the breaker.
struct Booking<'a> {
    inner: &'a Mutex<Inner>,
    ticket: Ticket,
    armed: bool,
}

impl Booking<'_> {
    fn settle(mut self) -> Ticket {
        self.armed = false;
        self.ticket
    }
}

impl Drop for Booking<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().core.release(self.ticket);
        }
    }
}

struct TransitionReport {
    transition: Transition,
    failures: u32,
    time_in_previous_state: Duration,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failures", &self.failures())
            .finish()
    }
}
