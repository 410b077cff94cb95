//! Three-state breaker machine shared by the push and event breakers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, every call is admitted.
    #[default]
    Closed,
    /// Probing whether the destination has recovered.
    HalfOpen,
    /// Failing, calls are rejected without running.
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half-open",
            Self::Open => "open",
        }
    }

    /// Gauge value exported to metrics sinks.
    pub fn as_gauge(&self) -> u64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change produced by the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    Open,
    TooManyRequests,
}

/// Proof of admission.
///
/// Carries the half-open episode the call was booked against so a cancelled
/// probe only releases its own booking.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ticket {
    episode: u64,
    half_open: bool,
}

/// The breaker state machine, without locking.
///
/// Owners wrap it in a single mutex so that admission and booking happen
/// atomically.
#[derive(Debug)]
pub(crate) struct BreakerCore {
    state: CircuitState,
    failures: u32,
    last_failure: Option<DateTime<Utc>>,
    last_state_change: Instant,
    last_state_change_at: DateTime<Utc>,
    half_open_admitted: u32,
    half_open_successes: u32,
    episode: u64,

    max_failures: u32,
    timeout: Duration,
    half_open_max: u32,
    successes_to_close: u32,
}

impl BreakerCore {
    pub(crate) fn new(
        max_failures: u32,
        timeout: Duration,
        half_open_max: u32,
        successes_to_close: u32,
    ) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            last_state_change: Instant::now(),
            last_state_change_at: Utc::now(),
            half_open_admitted: 0,
            half_open_successes: 0,
            episode: 0,
            max_failures: max_failures.max(1),
            timeout,
            half_open_max: half_open_max.max(1),
            successes_to_close: successes_to_close.max(1),
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.state
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn last_failure(&self) -> Option<DateTime<Utc>> {
        self.last_failure
    }

    pub(crate) fn last_state_change(&self) -> DateTime<Utc> {
        self.last_state_change_at
    }

    pub(crate) fn half_open_admitted(&self) -> u32 {
        self.half_open_admitted
    }

    /// Decide admission and book the call in one step.
    pub(crate) fn admit(
        &mut self,
        now: Instant,
    ) -> Result<(Ticket, Option<Transition>), Rejection> {
        match self.state {
            CircuitState::Closed => Ok((self.ticket(false), None)),
            CircuitState::Open => {
                if now.saturating_duration_since(self.last_state_change) < self.timeout {
                    return Err(Rejection::Open);
                }
                let transition = self.transition_to(CircuitState::HalfOpen, now);
                self.half_open_admitted = 1;
                Ok((self.ticket(true), Some(transition)))
            }
            CircuitState::HalfOpen => {
                if self.half_open_admitted >= self.half_open_max {
                    return Err(Rejection::TooManyRequests);
                }
                self.half_open_admitted += 1;
                Ok((self.ticket(true), None))
            }
        }
    }

    pub(crate) fn on_success(&mut self, now: Instant) -> Option<Transition> {
        self.failures = 0;
        if self.state != CircuitState::HalfOpen {
            return None;
        }
        self.half_open_successes += 1;
        (self.half_open_successes >= self.successes_to_close)
            .then(|| self.transition_to(CircuitState::Closed, now))
    }

    pub(crate) fn on_failure(&mut self, now: Instant) -> Option<Transition> {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(Utc::now());
        match self.state {
            CircuitState::Closed if self.failures >= self.max_failures => {
                Some(self.transition_to(CircuitState::Open, now))
            }
            CircuitState::HalfOpen => Some(self.transition_to(CircuitState::Open, now)),
            _ => None,
        }
    }

    /// Undo the booking of an admitted call whose outcome is ignored.
    pub(crate) fn release(&mut self, ticket: Ticket) {
        if ticket.half_open
            && self.state == CircuitState::HalfOpen
            && ticket.episode == self.episode
        {
            self.half_open_admitted = self.half_open_admitted.saturating_sub(1);
        }
    }

    /// Force Closed and zero every counter.
    pub(crate) fn reset(&mut self, now: Instant) -> Option<Transition> {
        self.failures = 0;
        self.last_failure = None;
        if self.state == CircuitState::Closed {
            self.half_open_admitted = 0;
            self.half_open_successes = 0;
            return None;
        }
        Some(self.transition_to(CircuitState::Closed, now))
    }

    fn ticket(&self, half_open: bool) -> Ticket {
        Ticket {
            episode: self.episode,
            half_open,
        }
    }

    fn transition_to(&mut self, to: CircuitState, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.last_state_change = now;
        self.last_state_change_at = Utc::now();
        self.half_open_admitted = 0;
        self.half_open_successes = 0;
        self.episode += 1;
        Transition { from, to }
    }
}
