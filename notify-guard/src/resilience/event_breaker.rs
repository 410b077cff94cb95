//! Breaker guarding notification creation on the internal event path.
//!
//! Same state machine as the push breaker, at event granularity: it opens
//! after consecutive creation failures, admits a bounded number of probe
//! events while half-open, and closes once that many probes have succeeded.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::state::{BreakerCore, CircuitState, Ticket, Transition};

pub struct EventBreaker {
    name: &'static str,
    core: Mutex<BreakerCore>,
}

impl EventBreaker {
    pub fn new(
        name: &'static str,
        failure_threshold: u32,
        recovery_timeout: Duration,
        half_open_max_events: u32,
    ) -> Self {
        Self {
            name,
            core: Mutex::new(BreakerCore::new(
                failure_threshold,
                recovery_timeout,
                half_open_max_events,
                half_open_max_events,
            )),
        }
    }

    /// Admit one event, booking a probe slot when half-open.
    ///
    /// The outcome is reported through the returned permit; a permit dropped
    /// without an outcome frees its slot.
    pub fn allow(&self) -> Option<EventPermit<'_>> {
        let result = self.core.lock().admit(Instant::now());
        match result {
            Ok((ticket, transition)) => {
                if let Some(t) = transition {
                    self.log(t);
                }
                Some(EventPermit {
                    breaker: self,
                    ticket,
                    armed: true,
                })
            }
            Err(rejection) => {
                debug!(worker = self.name, ?rejection, "Event breaker rejected event");
                None
            }
        }
    }

    fn record_success(&self) {
        let transition = self.core.lock().on_success(Instant::now());
        if let Some(t) = transition {
            self.log(t);
        }
    }

    fn record_failure(&self) {
        let transition = self.core.lock().on_failure(Instant::now());
        if let Some(t) = transition {
            self.log(t);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.core.lock().state()
    }

    pub fn failures(&self) -> u32 {
        self.core.lock().failures()
    }

    pub fn reset(&self) {
        let transition = self.core.lock().reset(Instant::now());
        if let Some(t) = transition {
            self.log(t);
        }
    }

    fn log(&self, Transition { from, to }: Transition) {
        if to == CircuitState::Open {
            warn!(
                worker = self.name,
                %from,
                %to,
                failures = self.failures(),
                "Notification creation failing, event breaker opened"
            );
        } else {
            info!(worker = self.name, %from, %to, "Event breaker state changed");
        }
    }
}

/// Admission of one event (or event group) by an [`EventBreaker`].
#[must_use = "dropping the permit discards the outcome"]
pub struct EventPermit<'a> {
    breaker: &'a EventBreaker,
    ticket: Ticket,
    armed: bool,
}

impl EventPermit<'_> {
    pub fn success(mut self) {
        self.armed = false;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.armed = false;
        self.breaker.record_failure();
    }
}

impl Drop for EventPermit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.core.lock().release(self.ticket);
        }
    }
}

impl std::fmt::Debug for EventBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_probe_successes() {
        let breaker = EventBreaker::new("test", 2, Duration::from_secs(10), 2);
        breaker.allow().unwrap().failure();
        breaker.allow().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow().is_none());

        tokio::time::advance(Duration::from_secs(10)).await;
        let first = breaker.allow().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let second = breaker.allow().unwrap();
        assert!(breaker.allow().is_none());

        first.success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        second.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = EventBreaker::new("test", 1, Duration::from_secs(10), 3);
        breaker.allow().unwrap().failure();
        tokio::time::advance(Duration::from_secs(10)).await;
        breaker.allow().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_permit_frees_probe_slot() {
        let breaker = EventBreaker::new("test", 1, Duration::from_secs(10), 1);
        breaker.allow().unwrap().failure();
        tokio::time::advance(Duration::from_secs(10)).await;

        let probe = breaker.allow().unwrap();
        assert!(breaker.allow().is_none());
        drop(probe);

        breaker.allow().unwrap().success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_closed_permit_drop_is_noop() {
        let breaker = EventBreaker::new("test", 1, Duration::from_secs(10), 1);
        drop(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 0);
    }
}
