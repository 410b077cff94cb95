//! Failure isolation primitives.
//!
//! - [`CircuitBreaker`]: call-level breaker, one per push destination
//! - [`EventBreaker`]: event-level breaker in front of notification creation
//! - [`RateLimiter`]: lazily refilled token bucket, one per push destination
//!
//! Both breakers share one state machine and the [`CircuitState`] enum.

pub mod circuit_breaker;
pub mod event_breaker;
pub mod rate_limiter;
pub mod state;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats};
pub use event_breaker::{EventBreaker, EventPermit};
pub use rate_limiter::{RateLimiter, RateLimiterStats};
pub use state::{CircuitState, Transition};
