//! notify-guard: delivery resilience for push notifications.
//!
//! Outbound path: [`dispatcher::Dispatcher`] filters, rate limits and sends
//! each notification through a per-destination
//! [`resilience::CircuitBreaker`] with bounded retries.
//! [`health::HealthChecker`] probes destinations through the same breakers.
//!
//! Internal path: [`worker::ErrorEventWorker`] and
//! [`worker::ResourceEventWorker`] turn application events into throttled,
//! aggregated notifications.
//!
//! [`services::NotificationServices`] wires everything together.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod notification;
pub mod resilience;
pub mod services;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};
