//! Notification model and the capabilities the resilience layer consumes.
//!
//! - [`Notification`]: the record being delivered
//! - [`Provider`]: an external push destination
//! - [`NotificationStore`]: persistence used by the event workers

pub mod provider;
pub mod store;
pub mod types;

pub use provider::Provider;
pub use store::{MemoryStore, NotificationStore};
pub use types::{METADATA_KEY_IS_TOAST, Notification, NotificationType, Priority};
