//! Push provider capability.
//!
//! Concrete transports (webhooks, chat integrations, scripts) live outside this
//! crate and plug in through [`Provider`].

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::types::{Notification, NotificationType};
use crate::Result;

/// An external push delivery backend.
///
/// Implementations must be safe for concurrent use. `send` should watch the
/// cancellation token and return [`crate::Error::Cancelled`] promptly when it
/// fires; failures should be reported as [`crate::Error::Provider`] with an
/// explicit retryable flag.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique destination name.
    fn name(&self) -> &str;

    /// Whether the provider is enabled.
    fn is_enabled(&self) -> bool;

    /// Whether this provider accepts notifications of the given type.
    fn supports_type(&self, notification_type: NotificationType) -> bool;

    /// Validate the provider configuration. Also used as the health probe.
    async fn validate_config(&self) -> Result<()>;

    /// Deliver a notification.
    async fn send(&self, token: CancellationToken, notification: &Notification) -> Result<()>;
}
