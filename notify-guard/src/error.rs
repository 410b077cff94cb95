//! Crate-wide error types.

use std::time::Duration;

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error reported by a push provider.
///
/// Providers decide whether a failure is worth retrying; the dispatcher never
/// infers retryability from the message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProviderError {
    /// Human-readable error text.
    pub message: String,
    /// Whether the dispatcher may retry the send.
    pub retryable: bool,
    /// Structured category attached by the provider, if known.
    pub category: Option<ErrorCategory>,
    /// HTTP status code for HTTP-based providers.
    pub status_code: Option<u16>,
}

impl ProviderError {
    /// A transient failure that may succeed on retry.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            category: None,
            status_code: None,
        }
    }

    /// A permanent failure; retrying will not help.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            category: None,
            status_code: None,
        }
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("circuit breaker for '{destination}' is open ({failures} consecutive failures)")]
    CircuitOpen { destination: String, failures: u32 },

    #[error("circuit breaker for '{destination}' is half-open, too many requests")]
    TooManyRequests { destination: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("delivery to '{destination}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        destination: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Shorthand for a retryable provider failure.
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Provider(ProviderError::retryable(msg))
    }

    /// Shorthand for a non-retryable provider failure.
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Provider(ProviderError::terminal(msg))
    }

    /// True when a circuit breaker refused to admit the call.
    pub fn is_circuit_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::TooManyRequests { .. })
    }

    /// True when the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Whether the dispatcher may try the send again.
    ///
    /// Timeouts are retryable; provider errors carry their own flag.
    /// Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Provider(e) => e.retryable,
            _ => false,
        }
    }
}

/// Observability-only classification of delivery errors.
///
/// Never used to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    Cancelled,
    Network,
    Validation,
    Permission,
    NotFound,
    Provider,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Permission => "permission",
            Self::NotFound => "not_found",
            Self::Provider => "provider_error",
        }
    }

    /// Classify an error, preferring structured information over message text.
    pub fn classify(err: &Error) -> Self {
        match err {
            Error::Timeout(_) => Self::Timeout,
            Error::Cancelled => Self::Cancelled,
            Error::Validation(_) | Error::Configuration(_) => Self::Validation,
            Error::Provider(p) => match p.category {
                Some(category) => category,
                None => match p.status_code {
                    Some(401 | 403) => Self::Permission,
                    Some(404) => Self::NotFound,
                    Some(400 | 422) => Self::Validation,
                    _ => Self::sniff(&p.message),
                },
            },
            Error::RetriesExhausted { source, .. } => Self::classify(source),
            other => Self::sniff(&other.to_string()),
        }
    }

    /// Fallback for third-party errors that carry no structured category.
    fn sniff(message: &str) -> Self {
        let msg = message.to_lowercase();
        if msg.contains("deadline exceeded") || msg.contains("timed out") || msg.contains("timeout")
        {
            Self::Timeout
        } else if msg.contains("cancel") {
            Self::Cancelled
        } else if msg.contains("connection")
            || msg.contains("network")
            || msg.contains("dns")
            || msg.contains("no such host")
            || msg.contains("unreachable")
        {
            Self::Network
        } else if msg.contains("invalid") || msg.contains("validation") {
            Self::Validation
        } else if msg.contains("unauthorized")
            || msg.contains("forbidden")
            || msg.contains("permission")
        {
            Self::Permission
        } else if msg.contains("not found") {
            Self::NotFound
        } else {
            Self::Provider
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
