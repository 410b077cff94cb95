//! Tracing setup with a reloadable filter.
//!
//! Library code only emits `tracing` events; binaries embedding the crate call
//! [`init_logging`] once and keep the returned handle to change the filter at
//! runtime.

use std::sync::Arc;

use chrono::Local;
use tracing::info;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Filter used when neither `RUST_LOG` nor an explicit directive is given.
pub const DEFAULT_LOG_FILTER: &str = "notify_guard=info";

/// Local timezone timestamps.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Console output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Handle to the installed subscriber's filter.
pub struct LoggingHandle {
    handle: FilterHandle,
}

impl LoggingHandle {
    /// Current filter directive.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter, e.g. `"notify_guard=debug"`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = parse_filter(directive)?;
        self.handle
            .reload(filter)
            .map_err(|e| Error::config(format!("failed to reload log filter: {e}")))?;
        info!(directive = %directive, "Log filter updated");
        Ok(())
    }
}

/// Parse a filter directive.
pub fn parse_filter(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive)
        .map_err(|e| Error::config(format!("invalid log filter '{directive}': {e}")))
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `directive`, which wins over [`DEFAULT_LOG_FILTER`].
/// Fails if the directive is invalid or a global subscriber is already set.
pub fn init_logging(directive: Option<&str>, format: LogFormat) -> Result<Arc<LoggingHandle>> {
    let initial = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(directive.unwrap_or(DEFAULT_LOG_FILTER))?,
    };
    let (filter_layer, handle) = reload::Layer::new(initial);

    let registry = tracing_subscriber::registry().with(filter_layer);
    let installed = match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_timer(LocalTimer))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_timer(LocalTimer))
            .try_init(),
    };
    installed.map_err(|e| Error::config(format!("failed to set global subscriber: {e}")))?;

    Ok(Arc::new(LoggingHandle { handle }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter(DEFAULT_LOG_FILTER).is_ok());
        assert!(parse_filter("notify_guard=debug,tokio=warn").is_ok());
        assert!(matches!(
            parse_filter("notify_guard=loud"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_reload_handle() {
        let (layer, handle) = reload::Layer::new(parse_filter("notify_guard=info").unwrap());
        let subscriber = tracing_subscriber::registry().with(layer);
        let _guard = tracing::subscriber::set_default(subscriber);

        let logging = LoggingHandle { handle };
        assert!(logging.get_filter().contains("notify_guard=info"));
        logging.set_filter("notify_guard=debug").unwrap();
        assert!(logging.get_filter().contains("notify_guard=debug"));
        assert!(logging.set_filter("notify_guard=loud").is_err());
    }
}
