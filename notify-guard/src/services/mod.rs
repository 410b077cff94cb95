//! Assembly of the delivery resilience layer.
//!
//! [`NotificationServices`] owns every component instance; nothing in the crate
//! is a process-wide singleton.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PushConfig;
use crate::dispatcher::{Destination, Dispatcher};
use crate::health::HealthChecker;
use crate::metrics::MetricsSink;
use crate::notification::{Notification, NotificationStore, Provider};
use crate::resilience::{CircuitBreaker, RateLimiter};
use crate::telemetry::{NotificationTelemetry, TelemetryReporter};
use crate::worker::{ErrorEvent, ErrorEventWorker, ResourceEventWorker};
use crate::{Error, Result};

/// Capacity of the error event channel.
const ERROR_EVENT_BUFFER: usize = 1024;

/// Collects what [`NotificationServices`] is built from.
pub struct NotificationServicesBuilder {
    config: PushConfig,
    store: Arc<dyn NotificationStore>,
    providers: Vec<Arc<dyn Provider>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    reporter: Option<Arc<dyn TelemetryReporter>>,
}

impl NotificationServicesBuilder {
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn telemetry(mut self, reporter: Arc<dyn TelemetryReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Construct every component and register the providers.
    ///
    /// Invalid configuration is logged, never fatal. A provider that fails
    /// registration is skipped so the others still get delivered to.
    pub async fn build(self) -> Result<Arc<NotificationServices>> {
        let Self {
            config,
            store,
            providers,
            metrics,
            reporter,
        } = self;

        let warnings = config.log_validation_warnings();
        if warnings > 0 {
            warn!(warnings, "Push configuration has invalid settings, continuing with them");
        }

        let telemetry = reporter
            .map(|reporter| Arc::new(NotificationTelemetry::new(config.telemetry.clone(), reporter)));

        let mut health = HealthChecker::new(config.health_check.clone());
        if let Some(metrics) = &metrics {
            health = health.with_metrics(metrics.clone());
        }
        let health = Arc::new(health);

        let mut dispatcher =
            Dispatcher::new(config.dispatcher.clone()).with_health_checker(health.clone());
        if let Some(metrics) = &metrics {
            dispatcher = dispatcher.with_metrics(metrics.clone());
        }
        if let Some(telemetry) = &telemetry {
            dispatcher = dispatcher.with_telemetry(telemetry.clone());
        }
        let dispatcher = Arc::new(dispatcher);

        for provider in providers {
            let name = provider.name().to_string();
            let destination_config = config.destination(&name);
            if destination_config.is_some_and(|d| !d.enabled) {
                info!(destination = %name, "Push destination disabled in configuration");
                continue;
            }

            let breaker = Arc::new(CircuitBreaker::new(
                name.clone(),
                config.circuit_breaker_for(&name),
            ));
            let mut destination = Destination::new(provider, breaker);
            let limiter_config = config.rate_limiter_for(&name);
            if limiter_config.enabled {
                destination =
                    destination.with_rate_limiter(Arc::new(RateLimiter::from_config(&limiter_config)));
            }
            if let Some(d) = destination_config {
                destination = destination.with_filter(d.filter.clone());
            }

            if let Err(e) = dispatcher.register(destination).await {
                warn!(destination = %name, error = %e, "Skipping push destination");
            }
        }

        let mut error_worker = ErrorEventWorker::new(store.clone(), config.worker.clone());
        if let Some(telemetry) = &telemetry {
            error_worker = error_worker.with_telemetry(telemetry.clone());
        }
        let resource_worker = Arc::new(ResourceEventWorker::new(store, &config.resource_worker));
        let (error_tx, error_rx) = mpsc::channel(ERROR_EVENT_BUFFER);

        info!(
            destinations = dispatcher.destinations().len(),
            "Notification services built"
        );
        Ok(Arc::new(NotificationServices {
            config,
            dispatcher,
            health,
            error_worker: Arc::new(error_worker),
            resource_worker,
            telemetry,
            error_tx,
            error_rx: Mutex::new(Some(error_rx)),
            worker_handle: Mutex::new(None),
            cancellation_token: CancellationToken::new(),
        }))
    }
}

/// Every component of the delivery resilience layer, wired together.
pub struct NotificationServices {
    config: PushConfig,
    dispatcher: Arc<Dispatcher>,
    health: Arc<HealthChecker>,
    error_worker: Arc<ErrorEventWorker>,
    resource_worker: Arc<ResourceEventWorker>,
    telemetry: Option<Arc<NotificationTelemetry>>,
    error_tx: mpsc::Sender<ErrorEvent>,
    error_rx: Mutex<Option<mpsc::Receiver<ErrorEvent>>>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl NotificationServices {
    pub fn builder(config: PushConfig, store: Arc<dyn NotificationStore>) -> NotificationServicesBuilder {
        NotificationServicesBuilder {
            config,
            store,
            providers: Vec::new(),
            metrics: None,
            reporter: None,
        }
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn error_worker(&self) -> &Arc<ErrorEventWorker> {
        &self.error_worker
    }

    pub fn resource_worker(&self) -> &Arc<ResourceEventWorker> {
        &self.resource_worker
    }

    pub fn telemetry(&self) -> Option<&Arc<NotificationTelemetry>> {
        self.telemetry.as_ref()
    }

    /// Sender for error events consumed by the error worker.
    pub fn error_events(&self) -> mpsc::Sender<ErrorEvent> {
        self.error_tx.clone()
    }

    /// Start health probing, the push listener on `store_rx`, the error
    /// worker and the resource alert sweep.
    pub fn start(self: &Arc<Self>, store_rx: broadcast::Receiver<Notification>) -> Result<()> {
        let Some(error_rx) = self.error_rx.lock().take() else {
            return Err(Error::Other("notification services already started".to_string()));
        };
        let token = &self.cancellation_token;

        self.health.start(token)?;
        self.dispatcher.start(store_rx, token);
        self.resource_worker.start(token);
        let handle = tokio::spawn(Arc::clone(&self.error_worker).run(error_rx, token.child_token()));
        *self.worker_handle.lock() = Some(handle);

        info!("Notification services started");
        Ok(())
    }

    /// Stop every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down notification services");
        self.cancellation_token.cancel();
        self.dispatcher.stop().await;
        self.health.stop().await;
        self.resource_worker.stop().await;

        let handle = self.worker_handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Error event worker ended abnormally");
        }
        debug!("Notification services stopped");
    }
}
