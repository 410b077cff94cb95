//! Push dispatch: filter, rate limit, breaker-guarded send, retry.
//!
//! Every destination is delivered to independently, so one destination's
//! timeout or retry delay never holds up another.

pub mod filter;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use filter::PushFilter;

use crate::config::DispatcherConfig;
use crate::error::ErrorCategory;
use crate::health::HealthChecker;
use crate::metrics::MetricsSink;
use crate::notification::{Notification, Provider};
use crate::resilience::{CircuitBreaker, RateLimiter};
use crate::telemetry::NotificationTelemetry;
use crate::{Error, Result};

/// A configured push destination: provider, breaker, optional limiter, filter.
pub struct Destination {
    provider: Arc<dyn Provider>,
    breaker: Arc<CircuitBreaker>,
    rate_limiter: Option<Arc<RateLimiter>>,
    filter: PushFilter,
}

impl Destination {
    pub fn new(provider: Arc<dyn Provider>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            provider,
            breaker,
            rate_limiter: None,
            filter: PushFilter::default(),
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn with_filter(mut self, filter: PushFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    pub fn filter(&self) -> &PushFilter {
        &self.filter
    }

    /// Whether this destination should see the notification at all.
    fn accepts(&self, notification: &Notification) -> bool {
        self.provider.is_enabled() && self.provider.supports_type(notification.notification_type)
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("name", &self.name())
            .field("circuit_state", &self.breaker.state())
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish()
    }
}

/// Final result of delivering one notification to one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    /// Did not match the destination's filter.
    Filtered,
    /// No token in the destination's bucket.
    RateLimited,
    /// Breaker open or half-open slots taken.
    CircuitRejected,
    Failed,
    Cancelled,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "success",
            Self::Filtered => "filtered",
            Self::RateLimited => "rate_limited",
            Self::CircuitRejected => "circuit_rejected",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed send attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub retryable: bool,
    pub category: ErrorCategory,
    pub elapsed: Duration,
}

/// Per-destination delivery report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub destination: String,
    pub outcome: DeliveryOutcome,
    /// Send attempts made, zero when nothing was sent.
    pub attempts: u32,
    pub elapsed: Duration,
    pub error: Option<String>,
    pub failed_attempts: Vec<RetryAttempt>,
}

impl DeliveryReport {
    fn new(destination: &str, outcome: DeliveryOutcome) -> Self {
        Self {
            destination: destination.to_string(),
            outcome,
            attempts: 0,
            elapsed: Duration::ZERO,
            error: None,
            failed_attempts: Vec::new(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.outcome == DeliveryOutcome::Delivered
    }
}

/// Fans notifications out to every registered destination.
pub struct Dispatcher {
    config: DispatcherConfig,
    destinations: RwLock<Vec<Arc<Destination>>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    telemetry: Option<Arc<NotificationTelemetry>>,
    health: Option<Arc<HealthChecker>>,
    cancellation_token: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            destinations: RwLock::new(Vec::new()),
            metrics: None,
            telemetry: None,
            health: None,
            cancellation_token: CancellationToken::new(),
            listener: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<NotificationTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Forward real send outcomes to the health checker and register each new
    /// destination with it.
    pub fn with_health_checker(mut self, health: Arc<HealthChecker>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Validate and add a destination.
    ///
    /// Disabled providers and providers whose configuration does not validate
    /// are refused; the latter are also reported to telemetry.
    pub async fn register(&self, destination: Destination) -> Result<()> {
        let name = destination.name().to_string();

        if !destination.provider.is_enabled() {
            info!(destination = %name, "Push destination disabled, skipping");
            return Err(Error::config(format!("destination '{name}' is disabled")));
        }
        if self.destination(&name).is_some() {
            return Err(Error::config(format!(
                "destination '{name}' is already registered"
            )));
        }
        if let Err(e) = destination.provider.validate_config().await {
            error!(destination = %name, error = %e, "Push destination configuration invalid, skipping");
            if let Some(telemetry) = &self.telemetry {
                telemetry.provider_initialization_error(&name, "validation", &e);
            }
            return Err(e);
        }

        if let Some(telemetry) = &self.telemetry {
            destination.breaker.set_telemetry(telemetry.clone());
        }
        if let Some(metrics) = &self.metrics {
            destination.breaker.set_metrics(metrics.clone());
        }
        if let Some(health) = &self.health {
            health.register_provider(
                destination.provider.clone(),
                Some(destination.breaker.clone()),
            );
        }

        info!(
            destination = %name,
            rate_limited = destination.rate_limiter.is_some(),
            "Registered push destination"
        );
        self.destinations.write().push(Arc::new(destination));
        Ok(())
    }

    pub fn destination(&self, name: &str) -> Option<Arc<Destination>> {
        self.destinations
            .read()
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    pub fn destinations(&self) -> Vec<Arc<Destination>> {
        self.destinations.read().clone()
    }

    /// Destinations that should receive the notification, filters aside.
    fn targets(&self, notification: &Notification) -> Vec<Arc<Destination>> {
        if !self.config.enabled || notification.is_toast() {
            return Vec::new();
        }
        self.destinations
            .read()
            .iter()
            .filter(|d| d.accepts(notification))
            .cloned()
            .collect()
    }

    /// Deliver to every destination concurrently and wait for all of them.
    pub async fn dispatch_and_wait(
        &self,
        notification: &Notification,
        token: &CancellationToken,
    ) -> Vec<DeliveryReport> {
        let targets = self.targets(notification);
        join_all(
            targets
                .iter()
                .map(|dest| self.deliver(dest, notification, token)),
        )
        .await
    }

    /// Deliver in the background, one task per destination.
    pub fn dispatch(self: &Arc<Self>, notification: Notification) {
        let targets = self.targets(&notification);
        if targets.is_empty() {
            return;
        }
        let notification = Arc::new(notification);
        for dest in targets {
            let dispatcher = Arc::clone(self);
            let notification = Arc::clone(&notification);
            let token = self.cancellation_token.child_token();
            tokio::spawn(async move {
                dispatcher.deliver(&dest, &notification, &token).await;
            });
        }
    }

    /// Deliver one notification to one destination with bounded retries.
    pub async fn deliver(
        &self,
        dest: &Destination,
        notification: &Notification,
        token: &CancellationToken,
    ) -> DeliveryReport {
        let name = dest.name();
        let start = Instant::now();

        if !dest.filter.matches(notification) {
            debug!(destination = %name, id = %notification.id, "Notification filtered out");
            if let Some(metrics) = &self.metrics {
                metrics.record_filtered(name, notification.notification_type);
            }
            return DeliveryReport::new(name, DeliveryOutcome::Filtered);
        }

        if let Some(limiter) = &dest.rate_limiter
            && !limiter.allow()
        {
            self.on_rate_limited(name, limiter);
            let mut report = DeliveryReport::new(name, DeliveryOutcome::RateLimited);
            report.error = Some(format!("rate limit exceeded for '{name}'"));
            return report;
        }

        let timeout = self.config.default_timeout();
        let mut report = DeliveryReport::new(name, DeliveryOutcome::Failed);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            report.attempts = attempt;
            if attempt > 1
                && let Some(metrics) = &self.metrics
            {
                metrics.record_retry(name, attempt);
            }

            let attempt_start = Instant::now();
            let provider = dest.provider.clone();
            let result = dest
                .breaker
                .call(token, |t| send_once(provider, t, notification, timeout))
                .await;
            let attempt_elapsed = attempt_start.elapsed();

            let err = match result {
                Ok(()) => {
                    info!(
                        destination = %name,
                        id = %notification.id,
                        attempt,
                        elapsed = ?attempt_elapsed,
                        "Push notification delivered"
                    );
                    if let Some(health) = &self.health {
                        health.record_success(name);
                    }
                    return self.finish(report, DeliveryOutcome::Delivered, notification, start);
                }
                Err(e) if e.is_circuit_rejection() => {
                    warn!(destination = %name, id = %notification.id, error = %e, "Push skipped, circuit breaker rejected send");
                    report.error = Some(e.to_string());
                    return self.finish(report, DeliveryOutcome::CircuitRejected, notification, start);
                }
                Err(e) if e.is_cancelled() || token.is_cancelled() => {
                    debug!(destination = %name, id = %notification.id, "Push cancelled");
                    report.error = Some(Error::Cancelled.to_string());
                    return self.finish(report, DeliveryOutcome::Cancelled, notification, start);
                }
                Err(e) => e,
            };

            let category = ErrorCategory::classify(&err);
            let retryable = err.is_retryable();
            report.failed_attempts.push(RetryAttempt {
                attempt,
                retryable,
                category,
                elapsed: attempt_elapsed,
            });
            if let Some(metrics) = &self.metrics {
                metrics.record_error(name, category);
            }
            if let Some(telemetry) = &self.telemetry {
                telemetry.provider_request_error(name, &err, None);
            }
            if let Some(health) = &self.health {
                health.record_failure(name, &err.to_string());
            }

            if !retryable {
                error!(
                    destination = %name,
                    id = %notification.id,
                    attempt,
                    category = %category,
                    error = %err,
                    "Push send failed with terminal error"
                );
                report.error = Some(err.to_string());
                return self.finish(report, DeliveryOutcome::Failed, notification, start);
            }
            if attempt > self.config.max_retries {
                let exhausted = Error::RetriesExhausted {
                    destination: name.to_string(),
                    attempts: attempt,
                    source: Box::new(err),
                };
                error!(destination = %name, id = %notification.id, error = %exhausted, "Push send failed");
                report.error = Some(exhausted.to_string());
                return self.finish(report, DeliveryOutcome::Failed, notification, start);
            }

            let delay = self.config.retry_delay();
            warn!(
                destination = %name,
                id = %notification.id,
                attempt,
                category = %category,
                retry_in = ?delay,
                error = %err,
                "Push send failed, retrying"
            );
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(destination = %name, "Retry wait cancelled");
                    report.error = Some(Error::Cancelled.to_string());
                    return self.finish(report, DeliveryOutcome::Cancelled, notification, start);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn finish(
        &self,
        mut report: DeliveryReport,
        outcome: DeliveryOutcome,
        notification: &Notification,
        start: Instant,
    ) -> DeliveryReport {
        report.outcome = outcome;
        report.elapsed = start.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.record_delivery(
                &report.destination,
                notification.notification_type,
                outcome.as_str(),
                report.elapsed,
            );
        }
        report
    }

    fn on_rate_limited(&self, name: &str, limiter: &RateLimiter) {
        let stats = limiter.stats();
        warn!(
            destination = %name,
            denied = stats.denied,
            "Push skipped, destination rate limit exceeded"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_rate_limited(name);
        }
        // Report at 1, 2, 4, 8, ... denials.
        if stats.denied.is_power_of_two()
            && let Some(telemetry) = &self.telemetry
        {
            telemetry.rate_limit_exceeded(
                name,
                stats.denied,
                stats.drop_rate_percent(),
                limiter.refill_rate(),
            );
        }
    }

    /// Consume a notification stream and dispatch each one in the background.
    ///
    /// Toast notifications are skipped. Stops when `token` or
    /// [`Self::stop`] cancels, or when the stream closes.
    pub fn start(self: &Arc<Self>, mut rx: broadcast::Receiver<Notification>, token: &CancellationToken) {
        if !self.config.enabled {
            info!("Push dispatch disabled");
            return;
        }
        if self.destinations.read().is_empty() {
            info!("Push dispatch enabled but no destinations registered");
        }

        let dispatcher = Arc::clone(self);
        let own_token = self.cancellation_token.clone();
        let parent = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = own_token.cancelled() => break,
                    _ = parent.cancelled() => {
                        own_token.cancel();
                        break;
                    }
                    result = rx.recv() => match result {
                        Ok(notification) => {
                            if notification.is_toast() {
                                continue;
                            }
                            dispatcher.dispatch(notification);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Push dispatcher lagged by {} notifications", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Notification stream closed");
                            break;
                        }
                    }
                }
            }
            debug!("Push dispatcher listener stopped");
        });

        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
        info!(
            destinations = self.destinations.read().len(),
            "Push dispatcher started"
        );
    }

    /// Cancel in-flight deliveries and the stream listener.
    pub async fn stop(&self) {
        info!("Stopping push dispatcher");
        self.cancellation_token.cancel();
        let handle = self.listener.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            warn!(error = %e, "Push dispatcher listener ended abnormally");
        }
    }
}

/// One send with a per-attempt deadline, racing the caller's token.
async fn send_once(
    provider: Arc<dyn Provider>,
    token: CancellationToken,
    notification: &Notification,
    timeout: Option<Duration>,
) -> Result<()> {
    let attempt_token = token.child_token();
    let send = provider.send(attempt_token.clone(), notification);
    let timed = async {
        match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, send).await {
                Ok(result) => result,
                Err(_) => {
                    attempt_token.cancel();
                    Err(Error::Timeout(deadline))
                }
            },
            None => send.await,
        }
    };

    tokio::select! {
        _ = token.cancelled() => {
            attempt_token.cancel();
            Err(Error::Cancelled)
        }
        result = timed => result,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::{CircuitBreakerConfig, HealthCheckConfig};
    use crate::metrics::MetricsCollector;
    use crate::notification::{METADATA_KEY_IS_TOAST, NotificationType, Priority};
    use crate::resilience::CircuitState;

    /// Provider that replays scripted results, then succeeds.
    struct ScriptedProvider {
        name: String,
        script: parking_lot::Mutex<VecDeque<Result<()>>>,
        calls: AtomicU32,
        hang: bool,
        only: Option<NotificationType>,
    }

    impl ScriptedProvider {
        fn new(name: &str, script: Vec<Result<()>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script: parking_lot::Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                hang: false,
                only: None,
            })
        }

        fn hanging(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script: parking_lot::Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
                hang: true,
                only: None,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_enabled(&self) -> bool {
            true
        }

        fn supports_type(&self, t: NotificationType) -> bool {
            self.only.is_none_or(|only| only == t)
        }

        async fn validate_config(&self) -> Result<()> {
            Ok(())
        }

        async fn send(&self, token: CancellationToken, _: &Notification) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                token.cancelled().await;
                return Err(Error::Cancelled);
            }
            self.script.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    fn config(max_retries: u32) -> DispatcherConfig {
        DispatcherConfig {
            enabled: true,
            max_retries,
            retry_delay_ms: 1000,
            default_timeout_ms: 5000,
        }
    }

    fn breaker(name: &str, max_failures: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            name,
            CircuitBreakerConfig {
                max_failures,
                ..Default::default()
            },
        ))
    }

    fn alert() -> Notification {
        Notification::new(NotificationType::Error, Priority::High, "Disk", "disk full")
    }

    async fn dispatcher_with(
        config: DispatcherConfig,
        destinations: Vec<Destination>,
    ) -> Dispatcher {
        let dispatcher = Dispatcher::new(config);
        for d in destinations {
            dispatcher.register(d).await.unwrap();
        }
        dispatcher
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_errors_are_retried_until_success() {
        let provider = ScriptedProvider::new(
            "hook",
            vec![Err(Error::retryable("502")), Err(Error::retryable("503"))],
        );
        let dispatcher = dispatcher_with(
            config(3),
            vec![Destination::new(provider.clone(), breaker("hook", 10))],
        )
        .await;

        let reports = dispatcher
            .dispatch_and_wait(&alert(), &CancellationToken::new())
            .await;
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.outcome, DeliveryOutcome::Delivered);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.failed_attempts.len(), 2);
        assert!(report.elapsed >= Duration::from_secs(2));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_stops_immediately() {
        let provider = ScriptedProvider::new("hook", vec![Err(Error::terminal("401 unauthorized"))]);
        let dispatcher = dispatcher_with(
            config(3),
            vec![Destination::new(provider.clone(), breaker("hook", 10))],
        )
        .await;

        let report = dispatcher
            .dispatch_and_wait(&alert(), &CancellationToken::new())
            .await
            .remove(0);
        assert_eq!(report.outcome, DeliveryOutcome::Failed);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.failed_attempts[0].category, ErrorCategory::Permission);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let provider = ScriptedProvider::new(
            "hook",
            (0..5).map(|_| Err(Error::retryable("busy"))).collect(),
        );
        let dispatcher = dispatcher_with(
            config(2),
            vec![Destination::new(provider.clone(), breaker("hook", 10))],
        )
        .await;

        let report = dispatcher
            .dispatch_and_wait(&alert(), &CancellationToken::new())
            .await
            .remove(0);
        assert_eq!(report.outcome, DeliveryOutcome::Failed);
        assert_eq!(report.attempts, 3);
        assert!(report.error.unwrap().contains("failed after 3 attempts"));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable_failure() {
        let provider = ScriptedProvider::hanging("slow");
        let dispatcher = dispatcher_with(
            config(1),
            vec![Destination::new(provider.clone(), breaker("slow", 10))],
        )
        .await;

        let report = dispatcher
            .dispatch_and_wait(&alert(), &CancellationToken::new())
            .await
            .remove(0);
        assert_eq!(report.outcome, DeliveryOutcome::Failed);
        assert_eq!(report.attempts, 2);
        assert!(
            report
                .failed_attempts
                .iter()
                .all(|a| a.category == ErrorCategory::Timeout && a.retryable)
        );
        let dest = dispatcher.destination("slow").unwrap();
        assert_eq!(dest.breaker().failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_rejection_stops_without_counting() {
        let provider = ScriptedProvider::new("hook", vec![Err(Error::retryable("down"))]);
        let cb = breaker("hook", 1);
        let dispatcher = dispatcher_with(
            config(3),
            vec![Destination::new(provider.clone(), cb.clone())],
        )
        .await;

        let report = dispatcher
            .dispatch_and_wait(&alert(), &CancellationToken::new())
            .await
            .remove(0);
        // First attempt fails and opens the breaker; the retry is rejected.
        assert_eq!(report.outcome, DeliveryOutcome::CircuitRejected);
        assert_eq!(report.attempts, 2);
        assert_eq!(provider.calls(), 1);
        assert_eq!(cb.failures(), 1);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_retry_wait() {
        let provider = ScriptedProvider::new(
            "hook",
            (0..5).map(|_| Err(Error::retryable("busy"))).collect(),
        );
        let mut cfg = config(5);
        cfg.retry_delay_ms = 3_600_000;
        let dispatcher = Arc::new(
            dispatcher_with(
                cfg,
                vec![Destination::new(provider.clone(), breaker("hook", 10))],
            )
            .await,
        );

        let token = CancellationToken::new();
        let task = {
            let dispatcher = dispatcher.clone();
            let token = token.clone();
            tokio::spawn(async move { dispatcher.dispatch_and_wait(&alert(), &token).await })
        };
        tokio::time::sleep(Duration::from_secs(10)).await;
        token.cancel();

        let start = Instant::now();
        let report = task.await.unwrap().remove(0);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(report.outcome, DeliveryOutcome::Cancelled);
        assert_eq!(provider.calls(), 1);
        assert_eq!(dispatcher.destination("hook").unwrap().breaker().failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_send_is_not_a_failure() {
        let provider = ScriptedProvider::hanging("slow");
        let mut cfg = config(3);
        cfg.default_timeout_ms = 0;
        let dispatcher = Arc::new(
            dispatcher_with(cfg, vec![Destination::new(provider.clone(), breaker("slow", 1))]).await,
        );

        let token = CancellationToken::new();
        let task = {
            let dispatcher = dispatcher.clone();
            let token = token.clone();
            tokio::spawn(async move { dispatcher.dispatch_and_wait(&alert(), &token).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        let report = task.await.unwrap().remove(0);
        assert_eq!(report.outcome, DeliveryOutcome::Cancelled);
        let cb = dispatcher.destination("slow").unwrap().breaker().clone();
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_and_rate_limit() {
        let metrics = Arc::new(MetricsCollector::new());
        let filtered = ScriptedProvider::new("detections-only", vec![]);
        let limited = ScriptedProvider::new("limited", vec![]);
        let dispatcher = Dispatcher::new(config(0)).with_metrics(metrics.clone());
        dispatcher
            .register(
                Destination::new(filtered.clone(), breaker("detections-only", 5)).with_filter(
                    PushFilter {
                        types: vec![NotificationType::Detection],
                        ..Default::default()
                    },
                ),
            )
            .await
            .unwrap();
        dispatcher
            .register(
                Destination::new(limited.clone(), breaker("limited", 5))
                    .with_rate_limiter(Arc::new(RateLimiter::new(1, 1, Duration::from_secs(60)))),
            )
            .await
            .unwrap();

        let token = CancellationToken::new();
        let first = dispatcher.dispatch_and_wait(&alert(), &token).await;
        let second = dispatcher.dispatch_and_wait(&alert(), &token).await;

        let outcome = |reports: &[DeliveryReport], name: &str| {
            reports
                .iter()
                .find(|r| r.destination == name)
                .map(|r| r.outcome)
        };
        assert_eq!(outcome(&first, "detections-only"), Some(DeliveryOutcome::Filtered));
        assert_eq!(outcome(&first, "limited"), Some(DeliveryOutcome::Delivered));
        assert_eq!(outcome(&second, "limited"), Some(DeliveryOutcome::RateLimited));
        assert_eq!(filtered.calls(), 0);
        assert_eq!(limited.calls(), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.filtered["detections-only"], 2);
        assert_eq!(snapshot.rate_limited["limited"], 1);
        assert_eq!(metrics.deliveries("limited", "success"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toasts_and_unsupported_types_are_skipped() {
        let mut only_detections = ScriptedProvider::new("birds", vec![]);
        Arc::get_mut(&mut only_detections).unwrap().only = Some(NotificationType::Detection);
        let dispatcher = dispatcher_with(
            config(0),
            vec![Destination::new(only_detections.clone(), breaker("birds", 5))],
        )
        .await;
        let token = CancellationToken::new();

        assert!(dispatcher.dispatch_and_wait(&alert(), &token).await.is_empty());

        let toast = Notification::new(NotificationType::Detection, Priority::Low, "t", "m")
            .with_metadata(METADATA_KEY_IS_TOAST, true);
        assert!(dispatcher.dispatch_and_wait(&toast, &token).await.is_empty());
        assert_eq!(only_detections.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destinations_are_isolated() {
        let slow = ScriptedProvider::hanging("slow");
        let fast = ScriptedProvider::new("fast", vec![]);
        let dispatcher = dispatcher_with(
            config(0),
            vec![
                Destination::new(slow.clone(), breaker("slow", 5)),
                Destination::new(fast.clone(), breaker("fast", 5)),
            ],
        )
        .await;

        let reports = dispatcher
            .dispatch_and_wait(&alert(), &CancellationToken::new())
            .await;
        let fast_report = reports.iter().find(|r| r.destination == "fast").unwrap();
        let slow_report = reports.iter().find(|r| r.destination == "slow").unwrap();
        assert_eq!(fast_report.outcome, DeliveryOutcome::Delivered);
        assert!(fast_report.elapsed < Duration::from_secs(1));
        assert_eq!(slow_report.outcome, DeliveryOutcome::Failed);
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_and_duplicates() {
        struct Invalid;

        #[async_trait]
        impl Provider for Invalid {
            fn name(&self) -> &str {
                "invalid"
            }
            fn is_enabled(&self) -> bool {
                true
            }
            fn supports_type(&self, _: NotificationType) -> bool {
                true
            }
            async fn validate_config(&self) -> Result<()> {
                Err(Error::config("missing url"))
            }
            async fn send(&self, _: CancellationToken, _: &Notification) -> Result<()> {
                Ok(())
            }
        }

        let dispatcher = Dispatcher::new(config(0));
        assert!(
            dispatcher
                .register(Destination::new(Arc::new(Invalid), breaker("invalid", 5)))
                .await
                .is_err()
        );

        let ok = ScriptedProvider::new("hook", vec![]);
        dispatcher
            .register(Destination::new(ok.clone(), breaker("hook", 5)))
            .await
            .unwrap();
        assert!(
            dispatcher
                .register(Destination::new(ok, breaker("hook", 5)))
                .await
                .is_err()
        );
        assert_eq!(dispatcher.destinations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_outcomes_reach_health_checker() {
        let health = Arc::new(HealthChecker::new(HealthCheckConfig::default()));
        let provider = ScriptedProvider::new("hook", vec![Err(Error::terminal("400 bad request"))]);
        let dispatcher = Dispatcher::new(config(0)).with_health_checker(health.clone());
        dispatcher
            .register(Destination::new(provider, breaker("hook", 5)))
            .await
            .unwrap();

        let token = CancellationToken::new();
        dispatcher.dispatch_and_wait(&alert(), &token).await;
        assert!(!health.get_provider_health("hook").unwrap().healthy);

        dispatcher.dispatch_and_wait(&alert(), &token).await;
        let record = health.get_provider_health("hook").unwrap();
        assert!(record.healthy);
        assert_eq!(record.total_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_consumes_stream_and_stop() {
        let provider = ScriptedProvider::new("hook", vec![]);
        let dispatcher = Arc::new(
            dispatcher_with(config(0), vec![Destination::new(provider.clone(), breaker("hook", 5))])
                .await,
        );
        let (tx, rx) = broadcast::channel(16);
        let token = CancellationToken::new();
        dispatcher.start(rx, &token);

        tx.send(alert()).unwrap();
        tx.send(alert().with_metadata(METADATA_KEY_IS_TOAST, true))
            .unwrap();
        tx.send(alert()).unwrap();

        while provider.calls() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(provider.calls(), 2);

        dispatcher.stop().await;
    }
}
