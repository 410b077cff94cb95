//! Periodic health probing of push destinations.
//!
//! Each tick probes every registered destination concurrently. A probe runs
//! the provider's config validation through the destination's own breaker, so
//! an open circuit decides whether the probe executes at all.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthCheckConfig;
use crate::metrics::MetricsSink;
use crate::notification::Provider;
use crate::resilience::{CircuitBreaker, CircuitState};
use crate::{Error, Result};

/// Health record of one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub name: String,
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub circuit_state: CircuitState,
    pub last_error: Option<String>,
}

impl ProviderHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            healthy: true,
            last_check: None,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
            total_attempts: 0,
            total_successes: 0,
            total_failures: 0,
            circuit_state: CircuitState::Closed,
            last_error: None,
        }
    }
}

/// Aggregate counts across destinations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub circuit_closed: usize,
    pub circuit_half_open: usize,
    pub circuit_open: usize,
}

struct Entry {
    provider: Arc<dyn Provider>,
    breaker: Option<Arc<CircuitBreaker>>,
    health: ProviderHealth,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Probes destinations on a fixed interval and keeps their health records.
pub struct HealthChecker {
    config: HealthCheckConfig,
    entries: RwLock<BTreeMap<String, Entry>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    running: Mutex<Option<Running>>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(BTreeMap::new()),
            metrics: None,
            running: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Register a destination. Without a breaker, probes call the provider
    /// directly.
    pub fn register_provider(
        &self,
        provider: Arc<dyn Provider>,
        breaker: Option<Arc<CircuitBreaker>>,
    ) {
        let name = provider.name().to_string();
        let mut health = ProviderHealth::new(&name);
        if let Some(breaker) = &breaker {
            health.circuit_state = breaker.state();
        }
        debug!(destination = %name, "Registered provider for health checks");
        self.entries.write().insert(
            name,
            Entry {
                provider,
                breaker,
                health,
            },
        );
    }

    /// Start the probe loop. A disabled checker starts nothing.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) -> Result<()> {
        if !self.config.enabled {
            info!("Health checks disabled");
            return Ok(());
        }
        if let Err(e) = self.config.validate() {
            warn!(error = %e, "Health check configuration invalid, proceeding anyway");
        }

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(Error::Other("health checker already started".to_string()));
        }

        let token = parent.child_token();
        let checker = Arc::clone(self);
        let loop_token = token.clone();
        let interval = self.config.interval().max(std::time::Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => {
                        debug!("Health check loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        checker.check_all(&loop_token).await;
                    }
                }
            }
        });

        *running = Some(Running { token, handle });
        info!(
            interval = ?self.config.interval(),
            timeout = ?self.config.timeout(),
            "Health checker started"
        );
        Ok(())
    }

    /// Stop the probe loop and wait for it to exit.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(Running { token, handle }) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Health check loop ended abnormally");
            }
            info!("Health checker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Probe every registered destination concurrently.
    pub async fn check_all(&self, token: &CancellationToken) {
        let targets: Vec<(String, Arc<dyn Provider>, Option<Arc<CircuitBreaker>>)> = self
            .entries
            .read()
            .iter()
            .map(|(name, e)| (name.clone(), e.provider.clone(), e.breaker.clone()))
            .collect();

        join_all(
            targets
                .into_iter()
                .map(|(name, provider, breaker)| self.probe(name, provider, breaker, token)),
        )
        .await;
    }

    /// Probe one destination now.
    pub async fn check_provider(&self, name: &str, token: &CancellationToken) -> Option<ProviderHealth> {
        let (provider, breaker) = {
            let entries = self.entries.read();
            let entry = entries.get(name)?;
            (entry.provider.clone(), entry.breaker.clone())
        };
        self.probe(name.to_string(), provider, breaker, token).await;
        self.get_provider_health(name)
    }

    async fn probe(
        &self,
        name: String,
        provider: Arc<dyn Provider>,
        breaker: Option<Arc<CircuitBreaker>>,
        token: &CancellationToken,
    ) {
        let timeout = self.config.timeout();
        let op = move |t: CancellationToken| async move {
            tokio::select! {
                _ = t.cancelled() => Err(Error::Cancelled),
                result = tokio::time::timeout(timeout, provider.validate_config()) => {
                    result.map_err(|_| Error::Timeout(timeout)).and_then(|r| r)
                }
            }
        };

        let probe_token = token.child_token();
        let result = match &breaker {
            Some(breaker) => breaker.call(&probe_token, op).await,
            None => op(probe_token).await,
        };

        match &result {
            Err(e) if e.is_cancelled() => return,
            Err(e) if e.is_circuit_rejection() => {
                debug!(destination = %name, error = %e, "Health probe gated by circuit breaker");
                self.refresh_circuit_state(&name, breaker.as_deref());
                return;
            }
            Ok(()) => self.record_success(&name),
            Err(e) => {
                debug!(destination = %name, error = %e, "Health probe failed");
                self.record_failure(&name, &e.to_string());
            }
        }
        self.refresh_circuit_state(&name, breaker.as_deref());
    }

    fn refresh_circuit_state(&self, name: &str, breaker: Option<&CircuitBreaker>) {
        if let Some(breaker) = breaker
            && let Some(entry) = self.entries.write().get_mut(name)
        {
            entry.health.circuit_state = breaker.state();
        }
    }

    /// Record a successful probe or send.
    pub fn record_success(&self, name: &str) {
        let recovered = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(name) else {
                return;
            };
            let now = Utc::now();
            let health = &mut entry.health;
            let recovered = !health.healthy;
            health.healthy = true;
            health.last_check = Some(now);
            health.last_success = Some(now);
            health.consecutive_failures = 0;
            health.total_attempts += 1;
            health.total_successes += 1;
            health.last_error = None;
            if let Some(breaker) = &entry.breaker {
                health.circuit_state = breaker.state();
            }
            recovered
        };

        if recovered {
            info!(destination = %name, "Destination healthy again");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_health(name, true);
        }
    }

    /// Record a failed probe or send.
    pub fn record_failure(&self, name: &str, error: &str) {
        let became_unhealthy = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(name) else {
                return;
            };
            let now = Utc::now();
            let health = &mut entry.health;
            let became_unhealthy = health.healthy;
            health.healthy = false;
            health.last_check = Some(now);
            health.last_failure = Some(now);
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.total_attempts += 1;
            health.total_failures += 1;
            health.last_error = Some(error.to_string());
            if let Some(breaker) = &entry.breaker {
                health.circuit_state = breaker.state();
            }
            became_unhealthy
        };

        if became_unhealthy {
            warn!(destination = %name, error, "Destination unhealthy");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_health(name, false);
        }
    }

    pub fn get_provider_health(&self, name: &str) -> Option<ProviderHealth> {
        self.entries.read().get(name).map(|e| e.health.clone())
    }

    /// Every health record, ordered by destination name.
    pub fn get_all_provider_health(&self) -> Vec<ProviderHealth> {
        self.entries
            .read()
            .values()
            .map(|e| e.health.clone())
            .collect()
    }

    /// True when every registered destination is healthy.
    pub fn is_healthy(&self) -> bool {
        self.entries.read().values().all(|e| e.health.healthy)
    }

    pub fn health_summary(&self) -> HealthSummary {
        let entries = self.entries.read();
        let mut summary = HealthSummary {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            if entry.health.healthy {
                summary.healthy += 1;
            } else {
                summary.unhealthy += 1;
            }
            let state = entry
                .breaker
                .as_ref()
                .map(|b| b.state())
                .unwrap_or(entry.health.circuit_state);
            match state {
                CircuitState::Closed => summary.circuit_closed += 1,
                CircuitState::HalfOpen => summary.circuit_half_open += 1,
                CircuitState::Open => summary.circuit_open += 1,
            }
        }
        summary
    }
}
