//! Resource alert worker.
//!
//! Alerts are throttled per identity (resource type, disk path, severity).
//! Expired throttle entries are removed lazily on lookup and by a periodic
//! sweep; both paths share one lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ResourceWorkerConfig;
use crate::notification::{Notification, NotificationStore, NotificationType, Priority};
use crate::{Error, Result};

const COMPONENT: &str = "system-monitor";

const ALERT_EXPIRY: Duration = Duration::from_secs(60 * 60);
const QUICK_EXPIRY: Duration = Duration::from_secs(15 * 60);
const LONG_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Cpu,
    Memory,
    Disk,
    #[serde(other)]
    Other,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Other => "other",
        }
    }

    fn display_name(&self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Memory => "Memory",
            Self::Disk => "Disk",
            Self::Other => "Resource",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Recovery,
    Warning,
    Critical,
    /// Anything else; such events are ignored.
    #[serde(other)]
    Unknown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recovery => "recovery",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        }
    }
}

/// A resource threshold crossing published by the system monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub resource_type: ResourceType,
    /// Mount point for disk events.
    #[serde(default)]
    pub path: String,
    pub severity: Severity,
    pub current_value: f64,
    pub threshold: f64,
    pub message: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ResourceEvent {
    pub fn new(
        resource_type: ResourceType,
        severity: Severity,
        current_value: f64,
        threshold: f64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            path: String::new(),
            severity,
            current_value,
            threshold,
            message: message.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Throttle identity. Disk alerts are tracked per mount point.
    pub fn alert_key(&self) -> String {
        if self.resource_type == ResourceType::Disk && !self.path.is_empty() {
            format!(
                "{}|{}|{}",
                self.resource_type.as_str(),
                self.path.replace('|', "_"),
                self.severity.as_str()
            )
        } else {
            format!("{}|{}", self.resource_type.as_str(), self.severity.as_str())
        }
    }

    fn resource_name(&self) -> String {
        let name = self.resource_type.display_name();
        if self.resource_type == ResourceType::Disk && !self.path.is_empty() {
            format!("{name} ({})", self.path)
        } else {
            name.to_string()
        }
    }

    /// Notification type, priority and title, or `None` for unknown severity.
    fn classify(&self) -> Option<(NotificationType, Priority, String)> {
        let name = self.resource_name();
        let is_disk = self.resource_type == ResourceType::Disk;
        match self.severity {
            Severity::Recovery => Some((
                NotificationType::Info,
                if is_disk { Priority::Medium } else { Priority::Low },
                format!("{name} Usage Recovered"),
            )),
            Severity::Warning => Some((
                NotificationType::Warning,
                Priority::High,
                format!("High {name} Usage"),
            )),
            Severity::Critical => Some((
                NotificationType::Warning,
                Priority::Critical,
                format!("Critical {name} Usage"),
            )),
            Severity::Unknown => None,
        }
    }

    fn expiry(&self) -> Duration {
        let is_disk = self.resource_type == ResourceType::Disk;
        match self.severity {
            Severity::Recovery if is_disk => ALERT_EXPIRY,
            Severity::Recovery => QUICK_EXPIRY,
            Severity::Critical if is_disk => LONG_EXPIRY,
            _ => ALERT_EXPIRY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub processed: u64,
    pub suppressed: u64,
    /// Identities currently held in the throttle map.
    pub tracked_alerts: usize,
}

struct Sweeper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Creates throttled notifications from resource events.
pub struct ResourceEventWorker {
    store: Arc<dyn NotificationStore>,
    default_cooldown: Duration,
    cooldowns: HashMap<String, Duration>,
    cleanup_interval: Duration,
    last_alert: Mutex<HashMap<String, Instant>>,
    processed: AtomicU64,
    suppressed: AtomicU64,
    sweeper: Mutex<Option<Sweeper>>,
}

impl ResourceEventWorker {
    pub fn new(store: Arc<dyn NotificationStore>, config: &ResourceWorkerConfig) -> Self {
        let cooldowns = config
            .resource_throttles
            .iter()
            .map(|(k, secs)| (k.to_ascii_lowercase(), Duration::from_secs(*secs)))
            .collect();
        Self {
            store,
            default_cooldown: config.alert_throttle(),
            cooldowns,
            cleanup_interval: config.cleanup_interval(),
            last_alert: Mutex::new(HashMap::new()),
            processed: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    /// Cooldown applied to alerts of the given type.
    pub fn cooldown_for(&self, resource_type: ResourceType) -> Duration {
        self.cooldowns
            .get(resource_type.as_str())
            .copied()
            .unwrap_or(self.default_cooldown)
    }

    /// Entries older than this are swept.
    fn max_age(&self) -> Duration {
        self.cooldowns
            .values()
            .copied()
            .fold(self.default_cooldown, Duration::max)
            * 2
    }

    /// Create a notification for the event unless its identity is cooling down.
    ///
    /// Returns `None` when the event was suppressed or has an unknown
    /// severity.
    pub async fn process_event(&self, event: &ResourceEvent) -> Result<Option<Notification>> {
        let Some((notification_type, priority, title)) = event.classify() else {
            debug!(resource = event.resource_type.as_str(), "Ignoring resource event with unknown severity");
            return Ok(None);
        };

        let key = event.alert_key();
        let cooldown = self.cooldown_for(event.resource_type);
        if !self.try_record(&key, cooldown, Instant::now()) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(
                resource = event.resource_type.as_str(),
                severity = event.severity.as_str(),
                cooldown = ?cooldown,
                "Suppressing duplicate resource alert"
            );
            return Ok(None);
        }

        let mut notification =
            Notification::new(notification_type, priority, title, event.message.clone())
                .with_component(COMPONENT);
        for (k, v) in &event.metadata {
            notification.set_metadata(k.clone(), v.clone());
        }
        notification.set_metadata("resource_type", event.resource_type.as_str());
        notification.set_metadata("current_value", event.current_value);
        notification.set_metadata("threshold", event.threshold);
        notification.set_metadata("severity", event.severity.as_str());
        if !event.path.is_empty() {
            notification.set_metadata("path", event.path.clone());
        }
        notification.set_expiry(event.expiry());

        self.store
            .save(&notification)
            .await
            .map_err(|e| Error::store(format!("failed to create resource notification: {e}")))?;
        self.processed.fetch_add(1, Ordering::Relaxed);

        info!(
            resource = event.resource_type.as_str(),
            severity = event.severity.as_str(),
            current_value = event.current_value,
            threshold = event.threshold,
            id = %notification.id,
            "Resource alert notification created"
        );
        Ok(Some(notification))
    }

    /// Check the cooldown and book the alert under one lock.
    fn try_record(&self, key: &str, cooldown: Duration, now: Instant) -> bool {
        let mut last_alert = self.last_alert.lock();
        if let Some(last) = last_alert.get(key) {
            if now.saturating_duration_since(*last) < cooldown {
                return false;
            }
            last_alert.remove(key);
        }
        last_alert.insert(key.to_string(), now);
        true
    }

    /// Drop throttle entries older than twice the largest cooldown.
    pub fn sweep(&self) -> usize {
        let max_age = self.max_age();
        let now = Instant::now();
        let mut last_alert = self.last_alert.lock();
        let before = last_alert.len();
        last_alert.retain(|key, last| {
            let keep = now.saturating_duration_since(*last) <= max_age;
            if !keep {
                debug!(key = %key, "Swept stale alert entry");
            }
            keep
        });
        before - last_alert.len()
    }

    /// Start the periodic sweep.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let token = parent.child_token();
        let loop_token = token.clone();
        let worker = Arc::clone(self);
        let period = self.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = worker.sweep();
                        if removed > 0 {
                            debug!(removed, "Resource alert sweep");
                        }
                    }
                }
            }
        });
        *sweeper = Some(Sweeper { token, handle });
        debug!(interval = ?period, "Resource alert sweep started");
    }

    /// Stop the sweep and wait for it to exit.
    pub async fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(Sweeper { token, handle }) = sweeper {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Resource alert sweep ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            processed: self.processed.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            tracked_alerts: self.last_alert.lock().len(),
        }
    }
}
