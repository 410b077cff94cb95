//! Workers turning internally generated events into notifications.
//!
//! [`ErrorEventWorker`] aggregates error events behind an [`EventBreaker`];
//! [`ResourceEventWorker`] throttles resource alerts per alert identity.

pub mod resource;

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use resource::{ResourceEvent, ResourceEventWorker, ResourceStats, ResourceType, Severity};

use crate::config::WorkerConfig;
use crate::notification::{Notification, NotificationStore, NotificationType, Priority};
use crate::resilience::{CircuitState, EventBreaker, EventPermit};
use crate::telemetry::NotificationTelemetry;
use crate::{Error, Result};

/// Non-critical error notifications expire after this long.
pub const ERROR_NOTIFICATION_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

const MAX_MESSAGE_LEN: usize = 500;
const MAX_SUMMARY_MESSAGES: usize = 5;
const MAX_SUMMARY_LINE_LEN: usize = 100;

const WORKER_NAME: &str = "error-event-worker";

/// An internally generated error, as published by application components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub component: String,
    pub category: String,
    pub message: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    /// Explicit priority, overriding the category mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl ErrorEvent {
    pub fn new(
        component: impl Into<String>,
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            category: category.into(),
            message: message.into(),
            context: Map::new(),
            timestamp: Utc::now(),
            priority: None,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Notification priority for this event.
    pub fn effective_priority(&self) -> Priority {
        self.priority
            .unwrap_or_else(|| priority_for_category(&self.category))
    }
}

/// Default priority for an error category.
pub fn priority_for_category(category: &str) -> Priority {
    match category {
        "database" | "model-initialization" | "model-loading" => Priority::Critical,
        "system-resource" | "configuration" | "file-io" | "disk-usage" => Priority::High,
        "validation" | "not-found" | "generic" => Priority::Low,
        _ => Priority::Medium,
    }
}

/// Snapshot of worker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub events_processed: u64,
    pub events_dropped: u64,
    pub events_failed: u64,
    pub circuit_state: CircuitState,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct GroupKey {
    component: String,
    category: String,
    priority: Priority,
}

/// Aggregating worker for error events.
///
/// Low priority events are skipped. Everything else becomes an error
/// notification, unless the worker's breaker is open because notification
/// creation keeps failing.
pub struct ErrorEventWorker {
    store: Arc<dyn NotificationStore>,
    config: WorkerConfig,
    breaker: EventBreaker,
    telemetry: Option<Arc<NotificationTelemetry>>,
    processed: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl ErrorEventWorker {
    pub fn new(store: Arc<dyn NotificationStore>, config: WorkerConfig) -> Self {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Invalid worker configuration, continuing");
        }
        let breaker = EventBreaker::new(
            WORKER_NAME,
            config.failure_threshold,
            config.recovery_timeout(),
            config.half_open_max_events,
        );
        info!(
            batching = config.batching_enabled,
            batch_size = config.batch_size,
            batch_timeout = ?config.batch_timeout(),
            failure_threshold = config.failure_threshold,
            recovery_timeout = ?config.recovery_timeout(),
            half_open_max_events = config.half_open_max_events,
            "Error event worker initialized"
        );
        Self {
            store,
            config,
            breaker,
            telemetry: None,
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<NotificationTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn breaker(&self) -> &EventBreaker {
        &self.breaker
    }

    /// Turn one event into a notification.
    ///
    /// Returns the created notification, or `None` when the event was
    /// skipped or dropped. Store rate limiting is an expected drop, not an
    /// error.
    pub async fn process_event(&self, event: &ErrorEvent) -> Result<Option<Notification>> {
        if self.config.debug {
            debug!(
                component = %event.component,
                category = %event.category,
                message_len = event.message.len(),
                "Processing error event"
            );
        }

        let priority = event.effective_priority();
        if priority == Priority::Low {
            debug!(
                component = %event.component,
                category = %event.category,
                "Skipping low priority error event"
            );
            return Ok(None);
        }

        let Some(permit) = self.breaker.allow() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                component = %event.component,
                category = %event.category,
                "Event breaker open, dropping event"
            );
            return Ok(None);
        };

        let mut notification = Notification::new(
            NotificationType::Error,
            priority,
            title_for(&event.category, &event.component, priority),
            message_for(event, priority),
        )
        .with_component(event.component.clone());
        for (key, value) in &event.context {
            notification.set_metadata(key.clone(), value.clone());
        }
        if priority != Priority::Critical {
            notification.set_expiry(ERROR_NOTIFICATION_EXPIRY);
        }

        match self.store.save(&notification).await {
            Ok(()) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                permit.success();
                if self.config.debug {
                    debug!(
                        id = %notification.id,
                        component = %event.component,
                        priority = %priority,
                        "Created error notification"
                    );
                }
                Ok(Some(notification))
            }
            Err(e) => self.on_create_failure(permit, 1, &event.component, &event.category, e),
        }
    }

    /// Aggregate a batch into at most one notification per
    /// (component, category, priority) group.
    ///
    /// Every group is attempted; the first failure is returned after all
    /// groups have run.
    pub async fn process_batch(&self, events: &[ErrorEvent]) -> Result<Vec<Notification>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut groups: BTreeMap<GroupKey, Vec<&ErrorEvent>> = BTreeMap::new();
        for event in events {
            let priority = event.effective_priority();
            if priority == Priority::Low {
                continue;
            }
            groups
                .entry(GroupKey {
                    component: event.component.clone(),
                    category: event.category.clone(),
                    priority,
                })
                .or_default()
                .push(event);
        }

        let group_count = groups.len();
        let mut created = Vec::with_capacity(group_count);
        let mut first_error = None;
        for (key, group) in groups {
            match self.process_group(&key, &group).await {
                Ok(Some(notification)) => created.push(notification),
                Ok(None) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!(
            total = events.len(),
            groups = group_count,
            created = created.len(),
            "Processed error event batch"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(created),
        }
    }

    async fn process_group(
        &self,
        key: &GroupKey,
        group: &[&ErrorEvent],
    ) -> Result<Option<Notification>> {
        let count = group.len() as u64;
        let Some(permit) = self.breaker.allow() else {
            self.dropped.fetch_add(count, Ordering::Relaxed);
            debug!(
                component = %key.component,
                category = %key.category,
                count,
                "Event breaker open, dropping event group"
            );
            return Ok(None);
        };

        let title = format!(
            "{} ({} occurrences)",
            title_for(&key.category, &key.component, key.priority),
            group.len()
        );
        let mut notification = Notification::new(
            NotificationType::Error,
            key.priority,
            title,
            aggregated_message(key, group),
        )
        .with_component(key.component.clone())
        .with_metadata("error_count", group.len());
        if let (Some(first), Some(last)) = (group.first(), group.last()) {
            notification.set_metadata("first_occurrence", first.timestamp.to_rfc3339());
            notification.set_metadata("last_occurrence", last.timestamp.to_rfc3339());
        }
        if key.priority != Priority::Critical {
            notification.set_expiry(ERROR_NOTIFICATION_EXPIRY);
        }

        match self.store.save(&notification).await {
            Ok(()) => {
                self.processed.fetch_add(count, Ordering::Relaxed);
                permit.success();
                Ok(Some(notification))
            }
            Err(e) => self.on_create_failure(permit, count, &key.component, &key.category, e),
        }
    }

    fn on_create_failure(
        &self,
        permit: EventPermit<'_>,
        count: u64,
        component: &str,
        category: &str,
        err: Error,
    ) -> Result<Option<Notification>> {
        self.failed.fetch_add(count, Ordering::Relaxed);
        permit.failure();

        if err.is_rate_limited() {
            self.dropped.fetch_add(count, Ordering::Relaxed);
            debug!(component, category, "Store rate limited, dropping notification");
            return Ok(None);
        }
        error!(component, category, error = %err, "Failed to create error notification");
        Err(err)
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            events_processed: self.processed.load(Ordering::Relaxed),
            events_dropped: self.dropped.load(Ordering::Relaxed),
            events_failed: self.failed.load(Ordering::Relaxed),
            circuit_state: self.breaker.state(),
        }
    }

    /// Consume events until the channel closes or `token` is cancelled.
    ///
    /// With batching enabled, events are buffered until `batch_size` is
    /// reached or `batch_timeout` passes. A panic while processing is
    /// caught, logged and reported; the affected events are dropped and the
    /// loop keeps running.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<ErrorEvent>, token: CancellationToken) {
        let batching = self.config.batching_enabled && self.config.batch_size > 1;
        let batch_size = self.config.batch_size.max(1);
        let mut buffer: Vec<ErrorEvent> = Vec::with_capacity(batch_size);
        let mut flush_timer = tokio::time::interval(self.config.batch_timeout().max(Duration::from_millis(1)));
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(batching, "Error event worker started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.flush(std::mem::take(&mut buffer)).await;
                    break;
                }
                event = rx.recv() => match event {
                    Some(event) if batching => {
                        buffer.push(event);
                        if buffer.len() >= batch_size {
                            self.flush(std::mem::take(&mut buffer)).await;
                        }
                    }
                    Some(event) => self.flush(vec![event]).await,
                    None => {
                        self.flush(std::mem::take(&mut buffer)).await;
                        break;
                    }
                },
                _ = flush_timer.tick(), if batching => {
                    if !buffer.is_empty() {
                        self.flush(std::mem::take(&mut buffer)).await;
                    }
                }
            }
        }
        info!(stats = ?self.stats(), "Error event worker stopped");
    }

    async fn flush(&self, events: Vec<ErrorEvent>) {
        if events.is_empty() {
            return;
        }
        let count = events.len() as u64;
        let work = async {
            if events.len() == 1 {
                self.process_event(&events[0]).await.map(|_| ())
            } else {
                self.process_batch(&events).await.map(|_| ())
            }
        };

        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Error event processing failed"),
            Err(payload) => {
                self.dropped.fetch_add(count, Ordering::Relaxed);
                let message = panic_message(payload.as_ref());
                error!(worker = WORKER_NAME, panic = %message, "Recovered from panic while processing events");
                if let Some(telemetry) = &self.telemetry {
                    let stats = self.stats();
                    telemetry.worker_panic_recovered(
                        WORKER_NAME,
                        &message,
                        stats.events_processed,
                        stats.events_dropped,
                    );
                }
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "<non-string panic payload>".to_string()
}

fn title_for(category: &str, component: &str, priority: Priority) -> String {
    match priority {
        Priority::Critical => format!("Critical {category} Error in {component}"),
        Priority::High => format!("{category} Error in {component}"),
        _ => format!("{component} Issue"),
    }
}

fn message_for(event: &ErrorEvent, priority: Priority) -> String {
    let ErrorEvent {
        component,
        category,
        message,
        ..
    } = event;
    let text = match priority {
        Priority::Critical => format!("Critical {category} error in {component}: {message}"),
        Priority::High => format!("{category} error in {component}: {message}"),
        Priority::Medium => format!("{component} reported: {message}"),
        Priority::Low => format!("Minor issue in {component}"),
    };
    truncate(&text, MAX_MESSAGE_LEN)
}

fn aggregated_message(key: &GroupKey, group: &[&ErrorEvent]) -> String {
    let mut out = format!("Multiple {} errors in {}:\n", key.category, key.component);
    let mut seen: HashSet<&str> = HashSet::new();
    for event in group {
        if seen.len() >= MAX_SUMMARY_MESSAGES {
            out.push_str(&format!("\n... and {} more errors", group.len() - seen.len()));
            break;
        }
        if seen.insert(event.message.as_str()) {
            out.push_str("\n• ");
            out.push_str(&truncate(&event.message, MAX_SUMMARY_LINE_LEN));
        }
    }
    out
}

/// Cut to at most `max` characters, ending in `...` when shortened.
fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::notification::MemoryStore;

    /// Store that fails every save with a scripted error.
    #[derive(Default)]
    struct FailingStore {
        rate_limited: bool,
        saves: Mutex<u32>,
    }

    #[async_trait]
    impl NotificationStore for FailingStore {
        async fn save(&self, _: &Notification) -> Result<()> {
            *self.saves.lock() += 1;
            if self.rate_limited {
                Err(Error::RateLimited("too many notifications".into()))
            } else {
                Err(Error::store("disk full"))
            }
        }

        async fn update(&self, _: &Notification) -> Result<()> {
            Ok(())
        }
    }

    fn worker(store: Arc<dyn NotificationStore>) -> ErrorEventWorker {
        ErrorEventWorker::new(
            store,
            WorkerConfig {
                failure_threshold: 2,
                recovery_timeout_secs: 30,
                half_open_max_events: 1,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_priority_mapping() {
        assert_eq!(priority_for_category("database"), Priority::Critical);
        assert_eq!(priority_for_category("file-io"), Priority::High);
        assert_eq!(priority_for_category("validation"), Priority::Low);
        assert_eq!(priority_for_category("network"), Priority::Medium);

        let event = ErrorEvent::new("api", "validation", "bad").with_priority(Priority::High);
        assert_eq!(event.effective_priority(), Priority::High);
    }

    #[tokio::test]
    async fn test_process_event_creates_notification() {
        let store = Arc::new(MemoryStore::new());
        let w = worker(store.clone());
        let event = ErrorEvent::new("detector", "database", "connection lost")
            .with_context("table", "notes");

        let n = w.process_event(&event).await.unwrap().unwrap();
        assert_eq!(n.priority, Priority::Critical);
        assert_eq!(n.title, "Critical database Error in detector");
        assert_eq!(n.message, "Critical database error in detector: connection lost");
        assert_eq!(n.metadata["table"], "notes");
        assert!(n.expires_at.is_none());
        assert_eq!(store.len(), 1);

        let n = w
            .process_event(&ErrorEvent::new("mqtt", "network", "timeout"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n.title, "mqtt Issue");
        assert!(n.expires_at.is_some());
        assert_eq!(w.stats().events_processed, 2);
    }

    #[tokio::test]
    async fn test_low_priority_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let w = worker(store.clone());
        let out = w
            .process_event(&ErrorEvent::new("api", "validation", "bad input"))
            .await
            .unwrap();
        assert!(out.is_none());
        assert!(store.is_empty());
        assert_eq!(w.stats().events_dropped, 0);
    }

    #[tokio::test]
    async fn test_long_message_truncated() {
        let store = Arc::new(MemoryStore::new());
        let w = worker(store);
        let event = ErrorEvent::new("audio", "audio-processing", "x".repeat(800));
        let n = w.process_event(&event).await.unwrap().unwrap();
        assert_eq!(n.message.chars().count(), MAX_MESSAGE_LEN);
        assert!(n.message.ends_with("..."));
    }

    #[tokio::test]
    async fn test_batch_groups_by_key() {
        let store = Arc::new(MemoryStore::new());
        let w = worker(store.clone());
        let events = vec![
            ErrorEvent::new("rtsp", "rtsp-connection", "refused"),
            ErrorEvent::new("rtsp", "rtsp-connection", "refused"),
            ErrorEvent::new("rtsp", "rtsp-connection", "reset by peer"),
            ErrorEvent::new("mqtt", "rtsp-connection", "refused"),
        ];

        let created = w.process_batch(&events).await.unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(store.len(), 2);

        let grouped = created.iter().find(|n| n.component == "rtsp").unwrap();
        assert_eq!(grouped.title, "rtsp Issue (3 occurrences)");
        assert_eq!(grouped.metadata["error_count"], 3);
        assert!(grouped.message.starts_with("Multiple rtsp-connection errors in rtsp:"));
        assert_eq!(grouped.message.matches("• ").count(), 2);
        assert!(grouped.metadata.contains_key("first_occurrence"));
        assert_eq!(w.stats().events_processed, 4);
    }

    #[tokio::test]
    async fn test_batch_summary_is_capped() {
        let store = Arc::new(MemoryStore::new());
        let w = worker(store);
        let events: Vec<_> = (0..8)
            .map(|i| ErrorEvent::new("disk", "disk-cleanup", format!("failure {i}")))
            .collect();
        let created = w.process_batch(&events).await.unwrap();
        assert_eq!(created.len(), 1);
        let message = &created[0].message;
        assert_eq!(message.matches("• ").count(), MAX_SUMMARY_MESSAGES);
        assert!(message.ends_with("... and 3 more errors"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_open_breaker_and_drop() {
        let store = Arc::new(FailingStore::default());
        let w = worker(store.clone());
        let event = ErrorEvent::new("db", "database", "locked");

        assert!(w.process_event(&event).await.is_err());
        assert!(w.process_event(&event).await.is_err());
        assert_eq!(w.breaker().state(), CircuitState::Open);

        assert!(w.process_event(&event).await.unwrap().is_none());
        let stats = w.stats();
        assert_eq!(stats.events_failed, 2);
        assert_eq!(stats.events_dropped, 1);
        assert_eq!(*store.saves.lock(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(w.process_event(&event).await.is_err());
        assert_eq!(w.breaker().state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_store_rate_limit_is_silent_drop() {
        let store = Arc::new(FailingStore {
            rate_limited: true,
            ..Default::default()
        });
        let w = worker(store);
        let out = w
            .process_event(&ErrorEvent::new("db", "database", "locked"))
            .await
            .unwrap();
        assert!(out.is_none());
        let stats = w.stats();
        assert_eq!(stats.events_failed, 1);
        assert_eq!(stats.events_dropped, 1);
        assert_eq!(w.breaker().failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_batches_until_timeout() {
        let store = Arc::new(MemoryStore::new());
        let w = Arc::new(ErrorEventWorker::new(
            store.clone(),
            WorkerConfig {
                batching_enabled: true,
                batch_size: 10,
                batch_timeout_ms: 100,
                ..Default::default()
            },
        ));
        let (tx, rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let handle = tokio::spawn(w.clone().run(rx, token.clone()));

        for _ in 0..3 {
            tx.send(ErrorEvent::new("rtsp", "rtsp-connection", "refused"))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(store.len(), 1);
        assert_eq!(w.stats().events_processed, 3);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_recovers_from_panic() {
        struct PanickingStore;

        #[async_trait]
        impl NotificationStore for PanickingStore {
            async fn save(&self, n: &Notification) -> Result<()> {
                if n.component == "boom" {
                    panic!("store exploded");
                }
                Ok(())
            }

            async fn update(&self, _: &Notification) -> Result<()> {
                Ok(())
            }
        }

        let w = Arc::new(ErrorEventWorker::new(
            Arc::new(PanickingStore),
            WorkerConfig::default(),
        ));
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(w.clone().run(rx, CancellationToken::new()));

        tx.send(ErrorEvent::new("boom", "database", "x")).await.unwrap();
        tx.send(ErrorEvent::new("ok", "database", "y")).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let stats = w.stats();
        assert_eq!(stats.events_dropped, 1);
        assert_eq!(stats.events_processed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_in_half_open_does_not_wedge_breaker() {
        struct FlakyStore;

        #[async_trait]
        impl NotificationStore for FlakyStore {
            async fn save(&self, n: &Notification) -> Result<()> {
                match n.component.as_str() {
                    "boom" => panic!("store exploded"),
                    "down" => Err(Error::store("disk full")),
                    _ => Ok(()),
                }
            }

            async fn update(&self, _: &Notification) -> Result<()> {
                Ok(())
            }
        }

        let w = ErrorEventWorker::new(
            Arc::new(FlakyStore),
            WorkerConfig {
                failure_threshold: 1,
                recovery_timeout_secs: 30,
                half_open_max_events: 1,
                ..Default::default()
            },
        );
        assert!(w.process_event(&ErrorEvent::new("down", "database", "x")).await.is_err());
        assert_eq!(w.breaker().state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        w.flush(vec![ErrorEvent::new("boom", "database", "y")]).await;
        assert_eq!(w.breaker().state(), CircuitState::HalfOpen);
        assert_eq!(w.stats().events_dropped, 1);

        let created = w
            .process_event(&ErrorEvent::new("ok", "database", "z"))
            .await
            .unwrap();
        assert!(created.is_some());
        assert_eq!(w.breaker().state(), CircuitState::Closed);
    }
}
