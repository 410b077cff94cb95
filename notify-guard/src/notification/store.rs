//! Notification store capability and an in-memory implementation.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::Notification;
use crate::{Error, Result};

/// Default number of notifications retained by [`MemoryStore`].
pub const DEFAULT_STORE_CAPACITY: usize = 1000;

/// Broadcast channel capacity for saved notifications.
const STORE_BROADCAST_CAPACITY: usize = 256;

/// Persistence for notifications.
///
/// A store may refuse a save with [`Error::RateLimited`] when it is
/// saturated; callers treat that as an expected drop.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn save(&self, notification: &Notification) -> Result<()>;

    async fn update(&self, notification: &Notification) -> Result<()>;
}

struct MemoryStoreInner {
    by_id: HashMap<String, Notification>,
    order: VecDeque<String>,
}

/// Bounded in-memory store.
///
/// Evicts the oldest notification when full and broadcasts every newly saved
/// notification so a dispatcher can subscribe to the stream.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
    capacity: usize,
    tx: broadcast::Sender<Notification>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STORE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(STORE_BROADCAST_CAPACITY);
        Self {
            inner: RwLock::new(MemoryStoreInner {
                by_id: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            tx,
        }
    }

    /// Subscribe to newly saved notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Notification> {
        self.inner.read().by_id.get(id).cloned()
    }

    /// All retained notifications, oldest first.
    pub fn list(&self) -> Vec<Notification> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn save(&self, notification: &Notification) -> Result<()> {
        {
            let mut inner = self.inner.write();
            if inner.by_id.contains_key(&notification.id) {
                return Err(Error::store(format!(
                    "notification {} already exists",
                    notification.id
                )));
            }
            while inner.by_id.len() >= self.capacity {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                inner.by_id.remove(&oldest);
                debug!(id = %oldest, "evicted oldest notification");
            }
            inner.order.push_back(notification.id.clone());
            inner
                .by_id
                .insert(notification.id.clone(), notification.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(notification.clone());
        Ok(())
    }

    async fn update(&self, notification: &Notification) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.by_id.get_mut(&notification.id) {
            Some(existing) => {
                *existing = notification.clone();
                Ok(())
            }
            None => Err(Error::store(format!(
                "notification {} not found",
                notification.id
            ))),
        }
    }
}
