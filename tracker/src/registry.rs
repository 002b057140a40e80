//! Live subscriber set.
//!
//! The registry never owns a subscriber: it keeps `Weak` handles, while the
//! connection task that accepted the viewer holds the only strong `Arc`.
//! Dropping that task therefore drops the subscriber even if an explicit
//! [`SubscriberRegistry::remove`] was never reached.
//!
//! ## Rules
//! - `add`, `remove` and `snapshot` are linearizable (single `RwLock`)
//! - `remove` is idempotent
//! - a snapshot is a point-in-time copy; later mutations never show up in it

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Notify, RwLock};

/// Serialized wire message shared by every subscriber of one publish.
pub type Outbound = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Per-connection lifecycle: `Connecting → Open → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Handle to one live viewer: its outbound queue plus liveness state.
pub struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Outbound>,
    state: AtomicU8,
    eviction_requested: AtomicBool,
    eviction: Notify,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("eviction_requested", &self.eviction_requested())
            .finish()
    }
}

impl Subscriber {
    pub fn new(id: SubscriberId, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            tx,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            eviction_requested: AtomicBool::new(false),
            eviction: Notify::new(),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Open and not scheduled for eviction.
    pub fn accepts_deliveries(&self) -> bool {
        self.state() == ConnectionState::Open && !self.eviction_requested()
    }

    pub fn eviction_requested(&self) -> bool {
        self.eviction_requested.load(Ordering::Acquire)
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<Outbound> {
        &self.tx
    }

    /// Asks the owning connection task to close. Safe to call any number
    /// of times from any task; only the first call wakes the owner.
    pub fn request_eviction(&self) {
        if !self.eviction_requested.swap(true, Ordering::AcqRel) {
            // notify_one stores a permit when the owner is not waiting yet
            self.eviction.notify_one();
        }
    }

    /// Resolves once eviction has been requested.
    pub async fn evicted(&self) {
        if self.eviction_requested() {
            return;
        }
        self.eviction.notified().await;
    }

    pub(crate) fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves to `Closing`. Returns `true` only for the caller that made the
    /// transition, so concurrent failure signals close the connection once.
    pub(crate) fn begin_closing(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match ConnectionState::from_u8(current) {
                ConnectionState::Closing | ConnectionState::Closed => return false,
                ConnectionState::Connecting | ConnectionState::Open => {}
            }
            match self.state.compare_exchange_weak(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

/// Concurrency-safe set of live subscribers.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    live: RwLock<BTreeMap<SubscriberId, Weak<Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, subscriber: &Arc<Subscriber>) {
        let mut live = self.live.write().await;
        live.insert(subscriber.id(), Arc::downgrade(subscriber));
        tracing::debug!(subscriber = %subscriber.id(), total = live.len(), "Subscriber registered");
    }

    /// Returns whether the subscriber was present.
    pub async fn remove(&self, id: SubscriberId) -> bool {
        let mut live = self.live.write().await;
        let removed = live.remove(&id).is_some();
        // prune handles whose connection task is already gone
        live.retain(|_, weak| weak.strong_count() > 0);
        if removed {
            tracing::debug!(subscriber = %id, total = live.len(), "Subscriber deregistered");
        }
        removed
    }

    /// Removal for drop paths that cannot await. A busy lock leaves a dead
    /// `Weak` behind for the next `remove` to prune.
    pub fn try_remove(&self, id: SubscriberId) -> bool {
        match self.live.try_write() {
            Ok(mut live) => live.remove(&id).is_some(),
            Err(_) => false,
        }
    }

    /// Point-in-time copy ordered by subscriber id.
    pub async fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.live
            .read()
            .await
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub async fn get(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        self.live.read().await.get(&id).and_then(Weak::upgrade)
    }

    pub async fn contains(&self, id: SubscriberId) -> bool {
        self.get(id).await.is_some()
    }

    pub async fn len(&self) -> usize {
        self.live
            .read()
            .await
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
