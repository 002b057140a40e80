//! Fan-out of persisted telemetry to live subscribers.
//!
//! ## Architecture
//! ```text
//! publish(record)
//!     │  serialize once
//!     │  snapshot registry
//!     ├──► deliver ──► [queue 1] ──► connection 1
//!     ├──► deliver ──► [queue 2] ──► connection 2
//!     └──► deliver ──► [queue N] ──► connection N
//!          (concurrent, each bounded by the delivery timeout)
//! ```
//!
//! ## Rules
//! - **Isolation**: a failed or stalled subscriber only affects itself
//! - **Drop and evict**: a full queue that does not drain in time evicts the
//!   subscriber instead of blocking ingestion
//! - **Per-subscriber FIFO**: queues preserve publish order
//! - `publish` returns once every snapshot member was attempted

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::metrics::{
    DELIVERIES_TOTAL, DELIVERY_FAILURES_TOTAL, DELIVERY_TIMEOUTS_TOTAL, PUBLISH_LATENCY_SECONDS,
};
use crate::model::{LiveMessage, TelemetryRecord};
use crate::registry::{Outbound, Subscriber, SubscriberId, SubscriberRegistry};

/// Why a single delivery did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Subscriber is closing or already scheduled for eviction.
    Closing,
    /// The connection task dropped its queue.
    Disconnected,
}

/// Outcome of delivering one message to one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    TimedOut,
    Failed(DeliveryFailure),
}

impl Delivery {
    pub fn is_delivered(self) -> bool {
        matches!(self, Delivery::Delivered)
    }
}

/// Per-subscriber outcomes of one `publish`.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub outcomes: Vec<(SubscriberId, Delivery)>,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|(_, d)| d.is_delivered()).count()
    }

    pub fn timed_out(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, d)| *d == Delivery::TimedOut)
            .count()
    }

    /// Subscribers scheduled for eviction by this publish.
    pub fn evicted(&self) -> Vec<SubscriberId> {
        self.outcomes
            .iter()
            .filter(|(_, d)| !d.is_delivered())
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Broadcast engine over one registry.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<SubscriberRegistry>,
    delivery_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<SubscriberRegistry>, delivery_timeout: Duration) -> Self {
        Self {
            registry,
            delivery_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn delivery_timeout(&self) -> Duration {
        self.delivery_timeout
    }

    /// Delivers one persisted record to every current subscriber.
    ///
    /// Only serialization can fail; per-subscriber problems end up in the
    /// returned report and schedule that subscriber for eviction.
    pub async fn publish(&self, record: &TelemetryRecord) -> Result<DeliveryReport> {
        let start = Instant::now();
        let message: Outbound = Arc::from(LiveMessage::Telemetry(record).to_json()?);
        let snapshot = self.registry.snapshot().await;

        let attempts = snapshot
            .iter()
            .map(|subscriber| deliver(subscriber, Arc::clone(&message), self.delivery_timeout));
        let results = join_all(attempts).await;

        let mut report = DeliveryReport {
            outcomes: Vec::with_capacity(snapshot.len()),
        };
        for (subscriber, delivery) in snapshot.iter().zip(results) {
            match delivery {
                Delivery::Delivered => DELIVERIES_TOTAL.inc(),
                Delivery::TimedOut => {
                    warn!(
                        subscriber = %subscriber.id(),
                        record = record.id,
                        timeout_ms = self.delivery_timeout.as_millis() as u64,
                        "Subscriber did not drain in time, evicting"
                    );
                    DELIVERY_TIMEOUTS_TOTAL.inc();
                    subscriber.request_eviction();
                }
                Delivery::Failed(reason) => {
                    debug!(
                        subscriber = %subscriber.id(),
                        record = record.id,
                        ?reason,
                        "Delivery failed, evicting"
                    );
                    DELIVERY_FAILURES_TOTAL.inc();
                    subscriber.request_eviction();
                }
            }
            report.outcomes.push((subscriber.id(), delivery));
        }

        PUBLISH_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        debug!(
            record = record.id,
            device_id = %record.device_id,
            attempted = report.attempted(),
            delivered = report.delivered(),
            "Published telemetry"
        );
        Ok(report)
    }
}

/// Queues `message` for one subscriber, waiting at most `timeout` for
/// queue capacity.
pub async fn deliver(subscriber: &Subscriber, message: Outbound, timeout: Duration) -> Delivery {
    if !subscriber.accepts_deliveries() {
        return Delivery::Failed(DeliveryFailure::Closing);
    }

    match tokio::time::timeout(timeout, subscriber.sender().send(message)).await {
        Ok(Ok(())) => Delivery::Delivered,
        Ok(Err(_)) => Delivery::Failed(DeliveryFailure::Disconnected),
        Err(_) => Delivery::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewTelemetry;
    use crate::registry::ConnectionState;
    use chrono::Utc;
    use tokio::sync::mpsc;

    fn record(id: i64) -> TelemetryRecord {
        NewTelemetry {
            device_id: "d1".to_string(),
            timestamp: Utc::now(),
            latitude: 37.7,
            longitude: -122.4,
            altitude: None,
            speed: Some(12.3),
            heading: None,
            fix_quality: None,
            satellite_count: None,
            horizontal_dilution: None,
        }
        .persisted(id)
    }

    async fn open_subscriber(
        registry: &SubscriberRegistry,
        id: u64,
        capacity: usize,
    ) -> (Arc<Subscriber>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let subscriber = Arc::new(Subscriber::new(SubscriberId::new(id), tx));
        subscriber.mark_open();
        registry.add(&subscriber).await;
        (subscriber, rx)
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), Duration::from_millis(200));
        let (_a, mut ra) = open_subscriber(&registry, 1, 4).await;
        let (_b, mut rb) = open_subscriber(&registry, 2, 4).await;

        let report = broadcaster.publish(&record(7)).await.unwrap();
        assert_eq!(report.attempted(), 2);
        assert_eq!(report.delivered(), 2);

        for rx in [&mut ra, &mut rb] {
            let message = rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&message).unwrap();
            assert_eq!(value["type"], "telemetry");
            assert_eq!(value["id"], 7);
            assert_eq!(value["speed_kmh"], 12.3);
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(registry, Duration::from_millis(200));

        let report = broadcaster.publish(&record(1)).await.unwrap();
        assert_eq!(report.attempted(), 0);
    }

    #[tokio::test]
    async fn test_stalled_subscriber_is_evicted_without_blocking_others() {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), Duration::from_millis(100));
        // capacity 1 and never drained: the second publish stalls on it
        let (stalled, _stalled_rx) = open_subscriber(&registry, 1, 1).await;
        let (_healthy, mut healthy_rx) = open_subscriber(&registry, 2, 16).await;

        broadcaster.publish(&record(1)).await.unwrap();
        let start = std::time::Instant::now();
        let report = broadcaster.publish(&record(2)).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(report.timed_out(), 1);
        assert_eq!(report.evicted(), vec![stalled.id()]);
        assert!(stalled.eviction_requested());

        assert!(healthy_rx.recv().await.unwrap().contains("\"id\":1"));
        assert!(healthy_rx.recv().await.unwrap().contains("\"id\":2"));

        // a later publish does not wait on the evicted subscriber again
        let start = std::time::Instant::now();
        let report = broadcaster.publish(&record(3)).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(report.delivered(), 1);
    }

    #[tokio::test]
    async fn test_slow_subscribers_time_out_concurrently() {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), Duration::from_millis(200));
        let mut keep = Vec::new();
        for id in 0..10 {
            let (s, rx) = open_subscriber(&registry, id, 1).await;
            keep.push((s, rx));
        }

        broadcaster.publish(&record(1)).await.unwrap();
        let start = std::time::Instant::now();
        let report = broadcaster.publish(&record(2)).await.unwrap();

        // ten sequential timeouts would take two seconds
        assert!(start.elapsed() < Duration::from_millis(1500));
        assert_eq!(report.timed_out(), 10);
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_fails_cleanly() {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), Duration::from_millis(200));
        let (gone, gone_rx) = open_subscriber(&registry, 1, 4).await;
        drop(gone_rx);

        let report = broadcaster.publish(&record(1)).await.unwrap();
        assert_eq!(
            report.outcomes,
            vec![(gone.id(), Delivery::Failed(DeliveryFailure::Disconnected))]
        );
        assert!(gone.eviction_requested());
    }

    #[tokio::test]
    async fn test_closing_subscriber_gets_nothing() {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), Duration::from_millis(200));
        let (closing, mut rx) = open_subscriber(&registry, 1, 4).await;
        assert!(closing.begin_closing());
        assert_eq!(closing.state(), ConnectionState::Closing);

        let report = broadcaster.publish(&record(1)).await.unwrap();
        assert_eq!(
            report.outcomes,
            vec![(closing.id(), Delivery::Failed(DeliveryFailure::Closing))]
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_order_is_preserved_per_subscriber() {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), Duration::from_millis(200));
        let (_s, mut rx) = open_subscriber(&registry, 1, 64).await;

        for id in 1..=20 {
            broadcaster.publish(&record(id)).await.unwrap();
        }

        for id in 1..=20 {
            let value: serde_json::Value =
                serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(value["id"], id);
        }
        assert!(rx.try_recv().is_err());
    }
}
