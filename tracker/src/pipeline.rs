use crate::broadcast::Broadcaster;
use crate::errors::{Error, Result};
use crate::metrics::{INGEST_LATENCY_SECONDS, INGEST_REJECTED_TOTAL, INGEST_TOTAL};
use crate::model::{TelemetryRecord, TelemetryReport};
use crate::store::{DeviceStore, TelemetryStore};
use crate::validate::prepare;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

const DEVICE_LOCK_SHARDS: usize = 64;

/// Validate → persist → broadcast for one report.
///
/// Append and publish for one device run under that device's lock, so
/// subscribers see a device's records in the order their ids were assigned.
#[derive(Clone)]
pub struct IngestPipeline {
    telemetry: Arc<dyn TelemetryStore>,
    devices: Arc<dyn DeviceStore>,
    broadcaster: Broadcaster,
    device_locks: Arc<[Mutex<()>]>,
}

impl IngestPipeline {
    pub fn new(
        telemetry: Arc<dyn TelemetryStore>,
        devices: Arc<dyn DeviceStore>,
        broadcaster: Broadcaster,
    ) -> Self {
        let device_locks: Vec<Mutex<()>> =
            (0..DEVICE_LOCK_SHARDS).map(|_| Mutex::new(())).collect();
        Self {
            telemetry,
            devices,
            broadcaster,
            device_locks: device_locks.into(),
        }
    }

    fn device_lock(&self, device_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        &self.device_locks[(hasher.finish() % self.device_locks.len() as u64) as usize]
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Ingests one report for `device_id`.
    ///
    /// Success means the record was persisted. Subscriber delivery
    /// problems and the `last_seen` update never fail the call.
    pub async fn ingest(&self, device_id: &str, report: TelemetryReport) -> Result<TelemetryRecord> {
        let start = Instant::now();

        let record = match prepare(device_id, report) {
            Ok(record) => record,
            Err(e) => {
                debug!(device_id, "Rejected report: {}", e);
                INGEST_REJECTED_TOTAL.inc();
                return Err(e);
            }
        };

        let sequence = self.device_lock(&record.device_id).lock().await;

        let id = self.telemetry.append(&record).await.map_err(|e| {
            error!(device_id, "Failed to persist telemetry: {}", e);
            e
        })?;
        let record = record.persisted(id);
        INGEST_TOTAL.inc();

        match self.broadcaster.publish(&record).await {
            Ok(report) if !report.evicted().is_empty() => {
                debug!(
                    record = id,
                    evicted = report.evicted().len(),
                    "Broadcast evicted subscribers"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(record = id, "Broadcast skipped: {}", e),
        }
        drop(sequence);

        if let Err(e) = self.devices.touch(&record.device_id).await {
            warn!(device_id, "Failed to update last_seen: {}", e);
        }

        INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        Ok(record)
    }
}

/// Whether a failed ingestion may succeed when retried as-is.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        // Retryable errors
        Error::Database(_) | Error::Storage(_) => true,

        // Non-retryable errors
        Error::Validation(_) => false, // Bad data won't become valid with retry
        Error::Unauthorized => false,
        Error::Migration(_) => false,
        Error::Mqtt(_) => false, // MQTT errors handled at connection level
        Error::Json(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::{DeviceIdentity, DeviceRegistration, NewTelemetry, RegisteredDevice};
    use crate::registry::{Subscriber, SubscriberId, SubscriberRegistry};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Unavailable;

    #[async_trait]
    impl TelemetryStore for Unavailable {
        async fn append(&self, _record: &NewTelemetry) -> Result<i64> {
            Err(Error::Storage("connection refused".to_string()))
        }

        async fn route(&self, _device_id: &str, _limit: i64) -> Result<Vec<TelemetryRecord>> {
            Err(Error::Storage("connection refused".to_string()))
        }

        async fn recent(&self, _limit: i64) -> Result<Vec<TelemetryRecord>> {
            Err(Error::Storage("connection refused".to_string()))
        }
    }

    #[async_trait]
    impl DeviceStore for Unavailable {
        async fn find_by_api_key(&self, _api_key: &str) -> Result<Option<DeviceIdentity>> {
            Err(Error::Storage("connection refused".to_string()))
        }

        async fn touch(&self, _device_id: &str) -> Result<()> {
            Err(Error::Storage("connection refused".to_string()))
        }

        async fn register(
            &self,
            _device_id: &str,
            _registration: &DeviceRegistration,
            _api_key: &str,
        ) -> Result<RegisteredDevice> {
            Err(Error::Storage("connection refused".to_string()))
        }
    }

    struct Fixture {
        pipeline: IngestPipeline,
        _subscriber: Arc<Subscriber>,
        rx: mpsc::Receiver<Arc<str>>,
    }

    async fn fixture(
        telemetry: Arc<dyn TelemetryStore>,
        devices: Arc<dyn DeviceStore>,
    ) -> Fixture {
        let registry = Arc::new(SubscriberRegistry::new());
        let (tx, rx) = mpsc::channel(16);
        let subscriber = Arc::new(Subscriber::new(SubscriberId::new(1), tx));
        subscriber.mark_open();
        registry.add(&subscriber).await;

        let broadcaster = Broadcaster::new(registry, Duration::from_millis(200));
        Fixture {
            pipeline: IngestPipeline::new(telemetry, devices, broadcaster),
            _subscriber: subscriber,
            rx,
        }
    }

    fn report(lat: f64, lon: f64) -> TelemetryReport {
        TelemetryReport {
            latitude: lat,
            longitude: lon,
            speed: Some(12.3),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ingest_persists_then_broadcasts() {
        let store = Arc::new(MemoryStore::new());
        let mut f = fixture(store.clone(), store.clone()).await;

        let record = f.pipeline.ingest("d1", report(37.7, -122.4)).await.unwrap();
        assert_eq!(store.telemetry_count().await, 1);

        let message: serde_json::Value =
            serde_json::from_str(&f.rx.recv().await.unwrap()).unwrap();
        assert_eq!(message["type"], "telemetry");
        assert_eq!(message["id"], record.id);
        assert_eq!(message["device_id"], "d1");
        assert_eq!(message["lat"], 37.7);
        assert_eq!(message["lon"], -122.4);
        assert_eq!(message["speed_kmh"], 12.3);
        assert!(message["ts"].is_string());
    }

    #[tokio::test]
    async fn test_invalid_report_is_neither_stored_nor_broadcast() {
        let store = Arc::new(MemoryStore::new());
        let mut f = fixture(store.clone(), store.clone()).await;

        let lat = f.pipeline.ingest("d1", report(91.0, 0.0)).await;
        let lon = f.pipeline.ingest("d1", report(0.0, 200.0)).await;

        assert!(matches!(lat, Err(Error::Validation(_))));
        assert!(matches!(lon, Err(Error::Validation(_))));
        assert_eq!(store.telemetry_count().await, 0);
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_storage_failure_does_not_broadcast() {
        let store = Arc::new(MemoryStore::new());
        let mut f = fixture(Arc::new(Unavailable), store).await;

        let result = f.pipeline.ingest("d1", report(1.0, 1.0)).await;
        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_last_seen_failure_does_not_fail_ingest() {
        let store = Arc::new(MemoryStore::new());
        let mut f = fixture(store.clone(), Arc::new(Unavailable)).await;

        assert!(f.pipeline.ingest("d1", report(1.0, 1.0)).await.is_ok());
        assert!(f.rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_ingest_marks_device_seen() {
        let store = Arc::new(MemoryStore::new());
        store
            .register(
                "d1",
                &DeviceRegistration {
                    owner_id: "u1".to_string(),
                    device_id: None,
                    label: None,
                },
                "key",
            )
            .await
            .unwrap();
        let before = store.device("d1").await.unwrap().last_seen;
        let f = fixture(store.clone(), store.clone()).await;

        f.pipeline.ingest("d1", report(1.0, 1.0)).await.unwrap();
        assert!(store.device("d1").await.unwrap().last_seen >= before);
    }

    #[tokio::test]
    async fn test_dead_subscriber_does_not_fail_ingest() {
        let store = Arc::new(MemoryStore::new());
        let f = fixture(store.clone(), store.clone()).await;
        drop(f.rx);

        assert!(f.pipeline.ingest("d1", report(1.0, 1.0)).await.is_ok());
        assert!(f._subscriber.eviction_requested());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable_error(&Error::Storage("down".to_string())));
        assert!(!is_retryable_error(&Error::Validation("test".to_string())));
        assert!(!is_retryable_error(&Error::Unauthorized));
    }
}
