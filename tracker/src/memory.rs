use crate::errors::Result;
use crate::model::{
    Device, DeviceIdentity, DeviceRegistration, NewTelemetry, RegisteredDevice, TelemetryRecord,
};
use crate::store::{DeviceStore, TelemetryStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process storage for tests and local runs without PostgreSQL.
#[derive(Debug, Default)]
pub struct MemoryStore {
    telemetry: RwLock<Vec<TelemetryRecord>>,
    devices: RwLock<HashMap<String, Device>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn telemetry_count(&self) -> usize {
        self.telemetry.read().await.len()
    }

    pub async fn device(&self, device_id: &str) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }
}

/// Sorts ascending by time and keeps the newest `limit` entries.
fn tail(mut records: Vec<TelemetryRecord>, limit: i64) -> Vec<TelemetryRecord> {
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    let keep = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
    let skip = records.len().saturating_sub(keep);
    records.split_off(skip)
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn append(&self, record: &NewTelemetry) -> Result<i64> {
        let mut telemetry = self.telemetry.write().await;
        let id = telemetry.len() as i64 + 1;
        telemetry.push(record.clone().persisted(id));
        Ok(id)
    }

    async fn route(&self, device_id: &str, limit: i64) -> Result<Vec<TelemetryRecord>> {
        let records = self
            .telemetry
            .read()
            .await
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect();
        Ok(tail(records, limit))
    }

    async fn recent(&self, limit: i64) -> Result<Vec<TelemetryRecord>> {
        let records = self.telemetry.read().await.clone();
        Ok(tail(records, limit))
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<DeviceIdentity>> {
        Ok(self
            .devices
            .read()
            .await
            .values()
            .find(|d| d.api_key == api_key)
            .map(|d| DeviceIdentity {
                device_id: d.device_id.clone(),
                owner_id: d.owner_id.clone(),
            }))
    }

    async fn touch(&self, device_id: &str) -> Result<()> {
        if let Some(device) = self.devices.write().await.get_mut(device_id) {
            device.last_seen = Some(Utc::now());
        }
        Ok(())
    }

    async fn register(
        &self,
        device_id: &str,
        registration: &DeviceRegistration,
        api_key: &str,
    ) -> Result<RegisteredDevice> {
        let mut devices = self.devices.write().await;
        let now = Utc::now();
        let device = devices
            .entry(device_id.to_string())
            .and_modify(|d| {
                d.owner_id = registration.owner_id.clone();
                d.label = registration.label.clone();
                d.last_seen = Some(now);
            })
            .or_insert_with(|| Device {
                device_id: device_id.to_string(),
                owner_id: registration.owner_id.clone(),
                api_key: api_key.to_string(),
                label: registration.label.clone(),
                last_seen: Some(now),
                created_at: now,
            });

        Ok(RegisteredDevice {
            device_id: device.device_id.clone(),
            api_key: device.api_key.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn point(device_id: &str, minutes_ago: i64) -> NewTelemetry {
        NewTelemetry {
            device_id: device_id.to_string(),
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
            latitude: 10.0,
            longitude: 20.0,
            altitude: None,
            speed: None,
            heading: None,
            fix_quality: None,
            satellite_count: None,
            horizontal_dilution: None,
        }
    }

    fn registration(label: &str) -> DeviceRegistration {
        DeviceRegistration {
            owner_id: "u1".to_string(),
            device_id: Some("d1".to_string()),
            label: Some(label.to_string()),
        }
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let a = store.append(&point("d1", 2)).await.unwrap();
        let b = store.append(&point("d1", 1)).await.unwrap();
        assert!(b > a);
        assert_eq!(store.telemetry_count().await, 2);
    }

    #[tokio::test]
    async fn test_route_is_ascending_and_limited() {
        let store = MemoryStore::new();
        for minutes_ago in [5, 1, 3, 4, 2] {
            store.append(&point("d1", minutes_ago)).await.unwrap();
        }
        store.append(&point("d2", 0)).await.unwrap();

        let route = store.route("d1", 3).await.unwrap();
        assert_eq!(route.len(), 3);
        assert!(route.iter().all(|r| r.device_id == "d1"));
        assert!(route.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        // the three most recent points survive the limit
        let oldest_kept = route[0].timestamp;
        assert!(Utc::now() - oldest_kept < Duration::minutes(4));
    }

    #[tokio::test]
    async fn test_reregister_keeps_key_and_updates_label() {
        let store = MemoryStore::new();
        let first = store
            .register("d1", &registration("truck"), "key-one")
            .await
            .unwrap();
        let second = store
            .register("d1", &registration("van"), "key-two")
            .await
            .unwrap();

        assert_eq!(first.api_key, "key-one");
        assert_eq!(second, first);
        let device = store.device("d1").await.unwrap();
        assert_eq!(device.label.as_deref(), Some("van"));
    }

    #[tokio::test]
    async fn test_lookup_and_touch() {
        let store = MemoryStore::new();
        store
            .register("d1", &registration("truck"), "key-one")
            .await
            .unwrap();

        let identity = store.find_by_api_key("key-one").await.unwrap().unwrap();
        assert_eq!(identity.device_id, "d1");
        assert_eq!(identity.owner_id, "u1");
        assert!(store.find_by_api_key("nope").await.unwrap().is_none());

        let before = store.device("d1").await.unwrap().last_seen;
        store.touch("d1").await.unwrap();
        store.touch("missing").await.unwrap();
        assert!(store.device("d1").await.unwrap().last_seen >= before);
    }
}
