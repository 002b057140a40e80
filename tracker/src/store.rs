//! Storage collaborators the hub depends on.
//!
//! The PostgreSQL adapter lives in [`crate::db`], the in-process one in
//! [`crate::memory`]. Both are initialized once at startup and shared
//! behind `Arc<dyn ...>`.

use crate::errors::Result;
use crate::model::{
    DeviceIdentity, DeviceRegistration, NewTelemetry, RegisteredDevice, TelemetryRecord,
};
use async_trait::async_trait;

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Appends one record and returns the id assigned to it.
    async fn append(&self, record: &NewTelemetry) -> Result<i64>;

    /// Latest `limit` records of one device, ascending by time.
    async fn route(&self, device_id: &str, limit: i64) -> Result<Vec<TelemetryRecord>>;

    /// Latest `limit` records across all devices, ascending by time.
    async fn recent(&self, limit: i64) -> Result<Vec<TelemetryRecord>>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<DeviceIdentity>>;

    /// Sets `last_seen` to now. Unknown devices are ignored.
    async fn touch(&self, device_id: &str) -> Result<()>;

    /// Creates the device or updates owner/label/last_seen of an existing
    /// one. `api_key` is only stored for new devices; an existing device
    /// keeps and returns its current credential.
    async fn register(
        &self,
        device_id: &str,
        registration: &DeviceRegistration,
        api_key: &str,
    ) -> Result<RegisteredDevice>;
}
