use crate::auth::{generate_api_key, DeviceGate};
use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionSettings};
use crate::errors::{Error, Result};
use crate::model::{
    DeviceIdentity, DeviceRegistration, RegisteredDevice, TelemetryRecord, TelemetryReport,
};
use crate::pipeline::IngestPipeline;
use crate::registry::{SubscriberId, SubscriberRegistry};
use crate::store::{DeviceStore, TelemetryStore};
use crate::validate::validate_device_id;
use std::sync::Arc;
use tracing::info;

/// One ingestion-and-broadcast hub: a subscriber registry and every
/// component wired to it. Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Hub {
    registry: Arc<SubscriberRegistry>,
    pipeline: IngestPipeline,
    gate: DeviceGate,
    connections: Arc<ConnectionManager>,
    telemetry: Arc<dyn TelemetryStore>,
    devices: Arc<dyn DeviceStore>,
    allow_unauthenticated_ingest: bool,
    route_limit_max: i64,
}

impl Hub {
    pub fn new(
        config: &Config,
        telemetry: Arc<dyn TelemetryStore>,
        devices: Arc<dyn DeviceStore>,
    ) -> Self {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), config.delivery_timeout);
        let pipeline = IngestPipeline::new(
            Arc::clone(&telemetry),
            Arc::clone(&devices),
            broadcaster,
        );
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&registry),
            ConnectionSettings {
                queue_capacity: config.subscriber_queue,
                write_timeout: config.delivery_timeout,
                keepalive_interval: config.keepalive_interval,
            },
        ));

        Self {
            registry,
            pipeline,
            gate: DeviceGate::new(Arc::clone(&devices)),
            connections,
            telemetry,
            devices,
            allow_unauthenticated_ingest: config.allow_unauthenticated_ingest,
            route_limit_max: config.route_limit_max,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    pub fn allows_unauthenticated_ingest(&self) -> bool {
        self.allow_unauthenticated_ingest
    }

    /// Self-declared path: the report names its own device.
    ///
    /// When unauthenticated ingestion is disabled, a credential is required
    /// and must belong to the declared device.
    pub async fn ingest_declared(
        &self,
        credential: Option<&str>,
        report: TelemetryReport,
    ) -> Result<TelemetryRecord> {
        let declared = report.device_id.clone().unwrap_or_default();

        if !self.allow_unauthenticated_ingest {
            let identity = self.gate.authorize(credential).await?;
            if identity.device_id != declared {
                return Err(Error::Unauthorized);
            }
        }

        self.pipeline.ingest(&declared, report).await
    }

    /// Credentialed path entry: resolves the device the credential belongs
    /// to. The report is then ingested for that device only.
    pub async fn authorize(&self, credential: Option<&str>) -> Result<DeviceIdentity> {
        self.gate.authorize(credential).await
    }

    pub async fn route(&self, device_id: &str, limit: Option<i64>) -> Result<Vec<TelemetryRecord>> {
        let limit = self.clamp_limit(limit, 500);
        self.telemetry.route(device_id, limit).await
    }

    pub async fn recent(&self, limit: Option<i64>) -> Result<Vec<TelemetryRecord>> {
        let limit = self.clamp_limit(limit, 100);
        self.telemetry.recent(limit).await
    }

    /// Registers a device, or refreshes owner/label of an existing one
    /// while keeping its credential.
    pub async fn register_device(&self, registration: DeviceRegistration) -> Result<RegisteredDevice> {
        if registration.owner_id.trim().is_empty() {
            return Err(Error::Validation("user_id cannot be empty".to_string()));
        }

        let device_id = match registration.device_id.as_deref() {
            Some(id) => {
                validate_device_id(id)?;
                id.to_string()
            }
            None => {
                let hex = uuid::Uuid::new_v4().simple().to_string();
                format!("phone_{}", &hex[..12])
            }
        };

        let registered = self
            .devices
            .register(&device_id, &registration, &generate_api_key())
            .await?;
        info!(device_id = %registered.device_id, "Device registered");
        Ok(registered)
    }

    /// Administrative disconnect of one live subscriber.
    pub async fn disconnect(&self, id: SubscriberId) -> bool {
        self.connections.disconnect(id).await
    }

    /// Non-positive limits select nothing.
    fn clamp_limit(&self, limit: Option<i64>, default: i64) -> i64 {
        limit.unwrap_or(default).clamp(0, self.route_limit_max)
    }
}
