use crate::errors::{Error, Result};
use crate::metrics::INGEST_REJECTED_TOTAL;
use crate::model::DeviceIdentity;
use crate::store::DeviceStore;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tracing::debug;

const API_KEY_LEN: usize = 43;
const API_KEY_MAX_LEN: usize = 256;

/// Resolves device credentials to identities.
#[derive(Clone)]
pub struct DeviceGate {
    devices: Arc<dyn DeviceStore>,
}

impl DeviceGate {
    pub fn new(devices: Arc<dyn DeviceStore>) -> Self {
        Self { devices }
    }

    /// Every rejection is the same `Error::Unauthorized`, whether the
    /// credential was missing, malformed or unknown. All three cost one
    /// store lookup. Lookup I/O failures surface as storage errors.
    pub async fn authorize(&self, credential: Option<&str>) -> Result<DeviceIdentity> {
        let candidate = credential.filter(|c| is_well_formed(c));
        // the empty key is never issued, so this lookup cannot match
        let found = self
            .devices
            .find_by_api_key(candidate.unwrap_or(""))
            .await?;

        match (candidate, found) {
            (Some(_), Some(identity)) => {
                debug!(device_id = %identity.device_id, "Credential accepted");
                Ok(identity)
            }
            _ => {
                debug!("Rejected credential");
                INGEST_REJECTED_TOTAL.inc();
                Err(Error::Unauthorized)
            }
        }
    }
}

fn is_well_formed(credential: &str) -> bool {
    !credential.is_empty()
        && credential.len() <= API_KEY_MAX_LEN
        && credential.bytes().all(|b| b.is_ascii_graphic())
}

/// Generates a URL-safe credential for a new device.
pub fn generate_api_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LEN)
        .map(char::from)
        .collect()
}

/// Extracts the credential from `X-API-Key` or `Authorization: Bearer`.
pub fn credential_from_headers(headers: &axum::http::HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim());
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}
