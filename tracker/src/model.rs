use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position report as submitted by a producer, before validation.
///
/// `device_id` is required on the self-declared path and ignored on the
/// credentialed path, where the credential decides the device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryReport {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(rename = "ts", default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lon")]
    pub longitude: f64,
    #[serde(rename = "alt", default)]
    pub altitude: Option<f64>,
    #[serde(rename = "speed_kmh", default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(rename = "fix", default)]
    pub fix_quality: Option<String>,
    #[serde(rename = "sats", default)]
    pub satellite_count: Option<i32>,
    #[serde(rename = "hdop", default)]
    pub horizontal_dilution: Option<f64>,
}

/// Validated report that has not been persisted yet. It has no id and
/// therefore cannot be broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTelemetry {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub fix_quality: Option<String>,
    pub satellite_count: Option<i32>,
    pub horizontal_dilution: Option<f64>,
}

impl NewTelemetry {
    /// Attaches the id assigned by the storage collaborator.
    pub fn persisted(self, id: i64) -> TelemetryRecord {
        TelemetryRecord {
            id,
            device_id: self.device_id,
            timestamp: self.timestamp,
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            speed: self.speed,
            heading: self.heading,
            fix_quality: self.fix_quality,
            satellite_count: self.satellite_count,
            horizontal_dilution: self.horizontal_dilution,
        }
    }
}

/// Durably persisted position report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TelemetryRecord {
    pub id: i64,
    pub device_id: String,
    #[serde(rename = "ts")]
    #[sqlx(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "lat")]
    #[sqlx(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lon")]
    #[sqlx(rename = "lon")]
    pub longitude: f64,
    #[serde(rename = "alt", default, skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "alt")]
    pub altitude: Option<f64>,
    #[serde(rename = "speed_kmh", default, skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "speed_kmh")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(rename = "fix", default, skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "fix")]
    pub fix_quality: Option<String>,
    #[serde(rename = "sats", default, skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "sats")]
    pub satellite_count: Option<i32>,
    #[serde(rename = "hdop", default, skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "hdop")]
    pub horizontal_dilution: Option<f64>,
}

/// Messages written to live subscribers.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LiveMessage<'a> {
    Telemetry(&'a TelemetryRecord),
    Pong { payload: &'a str },
}

impl LiveMessage<'_> {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Registered device. `Debug` redacts the credential.
#[derive(Clone, Serialize, sqlx::FromRow)]
pub struct Device {
    pub device_id: String,
    #[serde(rename = "user_id")]
    #[sqlx(rename = "user_id")]
    pub owner_id: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub label: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.device_id)
            .field("owner_id", &self.owner_id)
            .field("api_key", &"<redacted>")
            .field("label", &self.label)
            .field("last_seen", &self.last_seen)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Result of resolving a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub owner_id: String,
}

/// Registration request body.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRegistration {
    #[serde(rename = "user_id")]
    pub owner_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredDevice {
    pub device_id: String,
    pub api_key: String,
}

impl fmt::Debug for RegisteredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredDevice")
            .field("device_id", &self.device_id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub status: String,
    pub id: i64,
}

impl IngestResponse {
    pub fn ok(id: i64) -> Self {
        Self {
            status: "ok".to_string(),
            id,
        }
    }
}

/// GeoJSON `FeatureCollection` of point features.
#[derive(Debug, Serialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub features: Vec<Feature>,
}

#[derive(Debug, Serialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub properties: FeatureProperties,
    pub geometry: PointGeometry,
}

#[derive(Debug, Serialize)]
pub struct FeatureProperties {
    pub id: i64,
    pub device_id: String,
    pub ts: DateTime<Utc>,
    pub speed_kmh: Option<f64>,
    pub heading: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct PointGeometry {
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// `[longitude, latitude]`
    pub coordinates: [f64; 2],
}

impl From<&TelemetryRecord> for Feature {
    fn from(record: &TelemetryRecord) -> Self {
        Self {
            kind: "Feature",
            properties: FeatureProperties {
                id: record.id,
                device_id: record.device_id.clone(),
                ts: record.timestamp,
                speed_kmh: record.speed,
                heading: record.heading,
            },
            geometry: PointGeometry {
                kind: "Point",
                coordinates: [record.longitude, record.latitude],
            },
        }
    }
}

impl FeatureCollection {
    /// Records must already be in the order the features should appear.
    pub fn from_records(records: &[TelemetryRecord]) -> Self {
        Self {
            kind: "FeatureCollection",
            features: records.iter().map(Feature::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> TelemetryRecord {
        NewTelemetry {
            device_id: "d1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            latitude: 37.7,
            longitude: -122.4,
            altitude: None,
            speed: Some(12.3),
            heading: None,
            fix_quality: None,
            satellite_count: Some(9),
            horizontal_dilution: None,
        }
        .persisted(42)
    }

    #[test]
    fn test_live_message_shape() {
        let record = record();
        let json = LiveMessage::Telemetry(&record).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "telemetry");
        assert_eq!(value["id"], 42);
        assert_eq!(value["device_id"], "d1");
        assert_eq!(value["lat"], 37.7);
        assert_eq!(value["lon"], -122.4);
        assert_eq!(value["speed_kmh"], 12.3);
        assert_eq!(value["sats"], 9);
        assert!(value.get("alt").is_none());
        assert!(value.get("hdop").is_none());
    }

    #[test]
    fn test_pong_shape() {
        let json = LiveMessage::Pong { payload: "hi" }.to_json().unwrap();
        assert_eq!(json, r#"{"type":"pong","payload":"hi"}"#);
    }

    #[test]
    fn test_report_accepts_missing_optionals() {
        let report: TelemetryReport =
            serde_json::from_str(r#"{"device_id":"d1","lat":1.0,"lon":2.0}"#).unwrap();
        assert_eq!(report.device_id.as_deref(), Some("d1"));
        assert!(report.timestamp.is_none());
        assert!(report.speed.is_none());
    }

    #[test]
    fn test_feature_uses_lon_lat_order() {
        let collection = FeatureCollection::from_records(&[record()]);
        let value = serde_json::to_value(&collection).unwrap();

        assert_eq!(value["type"], "FeatureCollection");
        assert_eq!(value["features"][0]["type"], "Feature");
        assert_eq!(value["features"][0]["geometry"]["type"], "Point");
        assert_eq!(
            value["features"][0]["geometry"]["coordinates"],
            serde_json::json!([-122.4, 37.7])
        );
        assert_eq!(value["features"][0]["properties"]["id"], 42);
    }

    #[test]
    fn test_device_debug_redacts_key() {
        let device = Device {
            device_id: "d1".to_string(),
            owner_id: "u1".to_string(),
            api_key: "s3cret-token".to_string(),
            label: None,
            last_seen: None,
            created_at: Utc::now(),
        };
        let debug = format!("{:?}", device);
        assert!(!debug.contains("s3cret-token"));
    }
}
