use crate::errors::{Error, Result};
use crate::model::{NewTelemetry, TelemetryReport};
use chrono::Utc;

const LAT_MIN: f64 = -90.0;
const LAT_MAX: f64 = 90.0;
const LON_MIN: f64 = -180.0;
const LON_MAX: f64 = 180.0;
const HEADING_MIN: f64 = 0.0;
const HEADING_MAX: f64 = 360.0;
const DEVICE_ID_MAX_LEN: usize = 128;

/// Validates a raw report for the given device.
pub fn validate(device_id: &str, report: &TelemetryReport) -> Result<()> {
    validate_device_id(device_id)?;

    check_range("Latitude", report.latitude, LAT_MIN, LAT_MAX)?;
    check_range("Longitude", report.longitude, LON_MIN, LON_MAX)?;

    if let Some(altitude) = report.altitude {
        if !altitude.is_finite() {
            return Err(Error::Validation(format!(
                "Altitude {} is not a finite number",
                altitude
            )));
        }
    }

    if let Some(speed) = report.speed {
        check_non_negative("Speed", speed)?;
    }

    if let Some(heading) = report.heading {
        check_range("Heading", heading, HEADING_MIN, HEADING_MAX)?;
    }

    if let Some(sats) = report.satellite_count {
        if sats < 0 {
            return Err(Error::Validation(format!(
                "Satellite count {} must not be negative",
                sats
            )));
        }
    }

    if let Some(hdop) = report.horizontal_dilution {
        check_non_negative("HDOP", hdop)?;
    }

    Ok(())
}

pub fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.trim().is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }
    if device_id.len() > DEVICE_ID_MAX_LEN {
        return Err(Error::Validation(format!(
            "Device ID longer than {} bytes",
            DEVICE_ID_MAX_LEN
        )));
    }
    Ok(())
}

/// Validates the report and turns it into a storable record, stamping the
/// current UTC time when the producer sent none.
pub fn prepare(device_id: &str, report: TelemetryReport) -> Result<NewTelemetry> {
    validate(device_id, &report)?;

    Ok(NewTelemetry {
        device_id: device_id.to_string(),
        timestamp: report.timestamp.unwrap_or_else(Utc::now),
        latitude: report.latitude,
        longitude: report.longitude,
        altitude: report.altitude,
        speed: report.speed,
        heading: report.heading,
        fix_quality: report.fix_quality,
        satellite_count: report.satellite_count,
        horizontal_dilution: report.horizontal_dilution,
    })
}

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
    // NaN fails both comparisons, so test the accepted interval directly
    if !(value >= min && value <= max) {
        return Err(Error::Validation(format!(
            "{} {} out of range [{}, {}]",
            name, value, min, max
        )));
    }
    Ok(())
}

fn check_non_negative(name: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value >= 0.0) {
        return Err(Error::Validation(format!(
            "{} {} must be a non-negative number",
            name, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> TelemetryReport {
        TelemetryReport {
            device_id: Some("d1".to_string()),
            latitude: 37.7,
            longitude: -122.4,
            speed: Some(12.3),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_report() {
        assert!(validate("d1", &report()).is_ok());
    }

    #[test]
    fn test_invalid_latitude() {
        let telemetry = TelemetryReport {
            latitude: 91.0, // Out of range
            ..report()
        };

        assert!(matches!(
            validate("d1", &telemetry),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_longitude() {
        let telemetry = TelemetryReport {
            longitude: 200.0, // Out of range
            ..report()
        };

        assert!(validate("d1", &telemetry).is_err());
    }

    #[test]
    fn test_nan_coordinates_rejected() {
        let telemetry = TelemetryReport {
            latitude: f64::NAN,
            ..report()
        };

        assert!(validate("d1", &telemetry).is_err());
    }

    #[test]
    fn test_boundaries_accepted() {
        let telemetry = TelemetryReport {
            latitude: -90.0,
            longitude: 180.0,
            heading: Some(360.0),
            speed: Some(0.0),
            ..report()
        };

        assert!(validate("d1", &telemetry).is_ok());
    }

    #[test]
    fn test_negative_speed() {
        let telemetry = TelemetryReport {
            speed: Some(-1.0),
            ..report()
        };

        assert!(validate("d1", &telemetry).is_err());
    }

    #[test]
    fn test_invalid_heading() {
        let telemetry = TelemetryReport {
            heading: Some(361.0),
            ..report()
        };

        assert!(validate("d1", &telemetry).is_err());
    }

    #[test]
    fn test_negative_satellites_and_hdop() {
        let sats = TelemetryReport {
            satellite_count: Some(-3),
            ..report()
        };
        let hdop = TelemetryReport {
            horizontal_dilution: Some(-0.5),
            ..report()
        };

        assert!(validate("d1", &sats).is_err());
        assert!(validate("d1", &hdop).is_err());
    }

    #[test]
    fn test_empty_device_id() {
        assert!(validate("", &report()).is_err());
        assert!(validate("   ", &report()).is_err());
    }

    #[test]
    fn test_prepare_assigns_timestamp() {
        let before = Utc::now();
        let prepared = prepare("d1", report()).unwrap();

        assert!(prepared.timestamp >= before);
        assert_eq!(prepared.device_id, "d1");
        assert_eq!(prepared.speed, Some(12.3));
    }

    #[test]
    fn test_prepare_keeps_supplied_timestamp() {
        let ts = Utc::now() - chrono::Duration::hours(1);
        let prepared = prepare(
            "d1",
            TelemetryReport {
                timestamp: Some(ts),
                ..report()
            },
        )
        .unwrap();

        assert_eq!(prepared.timestamp, ts);
    }
}
