use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A GPS report as devices publish it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub device_id: String,
    pub ts: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
    pub speed_kmh: f64,
    pub heading: f64,
    pub fix: String,
    pub sats: i32,
    pub hdop: f64,
}

/// A simulated vehicle driving around a starting point.
#[derive(Debug, Clone)]
pub struct Vehicle {
    pub device_id: String,
    lat: f64,
    lon: f64,
    heading: f64,
    speed_kmh: f64,
}

impl Vehicle {
    pub fn spawn(rng: &mut impl Rng, device_id: String, origin: (f64, f64)) -> Self {
        Self {
            device_id,
            lat: origin.0 + rng.gen_range(-0.05..0.05),
            lon: origin.1 + rng.gen_range(-0.05..0.05),
            heading: rng.gen_range(0.0..360.0),
            speed_kmh: rng.gen_range(10.0..60.0),
        }
    }

    /// Advances the vehicle by `secs` of driving with some jitter in
    /// heading and speed.
    pub fn advance(&mut self, rng: &mut impl Rng, secs: f64) {
        self.heading = (self.heading + rng.gen_range(-15.0..15.0)).rem_euclid(360.0);
        self.speed_kmh = (self.speed_kmh + rng.gen_range(-5.0..5.0)).clamp(0.0, 120.0);

        let distance_m = self.speed_kmh / 3.6 * secs;
        let bearing = self.heading.to_radians();
        self.lat += (distance_m * bearing.cos() / EARTH_RADIUS_M).to_degrees();
        self.lon += (distance_m * bearing.sin() / (EARTH_RADIUS_M * self.lat.to_radians().cos()))
            .to_degrees();
        self.lat = self.lat.clamp(-89.9, 89.9);
        self.lon = (self.lon + 180.0).rem_euclid(360.0) - 180.0;
    }

    pub fn report(&self, rng: &mut impl Rng) -> Report {
        let sats = rng.gen_range(4..14);
        Report {
            device_id: self.device_id.clone(),
            ts: Utc::now(),
            lat: self.lat,
            lon: self.lon,
            alt: rng.gen_bool(0.8).then(|| rng.gen_range(0.0..300.0)),
            speed_kmh: self.speed_kmh,
            heading: self.heading,
            fix: if sats >= 6 { "3d" } else { "2d" }.to_string(),
            sats,
            hdop: rng.gen_range(0.6..3.0),
        }
    }
}

/// Corrupts a report so the hub rejects it.
pub fn out_of_range(rng: &mut impl Rng, mut report: Report) -> Report {
    match rng.gen_range(0..3) {
        0 => report.lat = rng.gen_range(91.0..180.0),
        1 => report.lon = rng.gen_range(-360.0..-181.0),
        _ => report.speed_kmh = -rng.gen_range(1.0f64..50.0),
    }
    report
}
