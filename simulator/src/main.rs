mod telemetry;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::{Duration, Instant};
use telemetry::{out_of_range, Vehicle};
use tracing::{error, info, warn};

/// Drives a fleet of simulated vehicles and publishes their GPS reports.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    /// Number of simulated vehicles
    #[arg(long, env = "DEVICES", default_value_t = 100)]
    devices: usize,

    /// Reports per second across the whole fleet
    #[arg(long, env = "RATE", default_value_t = 100)]
    rate: u64,

    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Reports go to `<prefix>/<device_id>`
    #[arg(long, env = "TOPIC_PREFIX", default_value = "telemetry")]
    topic_prefix: String,

    /// Share of reports sent out of range
    #[arg(long, default_value_t = 0.02)]
    invalid_ratio: f64,

    /// Fleet starting point as `lat,lon`
    #[arg(long, default_value = "48.8566,2.3522", value_parser = parse_origin)]
    origin: (f64, f64),
}

fn parse_origin(raw: &str) -> Result<(f64, f64), String> {
    let (lat, lon) = raw
        .split_once(',')
        .ok_or_else(|| "expected lat,lon".to_string())?;
    let lat = lat.trim().parse::<f64>().map_err(|e| e.to_string())?;
    let lon = lon.trim().parse::<f64>().map_err(|e| e.to_string())?;
    Ok((lat, lon))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let rate = args.rate.max(1);
    let devices = args.devices.max(1);

    info!("Starting GPS simulator");
    info!(
        "Broker: {}:{}, Rate: {} reports/s, Vehicles: {}",
        args.broker, args.port, rate, devices
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4().simple());
    let mut mqtt_options = MqttOptions::new(client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut rng = rand::thread_rng();
    let mut fleet: Vec<Vehicle> = (0..devices)
        .map(|n| Vehicle::spawn(&mut rng, format!("car-{}", n), args.origin))
        .collect();

    let burst_size = (rate as usize).clamp(1, 200);
    let burst_interval = Duration::from_millis((burst_size as u64 * 1000) / rate);
    // each vehicle moves once per full pass over the fleet
    let step_secs = devices as f64 / rate as f64;

    info!(
        "Publishing in bursts of {} reports every {:?}",
        burst_size, burst_interval
    );

    let mut sent = 0u64;
    let mut invalid = 0u64;
    let mut cursor = 0usize;

    loop {
        let burst_start = Instant::now();

        for _ in 0..burst_size {
            let vehicle = &mut fleet[cursor];
            cursor = (cursor + 1) % devices;

            vehicle.advance(&mut rng, step_secs);
            let mut report = vehicle.report(&mut rng);
            if rng.gen_bool(args.invalid_ratio.clamp(0.0, 1.0)) {
                report = out_of_range(&mut rng, report);
                invalid += 1;
            }

            let topic = format!("{}/{}", args.topic_prefix, report.device_id);
            let payload = match serde_json::to_string(&report) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize report: {}", e);
                    continue;
                }
            };

            match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => sent += 1,
                Err(e) => warn!("Failed to publish: {}", e),
            }
        }

        if sent % 1000 < burst_size as u64 {
            info!("Published {} reports ({} out of range)", sent, invalid);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?}; broker may be overloaded",
                elapsed, burst_interval
            );
        }
    }
}
