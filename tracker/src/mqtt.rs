use crate::errors::{Error, Result};
use crate::model::{TelemetryRecord, TelemetryReport};
use crate::pipeline::{is_retryable_error, IngestPipeline};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::{debug, error, info, warn};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

/// Feeds device publishes from an MQTT broker into the self-declared
/// ingestion path.
pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    topic: String,
    pipeline: IngestPipeline,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    client.subscribe(&topic, QoS::AtLeastOnce).await?;

    info!("Subscribed to {} with QoS 1", topic);

    loop {
        match eventloop.poll().await {
            Ok(notification) => {
                if let Event::Incoming(Packet::Publish(publish)) = notification {
                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );

                    if let Err(e) =
                        process_message_with_retry(&publish.topic, &publish.payload, &pipeline).await
                    {
                        warn!(topic = %publish.topic, "Dropped MQTT report: {}", e);
                    }
                }
            }
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Process a message with exponential backoff retry
async fn process_message_with_retry(
    topic: &str,
    payload: &[u8],
    pipeline: &IngestPipeline,
) -> Result<TelemetryRecord> {
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match process_message(topic, payload, pipeline).await {
            Ok(record) => {
                if attempt > 1 {
                    info!("Message processed successfully on attempt {}", attempt);
                }
                return Ok(record);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES || !is_retryable_error(&e) {
                    return Err(e);
                }

                warn!(
                    "Message processing failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_RETRIES, e, backoff_ms
                );

                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// Process a single message
async fn process_message(
    topic: &str,
    payload: &[u8],
    pipeline: &IngestPipeline,
) -> Result<TelemetryRecord> {
    let report = serde_json::from_slice::<TelemetryReport>(payload)
        .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;

    let device_id = report
        .device_id
        .clone()
        .or_else(|| device_id_from_topic(topic))
        .unwrap_or_default();

    pipeline.ingest(&device_id, report).await
}

/// `telemetry/<device_id>` → `<device_id>`
fn device_id_from_topic(topic: &str) -> Option<String> {
    let (_, last) = topic.rsplit_once('/')?;
    if last.is_empty() || last == "#" || last == "+" {
        return None;
    }
    Some(last.to_string())
}
