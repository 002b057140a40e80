use crate::errors::{Error, Result};
use crate::metrics::{DB_RETRIES_TOTAL, STORAGE_FAILURES_TOTAL};
use crate::model::{
    DeviceIdentity, DeviceRegistration, NewTelemetry, RegisteredDevice, TelemetryRecord,
};
use crate::store::{DeviceStore, TelemetryStore};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_ATTEMPTS: u32 = 3;

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// PostgreSQL-backed telemetry and device storage.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn append_inner(&self, record: &NewTelemetry) -> Result<i64> {
        let query = r#"
            INSERT INTO telemetry (device_id, ts, lat, lon, alt, speed_kmh, heading, fix, sats, hdop)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#;

        let id: i64 = sqlx::query_scalar(query)
            .bind(&record.device_id)
            .bind(record.timestamp)
            .bind(record.latitude)
            .bind(record.longitude)
            .bind(record.altitude)
            .bind(record.speed)
            .bind(record.heading)
            .bind(&record.fix_quality)
            .bind(record.satellite_count)
            .bind(record.horizontal_dilution)
            .fetch_one(&self.pool)
            .await?;

        Ok(id)
    }
}

#[async_trait]
impl TelemetryStore for PgStore {
    async fn append(&self, record: &NewTelemetry) -> Result<i64> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.append_inner(record).await {
                Ok(id) => return Ok(id),
                Err(Error::Database(db_err))
                    if attempts < MAX_ATTEMPTS && is_transient_error(&db_err) =>
                {
                    let wait_ms = 100 * 2_u64.pow(attempts - 1);
                    warn!(
                        "Telemetry insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, MAX_ATTEMPTS, wait_ms, db_err
                    );
                    DB_RETRIES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!(
                        "Telemetry insert failed after {} attempts: {}",
                        attempts, e
                    );
                    STORAGE_FAILURES_TOTAL.inc();
                    return Err(e);
                }
            }
        }
    }

    async fn route(&self, device_id: &str, limit: i64) -> Result<Vec<TelemetryRecord>> {
        let mut rows = sqlx::query_as::<_, TelemetryRecord>(
            "SELECT id, device_id, ts, lat, lon, alt, speed_kmh, heading, fix, sats, hdop
             FROM telemetry
             WHERE device_id = $1
             ORDER BY ts DESC, id DESC
             LIMIT $2",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        // newest-first from the index, callers want chronological order
        rows.reverse();
        Ok(rows)
    }

    async fn recent(&self, limit: i64) -> Result<Vec<TelemetryRecord>> {
        let mut rows = sqlx::query_as::<_, TelemetryRecord>(
            "SELECT id, device_id, ts, lat, lon, alt, speed_kmh, heading, fix, sats, hdop
             FROM telemetry
             ORDER BY ts DESC, id DESC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.reverse();
        Ok(rows)
    }
}

#[async_trait]
impl DeviceStore for PgStore {
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<DeviceIdentity>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT device_id, user_id FROM devices WHERE api_key = $1")
                .bind(api_key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(device_id, owner_id)| DeviceIdentity {
            device_id,
            owner_id,
        }))
    }

    async fn touch(&self, device_id: &str) -> Result<()> {
        sqlx::query("UPDATE devices SET last_seen = NOW() WHERE device_id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn register(
        &self,
        device_id: &str,
        registration: &DeviceRegistration,
        api_key: &str,
    ) -> Result<RegisteredDevice> {
        // The conflict branch leaves api_key untouched, so RETURNING yields
        // the stored credential for an existing device.
        let query = r#"
            INSERT INTO devices (device_id, user_id, api_key, label, last_seen)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (device_id) DO UPDATE
                SET user_id = EXCLUDED.user_id,
                    label = EXCLUDED.label,
                    last_seen = NOW()
            RETURNING device_id, api_key
            "#;

        let (device_id, api_key): (String, String) = sqlx::query_as(query)
            .bind(device_id)
            .bind(&registration.owner_id)
            .bind(api_key)
            .bind(&registration.label)
            .fetch_one(&self.pool)
            .await?;

        Ok(RegisteredDevice { device_id, api_key })
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code == "08000" || // connection_exception
            code == "08003" || // connection_does_not_exist
            code == "08006" || // connection_failure
            code == "57P03" || // cannot_connect_now
            code == "53300" // too_many_connections
        }),
        _ => false,
    }
}
