use crate::auth::credential_from_headers;
use crate::errors::{Error, ErrorKind};
use crate::hub::Hub;
use crate::model::{
    DeviceRegistration, FeatureCollection, IngestResponse, RegisteredDevice, TelemetryReport,
};
use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, warn};

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<i64>,
}

pub fn create_router(hub: Hub, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/ingest", post(ingest))
        .route("/phone/ingest", post(ingest_phone))
        .route("/route/:device_id", get(route))
        .route("/telemetry/geojson", get(telemetry_geojson))
        .route("/devices/register", post(register_device))
        .route("/ws", get(live))
        .route("/healthz", get(health))
        .with_state(hub)
        .layer(cors_layer(cors_origins))
}

/// `*` allows any origin; otherwise only the listed ones.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

async fn ingest(
    State(hub): State<Hub>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, AppError> {
    let report: TelemetryReport = parse_body(&body)?;
    let record = hub
        .ingest_declared(credential_from_headers(&headers), report)
        .await?;
    Ok(Json(IngestResponse::ok(record.id)))
}

async fn ingest_phone(
    State(hub): State<Hub>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, AppError> {
    // the gate runs before the body is even looked at
    let identity = hub.authorize(credential_from_headers(&headers)).await?;
    let report: TelemetryReport = parse_body(&body)?;
    let record = hub.pipeline().ingest(&identity.device_id, report).await?;
    Ok(Json(IngestResponse::ok(record.id)))
}

async fn route(
    State(hub): State<Hub>,
    Path(device_id): Path<String>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<FeatureCollection>, AppError> {
    let records = hub.route(&device_id, params.limit).await?;
    Ok(Json(FeatureCollection::from_records(&records)))
}

async fn telemetry_geojson(
    State(hub): State<Hub>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<FeatureCollection>, AppError> {
    let records = hub.recent(params.limit).await?;
    Ok(Json(FeatureCollection::from_records(&records)))
}

async fn register_device(
    State(hub): State<Hub>,
    body: Bytes,
) -> Result<Json<RegisteredDevice>, AppError> {
    let registration: DeviceRegistration = parse_body(&body)?;
    Ok(Json(hub.register_device(registration).await?))
}

async fn live(State(hub): State<Hub>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let reason = hub.connections().serve(socket).await;
        debug!(?reason, "Live stream ended");
    })
}

async fn health(State(hub): State<Hub>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "subscribers": hub.registry().len().await,
    }))
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))
}

struct AppError(Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Authorization => StatusCode::UNAUTHORIZED,
            ErrorKind::Storage => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let detail = match kind {
            ErrorKind::Validation | ErrorKind::Authorization => self.0.to_string(),
            ErrorKind::Storage => {
                error!("Storage error: {}", self.0);
                "Storage unavailable".to_string()
            }
            ErrorKind::Internal => {
                error!("API error: {}", self.0);
                "Internal server error".to_string()
            }
        };

        (
            status,
            Json(json!({
                "status": "error",
                "error": kind.as_str(),
                "detail": detail,
            })),
        )
            .into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}
