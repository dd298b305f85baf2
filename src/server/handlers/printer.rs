//! Printer config, cached status and link handlers.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{error, warn};

use super::{success, ApiError};
use crate::mqtt::LinkStatus;
use crate::persistence::{PrinterConfig, PrinterConfigPatch};
use crate::relay::{RelayError, RelayService};

/// When the served status was received from the printer (RFC 3339).
pub const RECEIVED_AT_HEADER: HeaderName = HeaderName::from_static("x-telemetry-received-at");

/// GET /api/3dprint/config
pub async fn get_config(State(relay): State<Arc<RelayService>>) -> Json<PrinterConfig> {
    Json(relay.printer_config().await)
}

/// POST /api/3dprint/config - merge, persist, reconnect.
pub async fn update_config(
    State(relay): State<Arc<RelayService>>,
    patch: Result<Json<PrinterConfigPatch>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(patch) = patch.map_err(|rejection| {
        warn!("Rejected config update: {}", rejection.body_text());
        ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text())
    })?;
    match relay.update_config(patch).await {
        Ok(_) => Ok(success()),
        Err(RelayError::Link(e)) => {
            error!("Config saved but reconnect failed: {}", e);
            Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
        Err(e) => {
            error!("Failed to save printer config: {}", e);
            Err(ApiError::internal("Failed to save config"))
        }
    }
}

/// GET /api/3dprint/status - 204 until the first report arrived.
pub async fn status(State(relay): State<Arc<RelayService>>) -> Response {
    let Some(snapshot) = relay.telemetry() else {
        return StatusCode::NO_CONTENT.into_response();
    };

    let mut response = Json(snapshot.status.clone()).into_response();
    if let Ok(value) = HeaderValue::from_str(&snapshot.received_at.to_rfc3339()) {
        response.headers_mut().insert(RECEIVED_AT_HEADER, value);
    }
    response
}

/// GET /api/3dprint/link
pub async fn link(State(relay): State<Arc<RelayService>>) -> Json<LinkStatus> {
    Json(relay.link_status())
}

/// POST /api/3dprint/reconnect
pub async fn reconnect(
    State(relay): State<Arc<RelayService>>,
) -> Result<Json<LinkStatus>, ApiError> {
    relay
        .reconnect()
        .await
        .map(Json)
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}
