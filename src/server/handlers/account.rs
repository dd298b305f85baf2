//! Cloud account handlers.

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

use super::{success, ApiError};
use crate::cloud::{CloudError, LoginOutcome, ModelSummary};
use crate::relay::{RelayError, RelayService};

#[derive(Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub code: String,
}

/// GET /api/3dprint/token-status
pub async fn token_status(State(relay): State<Arc<RelayService>>) -> Json<Value> {
    Json(json!({ "loggedIn": relay.token_status().await }))
}

/// POST /api/3dprint/login
pub async fn login(
    State(relay): State<Arc<RelayService>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    info!("Cloud login requested for {}", req.username);

    match relay.login(&req.username, &req.password).await {
        Ok(LoginOutcome::Authenticated(_)) => Ok(success()),
        Ok(LoginOutcome::VerificationRequired) => Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Verification code required",
        )),
        Ok(LoginOutcome::Rejected) => Err(ApiError::new(StatusCode::FORBIDDEN, "Login failed")),
        Err(RelayError::Cloud(CloudError::Upstream { body, .. })) => Err(ApiError::internal(body)),
        Err(RelayError::Cloud(CloudError::InvalidResponse(e))) => {
            error!("Unreadable login response: {}", e);
            Err(ApiError::internal("Invalid login response"))
        }
        Err(e) => {
            error!("Error during login: {}", e);
            Err(ApiError::internal("Login error"))
        }
    }
}

/// POST /api/3dprint/verify
pub async fn verify(
    State(relay): State<Arc<RelayService>>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<Value>, ApiError> {
    match relay.verify(&req.email, &req.code).await {
        Ok(()) => Ok(success()),
        Err(RelayError::Cloud(CloudError::VerificationFailed(text))) => {
            Err(ApiError::new(StatusCode::UNAUTHORIZED, text))
        }
        Err(e) => {
            error!("Error during verification: {}", e);
            Err(ApiError::internal("Verification failed"))
        }
    }
}

/// GET /api/3dprint/model - latest print task of the logged-in account.
pub async fn model(
    State(relay): State<Arc<RelayService>>,
) -> Result<Json<ModelSummary>, ApiError> {
    match relay.model_summary().await {
        Ok(summary) => Ok(Json(summary)),
        Err(RelayError::UpstreamAuthExpired) => {
            Err(ApiError::new(StatusCode::UNAUTHORIZED, "Not authenticated"))
        }
        Err(RelayError::Cloud(CloudError::Upstream { status, body })) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            Err(ApiError::new(status, body))
        }
        Err(e) => {
            error!("Error fetching model info: {}", e);
            Err(ApiError::internal("Failed to fetch model info"))
        }
    }
}
