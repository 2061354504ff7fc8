//! Control surface route handlers.
//!
//! All endpoints return JSON. Errors render as `{"error": "..."}`.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::brokerage::{Credentials, GatewayError};
use crate::engine::controller::{LoopController, LoopStatus, StartOutcome};
use crate::types::{AccountSnapshot, CaimeoError, DecisionRecord, DiscoveryProgress, OpenOrder, Position};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct DashboardState {
    pub controller: Arc<LoopController>,
    pub started_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn new(controller: Arc<LoopController>) -> Self {
        Self {
            controller,
            started_at: Utc::now(),
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No valid brokerage session; authenticate first")]
    NotAuthenticated,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    State(CaimeoError),

    #[error("{0}")]
    Internal(String),
}

impl From<CaimeoError> for ApiError {
    fn from(e: CaimeoError) -> Self {
        match e {
            CaimeoError::NotAuthenticated => ApiError::NotAuthenticated,
            other => ApiError::State(other),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(format!("{e:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotAuthenticated | ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::Gateway(GatewayError::Unauthorized) => StatusCode::UNAUTHORIZED,
            ApiError::Gateway(GatewayError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Gateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::State(CaimeoError::StateCorrupt { .. }) => StatusCode::CONFLICT,
            ApiError::State(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "Control request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Accepts `apiKey/apiSecret` as well as `api_key/api_secret`.
#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    #[serde(default, alias = "apiKey")]
    pub api_key: String,
    #[serde(default, alias = "apiSecret")]
    pub api_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

// ---------------------------------------------------------------------------
// Session & control
// ---------------------------------------------------------------------------

/// POST /auth
pub async fn authenticate(
    State(state): State<AppState>,
    Json(req): Json<AuthRequest>,
) -> ApiResult<Value> {
    let credentials = Credentials::new(req.api_key.trim(), req.api_secret.trim());
    if state.controller.authenticate(credentials).await? {
        Ok(Json(json!({ "authenticated": true })))
    } else {
        Err(ApiError::InvalidCredentials)
    }
}

/// POST /start
pub async fn start(State(state): State<AppState>) -> ApiResult<Value> {
    let outcome: StartOutcome = state.controller.start().await?;
    Ok(Json(json!({ "status": outcome })))
}

/// POST /stop
pub async fn stop(State(state): State<AppState>) -> Json<Value> {
    let stopped = state.controller.stop().await;
    Json(json!({ "status": stopped }))
}

/// GET /status
pub async fn get_status(State(state): State<AppState>) -> Json<LoopStatus> {
    Json(state.controller.status().await)
}

/// GET /progress
pub async fn get_progress(State(state): State<AppState>) -> Json<DiscoveryProgress> {
    Json(state.controller.progress())
}

// ---------------------------------------------------------------------------
// Brokerage views
// ---------------------------------------------------------------------------

fn require_session(state: &DashboardState) -> Result<(), ApiError> {
    if state.controller.is_authenticated() {
        Ok(())
    } else {
        Err(ApiError::NotAuthenticated)
    }
}

/// GET /positions
pub async fn get_positions(State(state): State<AppState>) -> ApiResult<Vec<Position>> {
    require_session(&state)?;
    Ok(Json(state.controller.positions().await?))
}

/// GET /orders
pub async fn get_orders(State(state): State<AppState>) -> ApiResult<Vec<OpenOrder>> {
    require_session(&state)?;
    Ok(Json(state.controller.open_orders().await?))
}

/// GET /account
pub async fn get_account(State(state): State<AppState>) -> ApiResult<AccountSnapshot> {
    require_session(&state)?;
    Ok(Json(state.controller.account().await?))
}

// ---------------------------------------------------------------------------
// Journal views
// ---------------------------------------------------------------------------

/// GET /trade_history
pub async fn get_trade_history(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Vec<DecisionRecord>> {
    Ok(Json(state.controller.trade_history(q.limit).await?))
}

/// GET /decisions
pub async fn get_decisions(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Vec<DecisionRecord>> {
    Ok(Json(state.controller.recent_decisions(q.limit).await?))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let status = |e: ApiError| e.into_response().status();
        assert_eq!(status(ApiError::NotAuthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(status(GatewayError::Unauthorized.into()), StatusCode::UNAUTHORIZED);
        assert_eq!(status(GatewayError::Timeout.into()), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status(GatewayError::Unreachable("refused".into()).into()),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(
                CaimeoError::StateCorrupt {
                    path: "c.json".into(),
                    reason: "eof".into()
                }
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(status(CaimeoError::NotAuthenticated.into()), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_auth_request_aliases() {
        let camel: AuthRequest = serde_json::from_str(r#"{"apiKey":"k","apiSecret":"s"}"#).unwrap();
        let snake: AuthRequest = serde_json::from_str(r#"{"api_key":"k","api_secret":"s"}"#).unwrap();
        assert_eq!(camel.api_key, snake.api_key);
        assert_eq!(camel.api_secret, "s");
    }
}
