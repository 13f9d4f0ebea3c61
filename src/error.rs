// src/error.rs — the error taxonomy from spec §7, surfaced as HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;

use crate::planner::Plan;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {message}")]
    BadRequest { message: String, plan: Option<Plan> },

    #[error("symbol not found: {0}")]
    NotFoundSymbol(String),

    #[error("estimated result exceeds the planner budget")]
    PlannerOverflow { plan: Plan },

    #[error("fetch already in progress")]
    FetchPending { status_url: String },

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("validation failure for {symbol}: {message}")]
    Validation { symbol: String, message: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),

    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::BadRequest { message, plan } => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "bad_request", "details": message, "plan": plan }),
            ),
            ApiError::NotFoundSymbol(symbol) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "not_found", "details": format!("unknown symbol {symbol}") }),
            ),
            ApiError::PlannerOverflow { plan } => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "planner_overflow", "details": "requested range exceeds 10x the resolution's point budget", "plan": plan }),
            ),
            ApiError::FetchPending { status_url } => (
                StatusCode::ACCEPTED,
                json!({ "status": "fetching", "check_url": status_url }),
            ),
            ApiError::Upstream(detail) => (
                StatusCode::BAD_GATEWAY,
                json!({ "error": "upstream_failure", "details": detail }),
            ),
            ApiError::Validation { symbol, message } => (
                StatusCode::OK,
                json!({ "warning": "validation_failure", "symbol": symbol, "details": message }),
            ),
            ApiError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "internal", "details": err.to_string() }),
            ),
            ApiError::Store(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "store_error", "details": err.to_string() }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Successful-but-partial response shape for `/candles/lazy` (206).
#[derive(Debug, Serialize)]
pub struct PartialResponse<T: Serialize> {
    pub candles: Vec<T>,
    pub gaps: Vec<crate::data_manager::Gap>,
    pub partial: bool,
}

impl<T: Serialize> IntoResponse for PartialResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::PARTIAL_CONTENT, Json(self)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
