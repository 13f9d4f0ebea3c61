// src/api/data.rs — /data/check, /data/ensure, /data/status, /data/range,
// /data/quality, /quality/v2 (spec §4.6).

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data_manager::Availability;
use crate::error::{ApiError, ApiResult};
use crate::model::is_valid_symbol;

use super::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/data/check", get(check))
        .route("/data/ensure", post(ensure))
        .route("/data/status", get(status))
        .route("/data/range", get(range))
        .route("/data/quality", get(quality))
        .route("/quality/v2", get(quality))
}

#[derive(Debug, Deserialize)]
pub struct SymbolQuery {
    pub symbol: String,
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub symbol: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

fn require_symbol(symbol: &str) -> ApiResult<()> {
    if !is_valid_symbol(symbol) {
        return Err(ApiError::BadRequest { message: format!("invalid symbol: {symbol}"), plan: None });
    }
    Ok(())
}

async fn check(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> ApiResult<axum::Json<Availability>> {
    require_symbol(&params.symbol)?;
    let availability = state.data_manager.check(&params.symbol, params.start, params.end).await?;
    Ok(axum::Json(availability))
}

/// Triggers the fetch-and-rebuild state machine in the background and
/// returns 202 immediately. `ensure()` can run for minutes per a
/// downloader's worth of ticks, far past the request `TimeoutLayer`, so it
/// must never be awaited inline on this handler's task.
async fn ensure(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> ApiResult<axum::response::Response> {
    use axum::response::IntoResponse;
    require_symbol(&params.symbol)?;

    let data_manager = state.data_manager.clone();
    let symbol = params.symbol.clone();
    tokio::spawn(async move {
        if let Err(err) = data_manager.ensure(&symbol, params.start, params.end).await {
            tracing::warn!(symbol, error = %err, "background ensure() failed");
        }
    });

    Ok(ApiError::FetchPending { status_url: format!("/data/status?symbol={}", params.symbol) }
        .into_response())
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub symbol: String,
    pub first_tick: Option<DateTime<Utc>>,
    pub last_tick: Option<DateTime<Utc>>,
    pub tick_count: i64,
}

async fn status(
    State(state): State<AppState>,
    Query(params): Query<SymbolQuery>,
) -> ApiResult<axum::Json<StatusResponse>> {
    require_symbol(&params.symbol)?;
    let far_past = DateTime::parse_from_rfc3339("1970-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
    let availability = state.data_manager.check(&params.symbol, far_past, Utc::now()).await?;
    Ok(axum::Json(StatusResponse {
        symbol: availability.symbol,
        first_tick: availability.first_tick,
        last_tick: availability.last_tick,
        tick_count: availability.tick_count,
    }))
}

#[derive(Debug, Serialize)]
pub struct RangeResponse {
    pub symbol: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

async fn range(
    State(state): State<AppState>,
    Query(params): Query<SymbolQuery>,
) -> ApiResult<axum::Json<RangeResponse>> {
    require_symbol(&params.symbol)?;
    let stats = state.store.table_stats(crate::model::TICK_TABLE).await?;
    Ok(axum::Json(RangeResponse { symbol: params.symbol, start: stats.min_ts, end: stats.max_ts }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DayQuality {
    Excellent,
    Good,
    Poor,
}

#[derive(Debug, Serialize)]
pub struct QualityDay {
    pub date: chrono::NaiveDate,
    pub tick_count: i64,
    pub quality: DayQuality,
}

#[derive(Debug, Serialize)]
pub struct QualityResponse {
    pub symbol: String,
    pub latest_high_quality_day: Option<chrono::NaiveDate>,
    pub days: Vec<QualityDay>,
}

/// Thresholds are the same order of magnitude as a full trading day of
/// tick-level forex data; a day under `GOOD_THRESHOLD` ticks is treated as
/// too sparse to recommend as a default window.
const EXCELLENT_THRESHOLD: i64 = 50_000;
const GOOD_THRESHOLD: i64 = 5_000;

async fn quality(
    State(state): State<AppState>,
    Query(params): Query<SymbolQuery>,
) -> ApiResult<axum::Json<QualityResponse>> {
    require_symbol(&params.symbol)?;
    let sql = format!(
        "SELECT timestamp as day, count(*) as n FROM {} WHERE symbol = $1 SAMPLE BY 1d",
        crate::model::TICK_TABLE
    );
    let rows = state.store.query(&sql, &[params.symbol.as_str().into()]).await?;

    let mut days = Vec::with_capacity(rows.len());
    for row in &rows {
        let day_ts: DateTime<Utc> = sqlx::Row::try_get(row, "day").unwrap_or_else(|_| Utc::now());
        let n: i64 = sqlx::Row::try_get(row, "n").unwrap_or(0);
        let quality = if n >= EXCELLENT_THRESHOLD {
            DayQuality::Excellent
        } else if n >= GOOD_THRESHOLD {
            DayQuality::Good
        } else {
            DayQuality::Poor
        };
        days.push(QualityDay { date: day_ts.date_naive(), tick_count: n, quality });
    }

    let latest_high_quality_day = days
        .iter()
        .rev()
        .find(|d| matches!(d.quality, DayQuality::Excellent | DayQuality::Good))
        .map(|d| d.date);

    Ok(axum::Json(QualityResponse { symbol: params.symbol, latest_high_quality_day, days }))
}
