// src/api/candles.rs — GET /candles, /candles/smart, /candles/lazy,
// /candles/native[-v2], /candles/explain (spec §4.6).
//
// The read-through cache keyed by `symbol|resolution|start|end` mirrors the
// teacher's manual `CandleCache` HashMap-with-eviction
// (examples/sf19-97-sptrader-chart-lib/.../main.rs's `cache_key` /
// 100-entry eviction loop), reimplemented with the `lru` crate instead of
// hand-rolled LRU bookkeeping.

use std::time::Instant;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult, PartialResponse};
use crate::model::{Candle, Timeframe};
use crate::planner::{Plan, PlanAlternative};
use crate::session_filter;

use super::{AppState, RangeQuery};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/candles", get(get_candles))
        .route("/candles/smart", get(get_candles_smart))
        .route("/candles/lazy", get(get_candles_lazy))
        .route("/candles/native", get(get_candles_native_v1))
        .route("/candles/native-v2", get(get_candles_native_v2))
        .route("/candles/explain", get(get_candles_explain))
}

#[derive(Debug, Clone, Serialize)]
pub struct CandleOut {
    pub timestamp: chrono::DateTime<Utc>,
    pub open: rust_decimal::Decimal,
    pub high: rust_decimal::Decimal,
    pub low: rust_decimal::Decimal,
    pub close: rust_decimal::Decimal,
    pub volume: rust_decimal::Decimal,
}

impl From<&Candle> for CandleOut {
    fn from(c: &Candle) -> Self {
        Self { timestamp: c.timestamp, open: c.open, high: c.high, low: c.low, close: c.close, volume: c.volume }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub table_used: String,
    pub query_time_ms: u64,
    pub cache_hit: bool,
    pub points_returned: usize,
    pub max_points: i64,
    pub data_complete: bool,
    pub data_source: String,
    pub server_time: chrono::DateTime<Utc>,
    pub time_range: i64,
    /// Set when the server clamped the requested range or resolution down
    /// to a feasible one (spec §6's "server clamps ranges ... and reports
    /// the clamp in metadata.reason").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandleResponse {
    pub symbol: String,
    pub timeframe: String,
    pub resolution: String,
    pub start: chrono::DateTime<Utc>,
    pub end: chrono::DateTime<Utc>,
    pub count: usize,
    pub candles: Vec<CandleOut>,
    pub metadata: Metadata,
}

/// lru-cache-backed read-through, capacity matches the teacher's manual
/// 100-entry eviction threshold.
pub type CandleCache = Arc<Mutex<LruCache<String, CandleResponse>>>;

pub fn new_cache() -> CandleCache {
    Arc::new(Mutex::new(LruCache::new(NonZeroUsize::new(100).unwrap())))
}

fn cache_key(query: &RangeQuery, resolution: Timeframe) -> String {
    format!("{}|{}|{}|{}", query.symbol, resolution.code(), query.start.timestamp(), query.end.timestamp())
}

async fn build_response(state: &AppState, query: &RangeQuery) -> ApiResult<CandleResponse> {
    query.validate()?;
    let resolution = query.resolution_timeframe()?;
    let started = Instant::now();

    let plan = state.planner.plan(&query.symbol, resolution, query.start, query.end).await?;
    if plan.overflows() {
        return Err(ApiError::PlannerOverflow { plan });
    }
    let candles = state.planner.execute(&plan, &query.symbol, query.start, query.end).await?;

    let reason = (candles.len() as i64 >= plan.max_allowed)
        .then(|| format!("range clamped to {} points at {} resolution", plan.max_allowed, plan.resolution.code()));

    let metadata = Metadata {
        table_used: plan.table_used.clone(),
        query_time_ms: started.elapsed().as_millis() as u64,
        cache_hit: false,
        points_returned: candles.len(),
        max_points: plan.max_allowed,
        data_complete: (candles.len() as i64) < plan.max_allowed,
        data_source: query.source.clone().unwrap_or_else(|| "v2".to_string()),
        server_time: Utc::now(),
        time_range: (query.end - query.start).num_microseconds().unwrap_or(0) * 1_000,
        reason,
    };

    Ok(CandleResponse {
        symbol: query.symbol.clone(),
        timeframe: plan.resolution.code().to_string(),
        resolution: plan.resolution.code().to_string(),
        start: query.start,
        end: query.end,
        count: candles.len(),
        candles: candles.iter().map(CandleOut::from).collect(),
        metadata,
    })
}

async fn get_candles(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<axum::Json<CandleResponse>> {
    let resolution = query.resolution_timeframe()?;
    let Some(resolution) = resolution else {
        return Ok(axum::Json(build_response(&state, &query).await?));
    };

    let key = cache_key(&query, resolution);
    if let Some(hit) = state.candle_cache.lock().get(&key).cloned() {
        let mut hit = hit;
        hit.metadata.cache_hit = true;
        return Ok(axum::Json(hit));
    }

    let response = build_response(&state, &query).await?;
    state.candle_cache.lock().put(key, response.clone());
    Ok(axum::Json(response))
}

async fn get_candles_smart(
    State(state): State<AppState>,
    Query(mut query): Query<RangeQuery>,
) -> ApiResult<axum::Json<CandleResponse>> {
    query.resolution = None;
    query.tf = None;
    Ok(axum::Json(build_response(&state, &query).await?))
}

async fn get_candles_lazy(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<axum::response::Response> {
    use axum::response::IntoResponse;
    query.validate()?;

    let availability = state.data_manager.check(&query.symbol, query.start, query.end).await?;

    // A cold symbol has no ticks at all, regardless of how the market-open
    // gap scan came out (a genuinely empty range still reports every open
    // hour as a gap). Kick off the backfill in the background — `ensure()`
    // can run for minutes, far past this request's `TimeoutLayer` — and
    // report `no_data` immediately rather than waiting on it.
    if availability.tick_count == 0 {
        let data_manager = state.data_manager.clone();
        let symbol = query.symbol.clone();
        let (start, end) = (query.start, query.end);
        tokio::spawn(async move {
            if let Err(err) = data_manager.ensure(&symbol, start, end).await {
                tracing::warn!(symbol, error = %err, "background ensure() failed");
            }
        });

        return Ok((
            axum::http::StatusCode::ACCEPTED,
            axum::Json(serde_json::json!({ "status": "no_data", "check_url": format!("/data/status?symbol={}", query.symbol) })),
        )
            .into_response());
    }

    if !availability.gaps.is_empty() {
        let resolution = query.resolution_timeframe()?;
        let plan = state.planner.plan(&query.symbol, resolution, query.start, query.end).await?;
        let candles = state.planner.execute(&plan, &query.symbol, query.start, query.end).await?;
        return Ok(PartialResponse {
            candles: candles.iter().map(CandleOut::from).collect(),
            gaps: availability.gaps,
            partial: true,
        }
        .into_response());
    }

    let response = build_response(&state, &query).await?;
    Ok(axum::Json(response).into_response())
}

#[derive(Debug, serde::Deserialize)]
pub struct NativeQuery {
    pub symbol: String,
    #[serde(alias = "timeframe")]
    pub tf: String,
    pub start: chrono::DateTime<Utc>,
    pub end: chrono::DateTime<Utc>,
}

async fn native_impl(state: &AppState, query: &NativeQuery, drop_zero_buckets: bool) -> ApiResult<CandleResponse> {
    if !crate::model::is_valid_symbol(&query.symbol) {
        return Err(ApiError::BadRequest { message: format!("invalid symbol: {}", query.symbol), plan: None });
    }
    let timeframe = Timeframe::parse(&query.tf)
        .ok_or_else(|| ApiError::BadRequest { message: format!("unknown timeframe: {}", query.tf), plan: None })?;

    let started = Instant::now();
    let plan = Plan {
        resolution: timeframe,
        table_used: crate::model::TICK_TABLE.to_string(),
        estimated_points: 0,
        max_allowed: 10_000,
        reason: crate::planner::PlanReason::RawTickFallback,
    };
    let mut candles = state.planner.execute(&plan, &query.symbol, query.start, query.end).await?;
    if drop_zero_buckets {
        candles.retain(|c| c.tick_count > 0);
    }

    Ok(CandleResponse {
        symbol: query.symbol.clone(),
        timeframe: timeframe.code().to_string(),
        resolution: timeframe.code().to_string(),
        start: query.start,
        end: query.end,
        count: candles.len(),
        candles: candles.iter().map(CandleOut::from).collect(),
        metadata: Metadata {
            table_used: crate::model::TICK_TABLE.to_string(),
            query_time_ms: started.elapsed().as_millis() as u64,
            cache_hit: false,
            points_returned: candles.len(),
            max_points: 10_000,
            data_complete: true,
            data_source: if drop_zero_buckets { "native-v2" } else { "native-v1" }.to_string(),
            server_time: Utc::now(),
            time_range: (query.end - query.start).num_microseconds().unwrap_or(0) * 1_000,
            reason: None,
        },
    })
}

async fn get_candles_native_v1(
    State(state): State<AppState>,
    Query(query): Query<NativeQuery>,
) -> ApiResult<axum::Json<CandleResponse>> {
    Ok(axum::Json(native_impl(&state, &query, false).await?))
}

async fn get_candles_native_v2(
    State(state): State<AppState>,
    Query(query): Query<NativeQuery>,
) -> ApiResult<axum::Json<CandleResponse>> {
    Ok(axum::Json(native_impl(&state, &query, true).await?))
}

#[derive(Debug, Serialize)]
pub struct ExplainResponse {
    pub plan: Plan,
    pub alternatives: Vec<PlanAlternative>,
}

async fn get_candles_explain(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<axum::Json<ExplainResponse>> {
    query.validate()?;
    let resolution = query.resolution_timeframe()?;
    let (plan, alternatives) = state.planner.explain(&query.symbol, resolution, query.start, query.end).await?;
    Ok(axum::Json(ExplainResponse { plan, alternatives }))
}

/// Applies SessionFilter's continuous-view transform; exposed for handlers
/// that accept a `continuous=true` flag (kept as a free function so it can
/// be unit tested without HTTP plumbing).
pub fn continuous(candles: Vec<Candle>, timeframe: Timeframe, holidays: &session_filter::HolidaySet) -> Vec<session_filter::ContinuousCandle> {
    session_filter::create_continuous_view(candles, timeframe, holidays)
}
