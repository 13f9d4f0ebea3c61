// src/api/meta.rs — /symbols, /timeframes, /contract, /health, /stats (spec §4.6).

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use serde::Serialize;

use crate::model::Timeframe;
use crate::store::PoolStats;

use super::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/symbols", get(symbols))
        .route("/timeframes", get(timeframes))
        .route("/contract", get(contract))
        .route("/health", get(health))
        .route("/stats", get(stats))
}

/// Forex pairs this server has been exercised against; not derived from the
/// Store, since an empty store is a valid (if boring) starting state.
const KNOWN_SYMBOLS: &[&str] = &[
    "EURUSD", "GBPUSD", "USDJPY", "AUDUSD", "USDCAD", "NZDUSD", "USDCHF",
];

async fn symbols() -> axum::Json<Vec<&'static str>> {
    axum::Json(KNOWN_SYMBOLS.to_vec())
}

#[derive(Debug, Serialize)]
pub struct TimeframeInfo {
    pub code: &'static str,
    pub duration_secs: i64,
    pub table: &'static str,
}

async fn timeframes() -> axum::Json<Vec<TimeframeInfo>> {
    axum::Json(
        Timeframe::ALL
            .into_iter()
            .map(|tf| TimeframeInfo { code: tf.code(), duration_secs: tf.duration_secs(), table: tf.table_name() })
            .collect(),
    )
}

#[derive(Debug, Serialize)]
pub struct Contract {
    pub candle_json_shape: &'static str,
    pub line_protocol: &'static str,
    pub downloader_invocation: &'static str,
}

async fn contract() -> axum::Json<Contract> {
    axum::Json(Contract {
        candle_json_shape: "{symbol,timeframe,resolution,start,end,count,candles[],metadata}",
        line_protocol: "market_data_v2,symbol=<sym> bid=<f>,ask=<f>,price=<f>,spread=<f>,volume=<f> <ts_nanoseconds>",
        downloader_invocation: "downloader <symbol> <YYYY-MM-DD start> <YYYY-MM-DD end>",
    })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: i64,
    pub store_reachable: bool,
}

async fn health(State(state): State<AppState>) -> axum::Json<HealthResponse> {
    let store_reachable = state.store.table_exists(crate::model::TICK_TABLE).await.unwrap_or(false);
    axum::Json(HealthResponse {
        status: if store_reachable { "ok" } else { "degraded" },
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
        store_reachable,
    })
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub pool: PoolStats,
    pub uptime_secs: i64,
}

async fn stats(State(state): State<AppState>) -> axum::Json<StatsResponse> {
    axum::Json(StatsResponse {
        pool: state.store.pool_stats(),
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
    })
}
