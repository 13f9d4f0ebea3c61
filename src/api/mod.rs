// src/api/mod.rs — router wiring for the six request families in spec §4.6.
// Handlers read only from request state; all shared mutable state lives in
// `Store` and `DataManager` (spec §5).

pub mod candles;
pub mod data;
pub mod meta;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::api::candles::{new_cache, CandleCache};
use crate::config::Config;
use crate::data_manager::DataManager;
use crate::planner::Planner;
use crate::session_filter::HolidaySet;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub planner: Arc<Planner>,
    pub data_manager: Arc<DataManager>,
    pub holidays: Arc<HolidaySet>,
    pub candle_cache: CandleCache,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(store: Store, planner: Planner, data_manager: DataManager, holidays: HolidaySet) -> Self {
        Self {
            store,
            planner: Arc::new(planner),
            data_manager: Arc::new(data_manager),
            holidays: Arc::new(holidays),
            candle_cache: new_cache(),
            started_at: chrono::Utc::now(),
        }
    }
}

pub fn router(state: AppState, config: &Config) -> Router {
    Router::new()
        .merge(candles::routes())
        .merge(data::routes())
        .merge(meta::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
        .layer(CorsLayer::permissive())
}

/// Shared query-parameter shape across `/candles*` and `/data*` (spec §6).
#[derive(Debug, serde::Deserialize)]
pub struct RangeQuery {
    pub symbol: String,
    #[serde(alias = "timeframe")]
    pub tf: Option<String>,
    pub start: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,
    pub resolution: Option<String>,
    pub source: Option<String>,
}

impl RangeQuery {
    pub fn validate(&self) -> Result<(), crate::error::ApiError> {
        if !crate::model::is_valid_symbol(&self.symbol) {
            return Err(crate::error::ApiError::BadRequest {
                message: format!("invalid symbol: {}", self.symbol),
                plan: None,
            });
        }
        if self.start >= self.end {
            return Err(crate::error::ApiError::BadRequest {
                message: "start must be before end".to_string(),
                plan: None,
            });
        }
        Ok(())
    }

    pub fn resolution_timeframe(&self) -> Result<Option<crate::model::Timeframe>, crate::error::ApiError> {
        let code = self.resolution.as_deref().or(self.tf.as_deref());
        match code {
            Some(code) => crate::model::Timeframe::parse(code).map(Some).ok_or_else(|| {
                crate::error::ApiError::BadRequest { message: format!("unknown timeframe: {code}"), plan: None }
            }),
            None => Ok(None),
        }
    }
}
