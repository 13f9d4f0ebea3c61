// src/data_manager.rs — ensures tick coverage for a (symbol, start, end)
// range before a candle request is served, and serialises concurrent
// requests for the same range so only one fetch runs at a time (spec §4.5).
//
// Gap-detection query is grounded on the teacher's `LAG(time) OVER (ORDER BY
// time)` pattern (examples/sf19-97-sptrader-chart-lib/.../market_data/commands.rs),
// adapted from "any gap > 1h" to "gap hours restricted to market-open time".

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::aggregator;
use crate::fetcher::{FetchError, Fetcher};
use crate::model::TICK_TABLE;
use crate::session_filter::{is_market_open, HolidaySet};
use crate::store::Store;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Gap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub hours: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub symbol: String,
    pub first_tick: Option<DateTime<Utc>>,
    pub last_tick: Option<DateTime<Utc>>,
    pub tick_count: i64,
    pub gaps: Vec<Gap>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureOutcome {
    Complete,
    Fetching,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum EnsureError {
    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

fn fetch_key(symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!("{symbol}|{}|{}", start.date_naive(), end.date_naive())
}

pub struct DataManager {
    store: Store,
    fetcher: Arc<dyn Fetcher>,
    in_progress: RwLock<HashSet<String>>,
    holidays: HolidaySet,
    /// Exactly one aggregation runs per symbol at a time; concurrent
    /// rebuild requests for the same symbol coalesce behind this lock
    /// rather than racing each other's `_new` staging tables (spec §5).
    aggregation_locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// One token per in-flight `(symbol, start, end)` fetch, so a caller can
    /// cancel it and have that cancellation reach the downloader subprocess
    /// (spec §4.5/§5's cancellation requirement).
    active_tokens: SyncMutex<HashMap<String, CancellationToken>>,
}

impl DataManager {
    pub fn new(store: Store, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            store,
            fetcher,
            in_progress: RwLock::new(HashSet::new()),
            holidays: HolidaySet::new(),
            aggregation_locks: SyncMutex::new(HashMap::new()),
            active_tokens: SyncMutex::new(HashMap::new()),
        }
    }

    fn aggregation_lock_for(&self, symbol: &str) -> Arc<AsyncMutex<()>> {
        self.aggregation_locks
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Cancels the in-flight fetch for `(symbol, start, end)`, if any; the
    /// downloader subprocess behind it is killed rather than left to finish.
    pub fn cancel(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let key = fetch_key(symbol, start, end);
        match self.active_tokens.lock().get(&key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every in-flight fetch; called on graceful shutdown so
    /// downloader subprocesses are killed instead of orphaned when the
    /// process exits.
    pub fn cancel_all(&self) {
        for token in self.active_tokens.lock().values() {
            token.cancel();
        }
    }

    /// Availability + gap list for `(symbol, [start, end])`, per spec §4.5
    /// step 2/3. Read-only — does not touch the fetch-in-progress set.
    #[instrument(skip(self))]
    pub async fn check(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Availability, sqlx::Error> {
        let stats_sql = format!(
            "SELECT min(timestamp) as min_ts, max(timestamp) as max_ts, count(*) as n
             FROM {TICK_TABLE} WHERE symbol = $1 AND timestamp >= $2 AND timestamp <= $3"
        );
        let row = self.store.query_row(&stats_sql, &[symbol.into(), start.into(), end.into()]).await?;
        let (first_tick, last_tick, tick_count) = match &row {
            Some(r) => (
                sqlx::Row::try_get(r, "min_ts").ok(),
                sqlx::Row::try_get(r, "max_ts").ok(),
                sqlx::Row::try_get(r, "n").unwrap_or(0),
            ),
            None => (None, None, 0),
        };

        let gaps = self.detect_gaps(symbol, start, end).await?;

        Ok(Availability { symbol: symbol.to_string(), first_tick, last_tick, tick_count, gaps })
    }

    /// Hourly-bucket gap detection restricted to market-open hours, per
    /// spec §4.5 step 3.
    async fn detect_gaps(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Gap>, sqlx::Error> {
        let sql = format!(
            "SELECT date_trunc('hour', timestamp) as hour, count(*) as n
             FROM {TICK_TABLE}
             WHERE symbol = $1 AND timestamp >= $2 AND timestamp <= $3
             GROUP BY hour"
        );
        let rows = self.store.query(&sql, &[symbol.into(), start.into(), end.into()]).await?;
        let mut populated_hours: HashSet<DateTime<Utc>> = HashSet::new();
        for row in &rows {
            if let Ok(hour) = sqlx::Row::try_get::<DateTime<Utc>, _>(row, "hour") {
                populated_hours.insert(hour);
            }
        }

        let mut gaps = Vec::new();
        let mut current_gap_start: Option<DateTime<Utc>> = None;
        let mut cursor = floor_hour(start);

        while cursor <= end {
            let is_gap_hour = is_market_open(cursor, &self.holidays) && !populated_hours.contains(&cursor);
            match (is_gap_hour, current_gap_start) {
                (true, None) => current_gap_start = Some(cursor),
                (false, Some(gap_start)) => {
                    gaps.push(build_gap(gap_start, cursor));
                    current_gap_start = None;
                }
                _ => {}
            }
            cursor += ChronoDuration::hours(1);
        }
        if let Some(gap_start) = current_gap_start {
            gaps.push(build_gap(gap_start, cursor));
        }

        Ok(gaps)
    }

    /// Drives the full state machine from spec §4.5: CHECKING, then either
    /// COMPLETE or FETCHING -> AGGREGATING -> COMPLETE/FAILED, serialising
    /// concurrent callers for the same `(symbol, start, end)` key.
    #[instrument(skip(self))]
    pub async fn ensure(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<EnsureOutcome, EnsureError> {
        let key = fetch_key(symbol, start, end);

        if self.in_progress.read().await.contains(&key) {
            return Ok(EnsureOutcome::Fetching);
        }

        let availability = self.check(symbol, start, end).await?;
        if availability.gaps.is_empty() {
            return Ok(EnsureOutcome::Complete);
        }

        {
            let mut guard = self.in_progress.write().await;
            if guard.contains(&key) {
                return Ok(EnsureOutcome::Fetching);
            }
            guard.insert(key.clone());
        }

        let token = CancellationToken::new();
        self.active_tokens.lock().insert(key.clone(), token.clone());
        let outcome = self.run_fetch_and_rebuild(symbol, &availability.gaps, &token).await;
        self.active_tokens.lock().remove(&key);
        self.in_progress.write().await.remove(&key);

        match outcome {
            Ok(()) => Ok(EnsureOutcome::Complete),
            Err(err) => {
                warn!(symbol, error = %err, "fetch-and-rebuild failed");
                Err(err)
            }
        }
    }

    async fn run_fetch_and_rebuild(
        &self,
        symbol: &str,
        gaps: &[Gap],
        cancel: &CancellationToken,
    ) -> Result<(), EnsureError> {
        for gap in gaps {
            let report = self
                .fetcher
                .fetch(&self.store, symbol, gap.start.date_naive(), gap.end.date_naive(), cancel)
                .await?;
            info!(symbol, gap_start = %gap.start, gap_end = %gap.end, records = report.records, "gap fetch complete");
        }

        let lock = self.aggregation_lock_for(symbol);
        let _guard = lock.lock().await;
        let build = aggregator::rebuild_symbol(&self.store, symbol).await?;
        if let Err(failures) = &build.validation {
            return Err(EnsureError::Fetch(FetchError::NonZeroExit {
                status: -1,
                stderr: format!("post-build validation failed: {failures:?}"),
            }));
        }
        Ok(())
    }
}

fn floor_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive().and_hms_opt(ts.hour(), 0, 0).unwrap().and_utc()
}

fn build_gap(start: DateTime<Utc>, end: DateTime<Utc>) -> Gap {
    let hours = (end - start).num_hours().max(1);
    Gap { start, end, hours }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_key_is_stable_across_same_day_range() {
        let start = DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let end = DateTime::parse_from_rfc3339("2024-05-02T00:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(fetch_key("EURUSD", start, end), "EURUSD|2024-05-01|2024-05-02");
    }

    #[test]
    fn build_gap_computes_hour_span() {
        let start = DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let end = DateTime::parse_from_rfc3339("2024-05-01T05:00:00Z").unwrap().with_timezone(&Utc);
        let gap = build_gap(start, end);
        assert_eq!(gap.hours, 5);
    }
}
