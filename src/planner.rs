// src/planner.rs — translates a (symbol, timeframe, start, end) request into
// a concrete table + SQL plan (spec §4.4). Deterministic and side-effect
// free except for the table-existence probe used by the fallback path.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregator::apply_daily_shift;
use crate::model::{Candle, Timeframe, TICK_TABLE};
use crate::store::{SqlParam, Store};

/// One row of the default-range decision table (spec §4.4 step 2).
struct DefaultRange {
    timeframe: Timeframe,
    max_duration_hours: Option<f64>,
    approx_points_at_max: i64,
}

const DEFAULT_RANGES: [DefaultRange; 7] = [
    DefaultRange { timeframe: Timeframe::M1, max_duration_hours: Some(24.0), approx_points_at_max: 1_440 },
    DefaultRange { timeframe: Timeframe::M5, max_duration_hours: Some(7.0 * 24.0), approx_points_at_max: 2_016 },
    DefaultRange { timeframe: Timeframe::M15, max_duration_hours: Some(14.0 * 24.0), approx_points_at_max: 1_344 },
    DefaultRange { timeframe: Timeframe::M30, max_duration_hours: Some(30.0 * 24.0), approx_points_at_max: 1_440 },
    DefaultRange { timeframe: Timeframe::H1, max_duration_hours: Some(90.0 * 24.0), approx_points_at_max: 2_160 },
    DefaultRange { timeframe: Timeframe::H4, max_duration_hours: Some(365.0 * 24.0), approx_points_at_max: 2_190 },
    DefaultRange { timeframe: Timeframe::D1, max_duration_hours: None, approx_points_at_max: 0 },
];

const ROW_LIMIT_CEILING: i64 = 10_000;
const ROW_LIMIT_SLACK: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanReason {
    ExplicitResolution,
    DefaultRangeMatch,
    CoarsestFallback,
    RawTickFallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub resolution: Timeframe,
    pub table_used: String,
    pub estimated_points: i64,
    pub max_allowed: i64,
    pub reason: PlanReason,
}

/// A request estimated to return more than this multiple of `max_allowed`
/// is rejected outright rather than silently clamped (spec §7).
pub const OVERFLOW_MULTIPLE: i64 = 10;

impl Plan {
    pub fn overflows(&self) -> bool {
        self.estimated_points > self.max_allowed * OVERFLOW_MULTIPLE
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanAlternative {
    pub resolution: Timeframe,
    pub recommended: bool,
    pub feasible: bool,
    pub estimated_points: i64,
}

pub struct Planner {
    store: Store,
}

impl Planner {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn max_points_for(timeframe: Timeframe) -> i64 {
        DEFAULT_RANGES
            .iter()
            .find(|r| r.timeframe == timeframe)
            .map(|r| r.approx_points_at_max)
            .unwrap_or(0)
    }

    /// Timeframes with an unbounded default range (currently only `1d`,
    /// per spec §4.4's table) have no `approx_points_at_max` to scale from,
    /// so they get the ceiling outright rather than `max(1, 0) * 1.2`
    /// rounding down to a single row.
    fn max_allowed_for(timeframe: Timeframe) -> i64 {
        let has_bounded_range =
            DEFAULT_RANGES.iter().any(|r| r.timeframe == timeframe && r.max_duration_hours.is_some());
        if !has_bounded_range {
            return ROW_LIMIT_CEILING;
        }
        let max_points = Self::max_points_for(timeframe).max(1) as f64;
        (ROW_LIMIT_CEILING as f64).min(max_points * ROW_LIMIT_SLACK) as i64
    }

    /// Picks the coarsest timeframe whose default range covers `duration_hours`,
    /// falling back to `1d` if nothing smaller covers it.
    fn pick_default_resolution(duration_hours: f64) -> Timeframe {
        for range in &DEFAULT_RANGES {
            if let Some(max_hours) = range.max_duration_hours {
                if duration_hours <= max_hours {
                    return range.timeframe;
                }
            }
        }
        Timeframe::D1
    }

    /// Builds the parameterised SQL template from spec §4.4 step 5.
    fn select_sql(table: &str) -> String {
        format!(
            "SELECT timestamp, open, high, low, close, volume FROM {table} \
             WHERE symbol = $1 AND timestamp >= $2 AND timestamp <= $3 \
             ORDER BY timestamp LIMIT $4"
        )
    }

    /// Computes the plan for a request, honouring an explicit resolution if
    /// given, and falling back to raw-tick aggregation if the chosen table
    /// is missing or empty for the symbol.
    pub async fn plan(
        &self,
        symbol: &str,
        timeframe: Option<Timeframe>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Plan, sqlx::Error> {
        let duration_hours = (end - start).num_seconds() as f64 / 3600.0;

        let (resolution, reason) = match timeframe {
            Some(tf) => (tf, PlanReason::ExplicitResolution),
            None => (Self::pick_default_resolution(duration_hours), PlanReason::DefaultRangeMatch),
        };

        let max_allowed = Self::max_allowed_for(resolution);
        let table = resolution.table_name().to_string();

        let table_has_data = self.store.table_exists(&table).await?
            && self
                .store
                .table_stats(&table)
                .await
                .map(|stats| stats.row_count > 0)
                .unwrap_or(false);

        if table_has_data {
            let estimated_points = self.estimate_points(&table, symbol, start, end).await?;
            Ok(Plan { resolution, table_used: table, estimated_points, max_allowed, reason })
        } else {
            let estimated_points =
                self.estimate_points(TICK_TABLE, symbol, start, end).await.unwrap_or(0);
            Ok(Plan {
                resolution,
                table_used: TICK_TABLE.to_string(),
                estimated_points,
                max_allowed,
                reason: PlanReason::RawTickFallback,
            })
        }
    }

    /// Raw estimated row count for `table` over `[start, end]`, unclamped —
    /// callers decide how to react to a count that overshoots `max_allowed`.
    async fn estimate_points(
        &self,
        table: &str,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        let sql = format!(
            "SELECT count(*) as n FROM {table} WHERE symbol = $1 AND timestamp >= $2 AND timestamp <= $3"
        );
        let row = self.store.query_row(&sql, &[symbol.into(), start.into(), end.into()]).await?;
        Ok(row.map(|r| sqlx::Row::try_get::<i64, _>(&r, "n").unwrap_or(0)).unwrap_or(0))
    }

    /// Returns the plan plus marked alternatives across every timeframe,
    /// without executing anything (spec §4.4's `Explain` operation).
    pub async fn explain(
        &self,
        symbol: &str,
        timeframe: Option<Timeframe>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(Plan, Vec<PlanAlternative>), sqlx::Error> {
        let plan = self.plan(symbol, timeframe, start, end).await?;
        let duration_hours = (end - start).num_seconds() as f64 / 3600.0;
        let recommended = Self::pick_default_resolution(duration_hours);

        let mut alternatives = Vec::with_capacity(Timeframe::ALL.len());
        for tf in Timeframe::ALL {
            let max_allowed = Self::max_allowed_for(tf);
            let table = tf.table_name();
            let estimated_points = self
                .estimate_points(table, symbol, start, end)
                .await
                .unwrap_or(0);
            alternatives.push(PlanAlternative {
                resolution: tf,
                recommended: tf == recommended,
                feasible: estimated_points <= max_allowed,
                estimated_points,
            });
        }

        Ok((plan, alternatives))
    }

    /// Executes a plan and returns the candles it describes, applying the
    /// daily-shift rule when aggregating raw ticks for `1d`.
    pub async fn execute(
        &self,
        plan: &Plan,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, sqlx::Error> {
        if plan.table_used == TICK_TABLE {
            return self.aggregate_raw(symbol, plan.resolution, start, end, plan.max_allowed).await;
        }

        let sql = Self::select_sql(&plan.table_used);
        let params: Vec<SqlParam> =
            vec![symbol.into(), start.into(), end.into(), plan.max_allowed.into()];
        let rows = self.store.query(&sql, &params).await?;
        Ok(rows.into_iter().map(|r| row_to_candle(&r, symbol)).collect())
    }

    async fn aggregate_raw(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Candle>, sqlx::Error> {
        let sample_by = match timeframe {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        };
        let sql = format!(
            "SELECT timestamp, first(price) AS open, max(price) AS high, min(price) AS low,
                    last(price) AS close, sum(volume) AS volume, count() AS tick_count, avg(price) AS vwap
             FROM {TICK_TABLE}
             WHERE symbol = $1 AND timestamp >= $2 AND timestamp <= $3
             SAMPLE BY {sample_by}
             LIMIT $4"
        );
        let params: Vec<SqlParam> = vec![symbol.into(), start.into(), end.into(), limit.into()];
        let rows = self.store.query(&sql, &params).await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let mut candle = row_to_candle(&r, symbol);
                candle.timestamp = apply_daily_shift(candle.timestamp, timeframe);
                candle
            })
            .collect())
    }
}

/// QuestDB's OHLC columns are `DOUBLE`, not `NUMERIC` — sqlx-postgres's
/// rust_decimal `Decode` only accepts the wire NUMERIC type, so a `DOUBLE`
/// column has to come back as `f64` and get converted, same as the teacher
/// sidesteps a direct-Decimal decode by casting to `::text` first.
fn decimal_col(row: &sqlx::postgres::PgRow, name: &str) -> rust_decimal::Decimal {
    use sqlx::Row;
    row.try_get::<f64, _>(name).ok().and_then(rust_decimal::Decimal::from_f64_retain).unwrap_or_default()
}

fn row_to_candle(row: &sqlx::postgres::PgRow, symbol: &str) -> Candle {
    use sqlx::Row;
    Candle {
        timestamp: row.try_get("timestamp").unwrap_or_else(|_| Utc::now()),
        symbol: symbol.to_string(),
        open: decimal_col(row, "open"),
        high: decimal_col(row, "high"),
        low: decimal_col(row, "low"),
        close: decimal_col(row, "close"),
        volume: decimal_col(row, "volume"),
        tick_count: row.try_get("tick_count").unwrap_or(0),
        vwap: decimal_col(row, "vwap"),
        trading_session: None,
        validation_status: crate::model::ValidationStatus::Ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_coarsest_timeframe_covering_duration() {
        assert_eq!(Planner::pick_default_resolution(12.0), Timeframe::M1);
        assert_eq!(Planner::pick_default_resolution(48.0), Timeframe::M5);
        assert_eq!(Planner::pick_default_resolution(20.0 * 24.0), Timeframe::M30);
        assert_eq!(Planner::pick_default_resolution(400.0 * 24.0), Timeframe::D1);
    }

    #[test]
    fn overflow_flags_requests_well_past_ten_times_the_budget() {
        let plan = Plan {
            resolution: Timeframe::M1,
            table_used: Timeframe::M1.table_name().to_string(),
            estimated_points: 50_000,
            max_allowed: 1_728,
            reason: PlanReason::DefaultRangeMatch,
        };
        assert!(plan.overflows());

        let within_budget = Plan { estimated_points: 1_728 * 10, ..plan };
        assert!(!within_budget.overflows());
    }

    #[test]
    fn row_limit_is_capped_at_ceiling() {
        // H4 has 2190 * 1.2 = 2628, well under the 10,000 ceiling.
        assert_eq!(Planner::max_allowed_for(Timeframe::H4), 2_628);
        // Nothing should ever exceed the ceiling even for a huge max_points.
        assert!(Planner::max_allowed_for(Timeframe::D1) <= ROW_LIMIT_CEILING);
    }
}
