// src/aggregator/mod.rs — builds the seven OHLC tables for one symbol from
// raw ticks, preserving every other symbol's rows (spec §4.3).

mod validate;

pub use validate::{validate_build, ValidationFailure};

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{info, instrument, warn};

use crate::model::{Timeframe, TICK_TABLE};
use crate::store::Store;

#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildReport {
    pub symbol: String,
    pub counts: Vec<(Timeframe, i64)>,
    pub validation: Result<(), Vec<ValidationFailure>>,
}

/// The `_new`-table-then-atomic-rename build for every timeframe, followed
/// by the post-build validation suite. Always aggregates straight from
/// `market_data_v2` — never chains a coarser timeframe off a finer one,
/// because the underlying engine has been observed to silently drop buckets
/// when it does.
#[instrument(skip(store))]
pub async fn rebuild_symbol(store: &Store, symbol: &str) -> Result<BuildReport, sqlx::Error> {
    let mut counts = Vec::with_capacity(Timeframe::ALL.len());
    for timeframe in Timeframe::ALL {
        let count = build_timeframe(store, symbol, timeframe).await?;
        counts.push((timeframe, count));
        info!(symbol, timeframe = %timeframe, count, "rebuilt timeframe");
    }

    let validation = validate_build(store, symbol, &counts).await?;
    if let Err(failures) = &validation {
        warn!(symbol, ?failures, "post-build validation failed; built tables left in place");
    }

    Ok(BuildReport { symbol: symbol.to_string(), counts, validation })
}

async fn build_timeframe(store: &Store, symbol: &str, timeframe: Timeframe) -> Result<i64, sqlx::Error> {
    let live = timeframe.table_name();
    let staging = format!("{live}_new");

    create_staging_table(store, &staging, timeframe).await?;
    copy_other_symbols(store, &staging, live, symbol).await?;
    let count = insert_buckets(store, &staging, symbol, timeframe).await?;
    rename_over(store, &staging, live).await?;

    Ok(count)
}

async fn create_staging_table(store: &Store, staging: &str, timeframe: Timeframe) -> Result<(), sqlx::Error> {
    let partition = if timeframe.partition_by_month() { "MONTH" } else { "DAY" };
    let sql = format!(
        "CREATE TABLE {staging} (
            timestamp TIMESTAMP,
            symbol SYMBOL,
            open DOUBLE,
            high DOUBLE,
            low DOUBLE,
            close DOUBLE,
            volume DOUBLE,
            tick_count LONG,
            vwap DOUBLE
        ) TIMESTAMP(timestamp) PARTITION BY {partition} WAL"
    );
    // A re-run after a previous failed build must not choke on a leftover
    // staging table from the attempt before it.
    store.query(&format!("DROP TABLE IF EXISTS {staging}"), &[]).await?;
    store.query(&sql, &[]).await?;
    Ok(())
}

async fn copy_other_symbols(store: &Store, staging: &str, live: &str, symbol: &str) -> Result<(), sqlx::Error> {
    if !store.table_exists(live).await? {
        return Ok(());
    }
    let sql = format!("INSERT INTO {staging} SELECT * FROM {live} WHERE symbol != $1");
    store.query(&sql, &[symbol.into()]).await?;
    Ok(())
}

/// Bucket width expressed the way the engine's `SAMPLE BY` clause takes it.
fn sample_by_clause(timeframe: Timeframe) -> &'static str {
    match timeframe {
        Timeframe::M1 => "1m",
        Timeframe::M5 => "5m",
        Timeframe::M15 => "15m",
        Timeframe::M30 => "30m",
        Timeframe::H1 => "1h",
        Timeframe::H4 => "4h",
        Timeframe::D1 => "1d",
    }
}

async fn insert_buckets(
    store: &Store,
    staging: &str,
    symbol: &str,
    timeframe: Timeframe,
) -> Result<i64, sqlx::Error> {
    let sample_by = sample_by_clause(timeframe);
    // The engine's own calendar-aligned bucketing; for 1d it misplaces a
    // Friday session at Saturday 00:00, corrected by the shift below.
    let shift = if matches!(timeframe, Timeframe::D1) { " - 1d" } else { "" };
    let sql = format!(
        "INSERT INTO {staging}
         SELECT timestamp{shift} AS timestamp, symbol,
                first(price) AS open, max(price) AS high, min(price) AS low, last(price) AS close,
                sum(volume) AS volume, count() AS tick_count, avg(price) AS vwap
         FROM {TICK_TABLE}
         WHERE symbol = $1
         SAMPLE BY {sample_by}"
    );
    store.query(&sql, &[symbol.into()]).await?;

    let count_sql = format!("SELECT count(*) as n FROM {staging} WHERE symbol = $1");
    let row = store.query_row(&count_sql, &[symbol.into()]).await?;
    Ok(row.map(|r| r.try_get::<i64, _>("n").unwrap_or(0)).unwrap_or(0))
}

async fn rename_over(store: &Store, staging: &str, live: &str) -> Result<(), sqlx::Error> {
    store.query(&format!("DROP TABLE IF EXISTS {live}"), &[]).await?;
    store.query(&format!("RENAME TABLE {staging} TO {live}"), &[]).await?;
    Ok(())
}

/// Shared by the Aggregator's own `SAMPLE BY` path and by the Planner's
/// raw-tick fallback (spec §4.4 step 4), so both apply the identical shift.
pub fn apply_daily_shift(timestamp: DateTime<Utc>, timeframe: Timeframe) -> DateTime<Utc> {
    if matches!(timeframe, Timeframe::D1) {
        timestamp - chrono::Duration::days(1)
    } else {
        timestamp
    }
}
