// src/aggregator/validate.rs — the post-build validation suite run once per
// symbol, synchronously, after all seven timeframes have been rebuilt
// (spec §4.3). A failure here never rolls anything back: the freshly built
// tables are left in place and the failure is just reported.

use sqlx::Row;

use crate::model::Timeframe;
use crate::store::Store;

#[derive(Debug, Clone, serde::Serialize)]
pub enum ValidationFailure {
    NotMonotonicallyDecreasing { coarser: Timeframe, finer_count: i64, coarser_count: i64 },
    RatioBelowMinimum { finer: Timeframe, coarser: Timeframe, ratio: f64, minimum: f64 },
    DuplicateTimestamps { timeframe: Timeframe, total: i64, distinct: i64 },
    SaturdayTimestampAfterShift { count: i64 },
    SundayTimestampBeforeMarketOpen { count: i64 },
}

const MARKET_OPEN_HOUR: i64 = 22;

/// Runs every check in spec §4.3's validation list. Returns `Ok(())` if all
/// pass, or every failure found (not just the first) otherwise.
pub async fn validate_build(
    store: &Store,
    symbol: &str,
    counts: &[(Timeframe, i64)],
) -> Result<Result<(), Vec<ValidationFailure>>, sqlx::Error> {
    let mut failures = Vec::new();

    check_monotonic_and_ratios(counts, &mut failures);

    for (timeframe, _) in counts {
        check_duplicate_timestamps(store, symbol, *timeframe, &mut failures).await?;
    }

    check_daily_calendar_rules(store, symbol, &mut failures).await?;

    if failures.is_empty() {
        Ok(Ok(()))
    } else {
        Ok(Err(failures))
    }
}

fn check_monotonic_and_ratios(counts: &[(Timeframe, i64)], failures: &mut Vec<ValidationFailure>) {
    for (timeframe, count) in counts {
        let Some(coarser) = timeframe.next_coarser() else { continue };
        let coarser_count = counts.iter().find(|(tf, _)| *tf == coarser).map(|(_, c)| *c).unwrap_or(0);

        if *count <= coarser_count {
            failures.push(ValidationFailure::NotMonotonicallyDecreasing {
                coarser,
                finer_count: *count,
                coarser_count,
            });
            continue;
        }

        if let Some(minimum) = timeframe.min_ratio_to_next() {
            if coarser_count > 0 {
                let ratio = *count as f64 / coarser_count as f64;
                if ratio < minimum {
                    failures.push(ValidationFailure::RatioBelowMinimum {
                        finer: *timeframe,
                        coarser,
                        ratio,
                        minimum,
                    });
                }
            }
        }
    }
}

async fn check_duplicate_timestamps(
    store: &Store,
    symbol: &str,
    timeframe: Timeframe,
    failures: &mut Vec<ValidationFailure>,
) -> Result<(), sqlx::Error> {
    let table = timeframe.table_name();
    let sql = format!(
        "SELECT count(*) as total, count(distinct timestamp) as distinct_ts FROM {table} WHERE symbol = $1"
    );
    let Some(row) = store.query_row(&sql, &[symbol.into()]).await? else { return Ok(()) };
    let total: i64 = row.try_get("total").unwrap_or(0);
    let distinct: i64 = row.try_get("distinct_ts").unwrap_or(0);
    if total != distinct {
        failures.push(ValidationFailure::DuplicateTimestamps { timeframe, total, distinct });
    }
    Ok(())
}

async fn check_daily_calendar_rules(
    store: &Store,
    symbol: &str,
    failures: &mut Vec<ValidationFailure>,
) -> Result<(), sqlx::Error> {
    let table = Timeframe::D1.table_name();

    let saturday_sql =
        format!("SELECT count(*) as n FROM {table} WHERE symbol = $1 AND dow(timestamp) = 6");
    if let Some(row) = store.query_row(&saturday_sql, &[symbol.into()]).await? {
        let n: i64 = row.try_get("n").unwrap_or(0);
        if n > 0 {
            failures.push(ValidationFailure::SaturdayTimestampAfterShift { count: n });
        }
    }

    let sunday_sql = format!(
        "SELECT count(*) as n FROM {table}
         WHERE symbol = $1 AND dow(timestamp) = 0 AND extract(hour from timestamp) < $2"
    );
    if let Some(row) = store.query_row(&sunday_sql, &[symbol.into(), MARKET_OPEN_HOUR.into()]).await? {
        let n: i64 = row.try_get("n").unwrap_or(0);
        if n > 0 {
            failures.push(ValidationFailure::SundayTimestampBeforeMarketOpen { count: n });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_check_flags_below_minimum() {
        let mut failures = Vec::new();
        let counts = vec![(Timeframe::M1, 100), (Timeframe::M5, 30)]; // ratio 3.33 < 4.5
        check_monotonic_and_ratios(&counts, &mut failures);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], ValidationFailure::RatioBelowMinimum { .. }));
    }

    #[test]
    fn monotonic_check_passes_with_healthy_ratios() {
        let mut failures = Vec::new();
        let counts = vec![(Timeframe::M1, 1440), (Timeframe::M5, 288)]; // ratio 5.0
        check_monotonic_and_ratios(&counts, &mut failures);
        assert!(failures.is_empty());
    }

    #[test]
    fn flags_non_monotonic_counts() {
        let mut failures = Vec::new();
        let counts = vec![(Timeframe::M1, 50), (Timeframe::M5, 60)];
        check_monotonic_and_ratios(&counts, &mut failures);
        assert!(matches!(failures[0], ValidationFailure::NotMonotonicallyDecreasing { .. }));
    }
}
