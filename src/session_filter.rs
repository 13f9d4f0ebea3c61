// src/session_filter.rs — maps a candle sequence onto a gap-free continuous
// timeline using forex session rules (spec §4.7). Pure, no I/O; shared in
// spirit with the desktop chart client, which applies the same rules when
// rendering (spec's out-of-scope client contract).

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::Serialize;

use crate::model::{Candle, Timeframe};

/// `YYYY-MM-DD` holiday set; bars whose date falls in this set are filtered
/// regardless of weekday.
pub type HolidaySet = HashSet<String>;

fn date_key(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

/// Sunday >=22h, or Monday-Thursday, or Friday <22h — and not a holiday.
pub fn is_market_open(ts: DateTime<Utc>, holidays: &HolidaySet) -> bool {
    if holidays.contains(&date_key(ts)) {
        return false;
    }
    match ts.weekday() {
        Weekday::Sun => ts.hour() >= 22,
        Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu => true,
        Weekday::Fri => ts.hour() < 22,
        Weekday::Sat => false,
    }
}

/// Monday-Friday and not a holiday — used only for the `1d` timeframe, where
/// hour-of-day is not a meaningful open/close boundary.
pub fn is_weekday(ts: DateTime<Utc>, holidays: &HolidaySet) -> bool {
    if holidays.contains(&date_key(ts)) {
        return false;
    }
    !matches!(ts.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Drops bars that fall outside market hours (or, for `1d`, outside
/// weekdays). Idempotent: filtering an already-filtered sequence is a no-op.
pub fn filter(candles: Vec<Candle>, timeframe: Timeframe, holidays: &HolidaySet) -> Vec<Candle> {
    let keep: fn(DateTime<Utc>, &HolidaySet) -> bool = if matches!(timeframe, Timeframe::D1) {
        is_weekday
    } else {
        is_market_open
    };
    candles.into_iter().filter(|c| keep(c.timestamp, holidays)).collect()
}

/// A candle annotated with the display timestamp `createContinuousView`
/// assigns it, alongside the original wall-clock timestamp for tooltips.
#[derive(Debug, Clone, Serialize)]
pub struct ContinuousCandle {
    #[serde(flatten)]
    pub candle: Candle,
    pub display_timestamp: DateTime<Utc>,
    pub original_timestamp: DateTime<Utc>,
}

/// Filters, then walks the sequence substituting display timestamps across
/// session boundaries so consecutive bars render with no visual gap.
///
/// Idempotent: feeding `createContinuousView`'s own output back in is a
/// no-op, because the second pass filters nothing further (every bar
/// already passed `is_market_open`/`is_weekday`) and the minimum positive
/// delta in the *display* timeline is already `interval`, so step 3 never
/// fires again.
pub fn create_continuous_view(
    candles: Vec<Candle>,
    timeframe: Timeframe,
    holidays: &HolidaySet,
) -> Vec<ContinuousCandle> {
    let filtered = filter(candles, timeframe, holidays);
    if filtered.is_empty() {
        return Vec::new();
    }

    let interval = min_positive_delta(&filtered).unwrap_or(timeframe.duration_secs());

    let mut out = Vec::with_capacity(filtered.len());
    let mut display_prev: Option<DateTime<Utc>> = None;
    let mut real_prev: Option<DateTime<Utc>> = None;

    for candle in filtered {
        let ts = candle.timestamp;
        let display = match (real_prev, display_prev) {
            (Some(prev_real), Some(prev_display)) => {
                let real_delta = (ts - prev_real).num_seconds();
                if is_session_boundary_jump(prev_real, ts, real_delta, interval) {
                    prev_display + chrono::Duration::seconds(interval)
                } else {
                    prev_display + chrono::Duration::seconds(real_delta)
                }
            }
            _ => ts,
        };
        out.push(ContinuousCandle { original_timestamp: ts, display_timestamp: display, candle });
        real_prev = Some(ts);
        display_prev = Some(display);
    }
    out
}

/// A jump is a session-boundary jump if it's larger than the detected
/// interval and the earlier timestamp falls in the Friday-close-to-
/// Sunday-open window.
fn is_session_boundary_jump(prev_real: DateTime<Utc>, ts: DateTime<Utc>, real_delta_secs: i64, interval: i64) -> bool {
    if real_delta_secs <= interval {
        return false;
    }
    let prev_is_friday_evening = prev_real.weekday() == Weekday::Fri && prev_real.hour() >= 22;
    let prev_is_weekend = matches!(prev_real.weekday(), Weekday::Sat)
        || (prev_real.weekday() == Weekday::Sun && prev_real.hour() < 22);
    let next_is_sunday_open_or_later = ts.weekday() != Weekday::Fri && ts.weekday() != Weekday::Sat;
    (prev_is_friday_evening || prev_is_weekend) && next_is_sunday_open_or_later
}

fn min_positive_delta(candles: &[Candle]) -> Option<i64> {
    candles
        .windows(2)
        .map(|pair| (pair[1].timestamp - pair[0].timestamp).num_seconds())
        .filter(|d| *d > 0)
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn candle_at(ts: DateTime<Utc>) -> Candle {
        Candle {
            timestamp: ts,
            symbol: "EURUSD".into(),
            open: Decimal::ONE,
            high: Decimal::ONE,
            low: Decimal::ONE,
            close: Decimal::ONE,
            volume: Decimal::ONE,
            tick_count: 1,
            vwap: Decimal::ONE,
            trading_session: None,
            validation_status: crate::model::ValidationStatus::Ok,
        }
    }

    #[test]
    fn market_open_excludes_weekend_but_keeps_sunday_evening() {
        let holidays = HolidaySet::new();
        let sat = Utc.with_ymd_and_hms(2024, 5, 18, 12, 0, 0).unwrap();
        let sun_evening = Utc.with_ymd_and_hms(2024, 5, 19, 22, 30, 0).unwrap();
        let sun_afternoon = Utc.with_ymd_and_hms(2024, 5, 19, 12, 0, 0).unwrap();
        let fri_evening = Utc.with_ymd_and_hms(2024, 5, 17, 21, 0, 0).unwrap();
        let fri_close = Utc.with_ymd_and_hms(2024, 5, 17, 22, 30, 0).unwrap();

        assert!(!is_market_open(sat, &holidays));
        assert!(is_market_open(sun_evening, &holidays));
        assert!(!is_market_open(sun_afternoon, &holidays));
        assert!(is_market_open(fri_evening, &holidays));
        assert!(!is_market_open(fri_close, &holidays));
    }

    #[test]
    fn filter_is_idempotent() {
        let holidays = HolidaySet::new();
        let candles = vec![
            candle_at(Utc.with_ymd_and_hms(2024, 5, 16, 10, 0, 0).unwrap()),
            candle_at(Utc.with_ymd_and_hms(2024, 5, 18, 10, 0, 0).unwrap()), // Saturday, dropped
        ];
        let once = filter(candles.clone(), Timeframe::H1, &holidays);
        let twice = filter(once.clone(), Timeframe::H1, &holidays);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 1);
    }

    #[test]
    fn continuous_view_closes_weekend_gap_and_keeps_original_timestamp() {
        let holidays = HolidaySet::new();
        let fri = Utc.with_ymd_and_hms(2024, 5, 17, 21, 0, 0).unwrap();
        let sun = Utc.with_ymd_and_hms(2024, 5, 19, 22, 0, 0).unwrap();
        let candles = vec![candle_at(fri), candle_at(sun)];

        let view = create_continuous_view(candles, Timeframe::H1, &holidays);
        assert_eq!(view.len(), 2);
        assert_eq!(view[1].original_timestamp, sun);
        let display_gap = (view[1].display_timestamp - view[0].display_timestamp).num_seconds();
        assert_eq!(display_gap, Timeframe::H1.duration_secs());
    }

    #[test]
    fn continuous_view_is_idempotent_on_its_own_output_candles() {
        let holidays = HolidaySet::new();
        let fri = Utc.with_ymd_and_hms(2024, 5, 17, 21, 0, 0).unwrap();
        let sun = Utc.with_ymd_and_hms(2024, 5, 19, 22, 0, 0).unwrap();
        let next = Utc.with_ymd_and_hms(2024, 5, 19, 23, 0, 0).unwrap();
        let candles = vec![candle_at(fri), candle_at(sun), candle_at(next)];

        let first_pass = create_continuous_view(candles, Timeframe::H1, &holidays);
        let rebuilt: Vec<Candle> = first_pass
            .iter()
            .map(|cc| {
                let mut c = cc.candle.clone();
                c.timestamp = cc.display_timestamp;
                c
            })
            .collect();
        let second_pass = create_continuous_view(rebuilt, Timeframe::H1, &holidays);
        let deltas: Vec<i64> = second_pass
            .windows(2)
            .map(|w| (w[1].display_timestamp - w[0].display_timestamp).num_seconds())
            .collect();
        assert!(deltas.iter().all(|d| *d == Timeframe::H1.duration_secs()));
    }
}
