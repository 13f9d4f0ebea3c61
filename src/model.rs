// src/model.rs — core data model: ticks, candles, timeframes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single forex quote at microsecond precision, as stored in `market_data_v2`.
///
/// Invariant: within a single ingestion transaction, ticks for a symbol are
/// appended in non-decreasing `timestamp` order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    /// Midpoint `(bid + ask) / 2`. Legacy tick sources that only carry `bid`
    /// and separate volume legs are normalized to this shape at ingest time.
    pub price: Decimal,
    pub spread: Decimal,
    pub bid_volume: Decimal,
    pub ask_volume: Decimal,
    pub volume: Decimal,
}

impl Tick {
    /// Build a tick from bid/ask/volume legs, deriving `price`, `spread` and
    /// the combined `volume` the canonical data model uses (see spec §9,
    /// "raw-tick volume vs bid_volume/ask_volume").
    pub fn from_legs(
        timestamp: DateTime<Utc>,
        symbol: impl Into<String>,
        bid: Decimal,
        ask: Decimal,
        bid_volume: Decimal,
        ask_volume: Decimal,
    ) -> Self {
        let price = (bid + ask) / Decimal::TWO;
        let spread = ask - bid;
        Self {
            timestamp,
            symbol: symbol.into(),
            bid,
            ask,
            price,
            spread,
            bid_volume,
            ask_volume,
            volume: bid_volume + ask_volume,
        }
    }
}

/// Validation status attached to a candle, set by the Aggregator's
/// post-build validation pass and cleared by the next successful rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Ok,
    Flagged,
}

/// A fixed-duration OHLC bar for `(symbol, timeframe)`, covering the
/// half-open interval `[timestamp, timestamp + duration)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub tick_count: i64,
    pub vwap: Decimal,
    pub trading_session: Option<String>,
    pub validation_status: ValidationStatus,
}

impl Candle {
    /// `low <= open <= high`, `low <= close <= high`, `volume >= 0`, `tick_count >= 1`.
    pub fn satisfies_ohlc_invariants(&self) -> bool {
        self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
            && self.volume >= Decimal::ZERO
            && self.tick_count >= 1
    }
}

/// The closed set of seven supported bar durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Canonical duration in seconds.
    pub const fn duration_secs(self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1800,
            Timeframe::H1 => 3600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }

    /// The `ohlc_{tf}_v2` table name this timeframe is stored in.
    pub const fn table_name(self) -> &'static str {
        match self {
            Timeframe::M1 => "ohlc_1m_v2",
            Timeframe::M5 => "ohlc_5m_v2",
            Timeframe::M15 => "ohlc_15m_v2",
            Timeframe::M30 => "ohlc_30m_v2",
            Timeframe::H1 => "ohlc_1h_v2",
            Timeframe::H4 => "ohlc_4h_v2",
            Timeframe::D1 => "ohlc_1d_v2",
        }
    }

    /// Whether the table is partitioned daily (sub-1d) or monthly (1d).
    pub const fn partition_by_month(self) -> bool {
        matches!(self, Timeframe::D1)
    }

    pub const fn code(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Some(match code {
            "1m" => Timeframe::M1,
            "5m" => Timeframe::M5,
            "15m" => Timeframe::M15,
            "30m" => Timeframe::M30,
            "1h" => Timeframe::H1,
            "4h" => Timeframe::H4,
            "1d" => Timeframe::D1,
            _ => return None,
        })
    }

    /// The next coarser timeframe, if any — used by the Aggregator's
    /// ratio-monotonicity validation (spec §4.3).
    pub fn next_coarser(self) -> Option<Timeframe> {
        match self {
            Timeframe::M1 => Some(Timeframe::M5),
            Timeframe::M5 => Some(Timeframe::M15),
            Timeframe::M15 => Some(Timeframe::M30),
            Timeframe::M30 => Some(Timeframe::H1),
            Timeframe::H1 => Some(Timeframe::H4),
            Timeframe::H4 => Some(Timeframe::D1),
            Timeframe::D1 => None,
        }
    }

    /// Minimum acceptable `count(self) / count(next_coarser)` ratio, per
    /// spec §4.3's validation table. `None` for `1d`, which has no coarser
    /// neighbour to compare against.
    pub fn min_ratio_to_next(self) -> Option<f64> {
        match self {
            Timeframe::M1 => Some(4.5),
            Timeframe::M5 => Some(2.5),
            Timeframe::M15 => Some(1.5),
            Timeframe::M30 => Some(1.5),
            Timeframe::H1 => Some(3.5),
            Timeframe::H4 => Some(3.5),
            Timeframe::D1 => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Name of the raw tick table. Partitioned by day.
pub const TICK_TABLE: &str = "market_data_v2";

/// A forex pair symbol: six uppercase letters (e.g. `EURUSD`).
pub fn is_valid_symbol(symbol: &str) -> bool {
    symbol.len() == 6 && symbol.chars().all(|c| c.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_round_trips_through_code() {
        for tf in Timeframe::ALL {
            assert_eq!(Timeframe::parse(tf.code()), Some(tf));
        }
    }

    #[test]
    fn timeframe_durations_are_canonical() {
        assert_eq!(Timeframe::M1.duration_secs(), 60);
        assert_eq!(Timeframe::D1.duration_secs(), 86_400);
    }

    #[test]
    fn tick_from_legs_derives_midpoint_and_combined_volume() {
        let tick = Tick::from_legs(
            Utc::now(),
            "EURUSD",
            Decimal::new(110450, 5),
            Decimal::new(110460, 5),
            Decimal::new(100, 0),
            Decimal::new(50, 0),
        );
        assert_eq!(tick.price, Decimal::new(110455, 5));
        assert_eq!(tick.volume, Decimal::new(150, 0));
    }

    #[test]
    fn candle_invariant_rejects_inconsistent_bars() {
        let mut candle = Candle {
            timestamp: Utc::now(),
            symbol: "EURUSD".into(),
            open: Decimal::new(11, 1),
            high: Decimal::new(12, 1),
            low: Decimal::new(10, 1),
            close: Decimal::new(11, 1),
            volume: Decimal::ONE,
            tick_count: 1,
            vwap: Decimal::new(11, 1),
            trading_session: None,
            validation_status: ValidationStatus::Ok,
        };
        assert!(candle.satisfies_ohlc_invariants());
        candle.open = Decimal::new(20, 1); // above high
        assert!(!candle.satisfies_ohlc_invariants());
    }

    #[test]
    fn symbol_validation() {
        assert!(is_valid_symbol("EURUSD"));
        assert!(!is_valid_symbol("eurusd"));
        assert!(!is_valid_symbol("EUR"));
    }
}
