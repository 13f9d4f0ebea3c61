// src/ingestor.rs — converts an ordered stream of tick records into
// line-protocol frames and pushes them to the Store in batches (spec §4.2).

use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{instrument, warn};

use crate::store::{IlpBatch, Store};

pub const BATCH_SIZE: usize = 1_000;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// One line of the JSON-framed tick format the Ingestor (and the downloader
/// subprocess, per spec §6/§9) both produce/consume.
#[derive(Debug, Deserialize)]
pub struct TickRecord {
    pub timestamp: TimestampField,
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    #[serde(default)]
    pub bid_volume: Option<Decimal>,
    #[serde(default)]
    pub ask_volume: Option<Decimal>,
}

/// Accepts either an RFC3339 string or unix-microseconds integer, per spec
/// §4.2's validation rule.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TimestampField {
    Rfc3339(String),
    UnixMicros(i64),
}

impl TimestampField {
    fn parse(&self) -> Result<DateTime<Utc>, String> {
        match self {
            TimestampField::Rfc3339(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| format!("invalid RFC3339 timestamp {s}: {e}")),
            TimestampField::UnixMicros(us) => Utc
                .timestamp_micros(*us)
                .single()
                .ok_or_else(|| format!("invalid unix-microseconds timestamp {us}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("empty symbol")]
    EmptySymbol,
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("bid/ask crossed or non-positive: bid={bid} ask={ask}")]
    InvalidQuote { bid: Decimal, ask: Decimal },
}

fn validate(record: TickRecord) -> Result<crate::model::Tick, ValidationError> {
    if record.symbol.trim().is_empty() {
        return Err(ValidationError::EmptySymbol);
    }
    let timestamp = record.timestamp.parse().map_err(ValidationError::InvalidTimestamp)?;
    if record.bid <= Decimal::ZERO || record.ask <= Decimal::ZERO || record.ask < record.bid {
        return Err(ValidationError::InvalidQuote { bid: record.bid, ask: record.ask });
    }
    Ok(crate::model::Tick::from_legs(
        timestamp,
        record.symbol,
        record.bid,
        record.ask,
        record.bid_volume.unwrap_or(Decimal::ZERO),
        record.ask_volume.unwrap_or(Decimal::ZERO),
    ))
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct IngestReport {
    pub records: usize,
    pub rejected: usize,
    pub duration_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("line-protocol write failed: {0}")]
    Store(#[from] crate::store::IlpWriteError),
}

/// Reads newline-delimited JSON tick records from `reader`, batches them
/// (1,000 records, or whenever the flush interval elapses, or at
/// end-of-stream), and flushes each batch via the Store's line-protocol
/// path. A validation error aborts only the offending record; a network
/// failure during flush aborts the whole stream and the records already
/// written are still reported.
#[instrument(skip(store, reader))]
pub async fn ingest_stream<R: AsyncRead + Unpin>(
    store: &Store,
    reader: R,
) -> Result<IngestReport, IngestError> {
    let started = Instant::now();
    let mut lines = BufReader::new(reader).lines();
    let mut batch = IlpBatch::new();
    let mut report = IngestReport::default();
    let mut last_flush = Instant::now();

    loop {
        let next_line = tokio::time::timeout(FLUSH_INTERVAL, lines.next_line()).await;
        let line = match next_line {
            Ok(Ok(Some(line))) => Some(line),
            Ok(Ok(None)) => None,
            Ok(Err(io_err)) => {
                warn!(error = %io_err, "ingest stream read error");
                None
            }
            Err(_timeout) => {
                if !batch.is_empty() {
                    flush(store, &mut batch, &mut report).await?;
                    last_flush = Instant::now();
                }
                continue;
            }
        };

        let Some(line) = line else {
            if !batch.is_empty() {
                flush(store, &mut batch, &mut report).await?;
            }
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<TickRecord>(&line).map_err(|e| e.to_string()).and_then(|r| {
            validate(r).map_err(|e| e.to_string())
        }) {
            Ok(tick) => batch.push(&tick),
            Err(reason) => {
                report.rejected += 1;
                warn!(reason = %reason, "rejected tick record");
            }
        }

        if batch.len() >= BATCH_SIZE || last_flush.elapsed() >= FLUSH_INTERVAL {
            flush(store, &mut batch, &mut report).await?;
            last_flush = Instant::now();
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}

async fn flush(store: &Store, batch: &mut IlpBatch, report: &mut IngestReport) -> Result<(), IngestError> {
    let written = store.exec_ingest(batch).await?;
    report.records += written;
    *batch = IlpBatch::new();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_symbol() {
        let record = TickRecord {
            timestamp: TimestampField::UnixMicros(1_700_000_000_000_000),
            symbol: "".into(),
            bid: Decimal::ONE,
            ask: Decimal::TWO,
            bid_volume: None,
            ask_volume: None,
        };
        assert!(matches!(validate(record), Err(ValidationError::EmptySymbol)));
    }

    #[test]
    fn rejects_crossed_quote() {
        let record = TickRecord {
            timestamp: TimestampField::UnixMicros(1_700_000_000_000_000),
            symbol: "EURUSD".into(),
            bid: Decimal::TWO,
            ask: Decimal::ONE,
            bid_volume: None,
            ask_volume: None,
        };
        assert!(matches!(validate(record), Err(ValidationError::InvalidQuote { .. })));
    }

    #[test]
    fn accepts_well_formed_record() {
        let record = TickRecord {
            timestamp: TimestampField::Rfc3339("2024-01-01T00:00:00Z".into()),
            symbol: "EURUSD".into(),
            bid: Decimal::ONE,
            ask: Decimal::TWO,
            bid_volume: Some(Decimal::ONE),
            ask_volume: Some(Decimal::ONE),
        };
        let tick = validate(record).expect("valid record");
        assert_eq!(tick.volume, Decimal::TWO);
    }
}
