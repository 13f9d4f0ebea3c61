// src/store/ilp.rs — line-protocol (ILP) write path.
//
// Frame shape (spec §6):
//   market_data_v2,symbol=<S> bid=…,ask=…,price=…,spread=…,volume=… <ts_ns>

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::model::Tick;

#[derive(Debug, thiserror::Error)]
pub enum IlpWriteError {
    #[error("failed to connect to line-protocol endpoint {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line-protocol write failed after {written} records: {source}")]
    Write {
        written: usize,
        #[source]
        source: std::io::Error,
    },
}

/// A batch of ticks about to be flushed as one line-protocol write. Built up
/// by the Ingestor, one TCP connection per batch (spec §4.1/§4.2).
#[derive(Debug, Default, Clone)]
pub struct IlpBatch {
    lines: Vec<String>,
}

impl IlpBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn push(&mut self, tick: &Tick) {
        self.lines.push(encode_line(tick));
    }

    pub fn as_lines(&self) -> &[String] {
        &self.lines
    }
}

fn escape_symbol(symbol: &str) -> String {
    symbol.replace(' ', "\\ ").replace(',', "\\,")
}

fn fmt_decimal(d: Decimal) -> String {
    d.normalize().to_string()
}

pub fn encode_line(tick: &Tick) -> String {
    format!(
        "market_data_v2,symbol={} bid={},ask={},price={},spread={},volume={} {}",
        escape_symbol(&tick.symbol),
        fmt_decimal(tick.bid),
        fmt_decimal(tick.ask),
        fmt_decimal(tick.price),
        fmt_decimal(tick.spread),
        fmt_decimal(tick.volume),
        timestamp_ns(tick.timestamp),
    )
}

fn timestamp_ns(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or_else(|| ts.timestamp_micros() * 1_000)
}

/// Open one TCP connection, write every line in the batch, and flush. A
/// partial write leaves an indeterminate number of records committed on the
/// server side, so this never retries internally — the caller surfaces
/// `written` and decides what, if anything, to do next.
pub async fn write_batch(addr: &str, batch: &IlpBatch) -> Result<usize, IlpWriteError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|source| IlpWriteError::Connect { addr: addr.to_string(), source })?;

    let mut written = 0usize;
    for line in batch.as_lines() {
        let mut framed = line.clone();
        framed.push('\n');
        if let Err(source) = stream.write_all(framed.as_bytes()).await {
            return Err(IlpWriteError::Write { written, source });
        }
        written += 1;
    }
    stream
        .flush()
        .await
        .map_err(|source| IlpWriteError::Write { written, source })?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn encodes_canonical_line_shape() {
        let tick = Tick {
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            symbol: "EURUSD".into(),
            bid: dec!(1.1045),
            ask: dec!(1.1047),
            price: dec!(1.1046),
            spread: dec!(0.0002),
            bid_volume: dec!(100),
            ask_volume: dec!(50),
            volume: dec!(150),
        };
        let line = encode_line(&tick);
        assert!(line.starts_with("market_data_v2,symbol=EURUSD "));
        assert!(line.contains("bid=1.1045"));
        assert!(line.contains("price=1.1046"));
        assert!(line.ends_with(" 1700000000000000000"));
    }

    #[test]
    fn escapes_spaces_and_commas_in_symbol() {
        assert_eq!(escape_symbol("EUR USD"), "EUR\\ USD");
        assert_eq!(escape_symbol("EUR,USD"), "EUR\\,USD");
    }
}
