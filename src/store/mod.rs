// src/store/mod.rs — connection-pooled SQL access plus line-protocol append
// access to the time-series store. Nothing else (spec §4.1).

mod ilp;

pub use ilp::{IlpBatch, IlpWriteError};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{info, instrument};

use crate::config::Config;

#[derive(Debug, Clone, serde::Serialize)]
pub struct TableStats {
    pub row_count: i64,
    pub min_ts: Option<DateTime<Utc>>,
    pub max_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub active: u32,
    pub idle: u32,
    pub max: u32,
    /// Rolling window of recent acquire-wait times, most recent last.
    pub recent_wait_ms: Vec<u64>,
}

/// A bound SQL parameter. QuestDB's Postgres-wire endpoint and `rust_decimal`
/// /`chrono` don't type-erase cleanly through `dyn Encode`, so callers build
/// an explicit list instead of passing trait objects (Planner and
/// DataManager are the only two callers, and both already know their
/// parameter types statically).
#[derive(Debug, Clone)]
pub enum SqlParam {
    Text(String),
    Timestamp(DateTime<Utc>),
    Int(i64),
}

impl From<&str> for SqlParam {
    fn from(s: &str) -> Self {
        SqlParam::Text(s.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(s: String) -> Self {
        SqlParam::Text(s)
    }
}

impl From<DateTime<Utc>> for SqlParam {
    fn from(ts: DateTime<Utc>) -> Self {
        SqlParam::Timestamp(ts)
    }
}

impl From<i64> for SqlParam {
    fn from(n: i64) -> Self {
        SqlParam::Int(n)
    }
}

/// Thin wrapper over QuestDB's two write paths and one read path. Owns the
/// pool and the ILP TCP target; exposes nothing the spec doesn't ask for.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    ilp_addr: String,
    max_connections: u32,
    wait_samples: Arc<Mutex<VecDeque<Duration>>>,
}

impl Store {
    pub async fn connect(config: &Config) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.store_max_connections)
            .connect(&config.sql_connection_string())
            .await?;
        info!(host = %config.store_host, port = config.store_sql_port, "connected to store SQL endpoint");
        Ok(Self {
            pool,
            ilp_addr: config.ilp_address(),
            max_connections: config.store_max_connections,
            wait_samples: Arc::new(Mutex::new(VecDeque::with_capacity(64))),
        })
    }

    #[cfg(test)]
    pub fn from_pool(pool: PgPool, ilp_addr: String, max_connections: u32) -> Self {
        Self {
            pool,
            ilp_addr,
            max_connections,
            wait_samples: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn record_wait(&self, waited: Duration) {
        let mut samples = self.wait_samples.lock();
        if samples.len() >= 64 {
            samples.pop_front();
        }
        samples.push_back(waited);
    }

    fn bind_params<'q>(
        mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
        params: &'q [SqlParam],
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        for param in params {
            query = match param {
                SqlParam::Text(s) => query.bind(s),
                SqlParam::Timestamp(ts) => query.bind(ts),
                SqlParam::Int(i) => query.bind(i),
            };
        }
        query
    }

    /// Pooled read path. Supports concurrent calls: each call checks out its
    /// own connection from `sqlx::PgPool`.
    #[instrument(skip(self, params))]
    pub async fn query(
        &self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<sqlx::postgres::PgRow>, sqlx::Error> {
        let start = Instant::now();
        let query = Self::bind_params(sqlx::query(sql), params);
        let rows = query.fetch_all(&self.pool).await?;
        self.record_wait(start.elapsed());
        Ok(rows)
    }

    #[instrument(skip(self, params))]
    pub async fn query_row(
        &self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Option<sqlx::postgres::PgRow>, sqlx::Error> {
        let start = Instant::now();
        let query = Self::bind_params(sqlx::query(sql), params);
        let row = query.fetch_optional(&self.pool).await?;
        self.record_wait(start.elapsed());
        Ok(row)
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT count(*) as n FROM tables() WHERE table_name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n").unwrap_or(0);
        Ok(n > 0)
    }

    #[instrument(skip(self))]
    pub async fn table_stats(&self, name: &str) -> Result<TableStats, sqlx::Error> {
        // `name` is always one of our own fixed table-name constants, never
        // user input, so string interpolation here is not an injection seam.
        let query = format!(
            "SELECT count(*) as row_count, min(timestamp) as min_ts, max(timestamp) as max_ts FROM {name}"
        );
        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        Ok(TableStats {
            row_count: row.try_get("row_count").unwrap_or(0),
            min_ts: row.try_get("min_ts").ok(),
            max_ts: row.try_get("max_ts").ok(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        let samples = self.wait_samples.lock();
        PoolStats {
            active: self.pool.size().saturating_sub(self.pool.num_idle() as u32),
            idle: self.pool.num_idle() as u32,
            max: self.max_connections,
            recent_wait_ms: samples.iter().map(|d| d.as_millis() as u64).collect(),
        }
    }

    /// Write path via line protocol: one TCP connection per batch, flushed
    /// on completion. Failures are fatal per batch — the caller must not
    /// retry blindly, since partial batches may already be committed.
    #[instrument(skip(self, batch))]
    pub async fn exec_ingest(&self, batch: &IlpBatch) -> Result<usize, IlpWriteError> {
        ilp::write_batch(&self.ilp_addr, batch).await
    }
}
