// src/fetcher.rs — abstracts "run the external tick downloader for a gap"
// behind a trait so the DataManager's state machine can be exercised without
// a real subprocess in tests (spec §4.5 step 6, design note §9).

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::ingestor::{self, IngestReport};
use crate::store::Store;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("downloader spawn failed: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("downloader exited with status {status}: {stderr}")]
    NonZeroExit { status: i32, stderr: String },
    #[error("ingest of downloader output failed: {0}")]
    Ingest(#[from] ingestor::IngestError),
    #[error("fetch cancelled")]
    Cancelled,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches ticks for `symbol` covering `[gap_start, gap_end]` and pushes
    /// them into `store` via the Ingestor, returning how many were written.
    /// `cancel` is observed for the whole duration of the fetch; a cancelled
    /// token must terminate any subprocess the implementation spawned.
    async fn fetch(
        &self,
        store: &Store,
        symbol: &str,
        gap_start: NaiveDate,
        gap_end: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, FetchError>;
}

/// Spawns the configured downloader binary as a subprocess with argv
/// `(symbol, gapStart.date, gapEnd.date)`, cwd set to the feeds directory,
/// and ingests its stdout as newline-delimited JSON tick records.
pub struct SubprocessFetcher {
    downloader_path: String,
    feeds_dir: String,
}

impl SubprocessFetcher {
    pub fn new(downloader_path: impl Into<String>, feeds_dir: impl Into<String>) -> Self {
        Self { downloader_path: downloader_path.into(), feeds_dir: feeds_dir.into() }
    }
}

#[async_trait]
impl Fetcher for SubprocessFetcher {
    #[instrument(skip(self, store, cancel))]
    async fn fetch(
        &self,
        store: &Store,
        symbol: &str,
        gap_start: NaiveDate,
        gap_end: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, FetchError> {
        let mut child = Command::new(&self.downloader_path)
            .arg(symbol)
            .arg(gap_start.format("%Y-%m-%d").to_string())
            .arg(gap_end.format("%Y-%m-%d").to_string())
            .current_dir(&self.feeds_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(FetchError::Spawn)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(symbol, "fetch cancelled, killing downloader subprocess");
                let _ = child.kill().await;
                Err(FetchError::Cancelled)
            }
            result = run_to_completion(&mut child, store) => {
                let report = result?;
                info!(symbol, records = report.records, rejected = report.rejected, "downloader fetch complete");
                Ok(report)
            }
        }
    }
}

/// Streams the child's stdout through the Ingestor, then waits for exit and
/// surfaces stderr on a non-zero status. Kept as a standalone future so it
/// can be raced against cancellation without `wait_with_output`'s
/// by-value `Child` consumption.
async fn run_to_completion(child: &mut Child, store: &Store) -> Result<IngestReport, FetchError> {
    let stdout = child.stdout.take().expect("piped stdout");
    let report = ingestor::ingest_stream(store, stdout).await?;

    let status = child.wait().await.map_err(FetchError::Spawn)?;
    if !status.success() {
        let mut stderr_buf = Vec::new();
        if let Some(mut stderr) = child.stderr.take() {
            use tokio::io::AsyncReadExt;
            let _ = stderr.read_to_end(&mut stderr_buf).await;
        }
        let stderr = String::from_utf8_lossy(&stderr_buf).trim().to_string();
        return Err(FetchError::NonZeroExit { status: status.code().unwrap_or(-1), stderr });
    }
    Ok(report)
}

/// Test/embedding double: feeds a pre-built stream through the same
/// ingest path without spawning a process.
pub struct InProcessFetcher<F> {
    source: F,
}

impl<F> InProcessFetcher<F>
where
    F: Fn(&str, NaiveDate, NaiveDate) -> Box<dyn AsyncRead + Send + Unpin> + Send + Sync,
{
    pub fn new(source: F) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<F> Fetcher for InProcessFetcher<F>
where
    F: Fn(&str, NaiveDate, NaiveDate) -> Box<dyn AsyncRead + Send + Unpin> + Send + Sync,
{
    async fn fetch(
        &self,
        store: &Store,
        symbol: &str,
        gap_start: NaiveDate,
        gap_end: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let reader = (self.source)(symbol, gap_start, gap_end);
        Ok(ingestor::ingest_stream(store, reader).await?)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, Instant};

    /// A pool that never dials out; fine here since a cancelled fetch never
    /// reaches a real query (the downloader emits nothing on stdout).
    fn lazy_store() -> Store {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/questdb")
            .expect("lazy pool construction performs no I/O");
        Store::from_pool(pool, "127.0.0.1:9009".to_string(), 1)
    }

    #[tokio::test]
    async fn cancelling_mid_fetch_kills_the_subprocess() {
        let feeds_dir = tempfile::tempdir().unwrap();
        let script_path = feeds_dir.path().join("slow_downloader.sh");
        std::fs::write(&script_path, "#!/bin/sh\nsleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms).unwrap();

        let fetcher = SubprocessFetcher::new(
            script_path.to_string_lossy().to_string(),
            feeds_dir.path().to_string_lossy().to_string(),
        );
        let store = lazy_store();
        let cancel = CancellationToken::new();

        let cancel_after_start = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_after_start.cancel();
        });

        let start = Instant::now();
        let result = fetcher
            .fetch(
                &store,
                "EURUSD",
                chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                chrono::NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "cancellation should cut the 30s sleep short almost immediately"
        );
    }
}
