// src/config.rs — one configuration knob per external resource (spec §6).

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "forex-candle-server", about = "OHLC candle serving layer with lazy tick backfill")]
pub struct Config {
    /// Hostname of the time-series store (QuestDB).
    #[arg(long, env = "STORE_HOST", default_value = "127.0.0.1")]
    pub store_host: String,

    /// Postgres-wire SQL port exposed by the store.
    #[arg(long, env = "STORE_SQL_PORT", default_value_t = 8812)]
    pub store_sql_port: u16,

    /// Line-protocol (ILP) TCP ingestion port exposed by the store.
    #[arg(long, env = "STORE_ILP_PORT", default_value_t = 9009)]
    pub store_ilp_port: u16,

    /// Store database/user credentials.
    #[arg(long, env = "STORE_USER", default_value = "admin")]
    pub store_user: String,

    #[arg(long, env = "STORE_PASSWORD", default_value = "quest")]
    pub store_password: String,

    #[arg(long, env = "STORE_DATABASE", default_value = "qdb")]
    pub store_database: String,

    /// Path to the historical-tick downloader executable (spec §6).
    #[arg(long, env = "DOWNLOADER_PATH", default_value = "downloader")]
    pub downloader_path: String,

    /// Working directory the downloader subprocess is spawned in.
    #[arg(long, env = "FEEDS_DIR", default_value = "./feeds")]
    pub feeds_dir: String,

    /// Address the HTTP API binds to.
    #[arg(long, env = "HTTP_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub http_bind_addr: String,

    /// Default request timeout, in seconds (spec §5).
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Maximum pooled SQL connections.
    #[arg(long, env = "STORE_MAX_CONNECTIONS", default_value_t = 10)]
    pub store_max_connections: u32,
}

impl Config {
    pub fn sql_connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.store_user, self.store_password, self.store_host, self.store_sql_port, self.store_database
        )
    }

    pub fn ilp_address(&self) -> String {
        format!("{}:{}", self.store_host, self.store_ilp_port)
    }
}
