//! forex-candle-server binary entry point: parses configuration, connects
//! to the store, wires the HTTP API, and serves until shutdown.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use forex_candle_server::api::{self, AppState};
use forex_candle_server::data_manager::DataManager;
use forex_candle_server::fetcher::SubprocessFetcher;
use forex_candle_server::planner::Planner;
use forex_candle_server::{Config, Store};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("forex_candle_server=debug".parse().unwrap()),
        )
        .init();

    let config = Config::parse();
    info!(bind = %config.http_bind_addr, store = %config.store_host, "starting forex-candle-server");

    let store = Store::connect(&config).await?;
    let fetcher = Arc::new(SubprocessFetcher::new(config.downloader_path.clone(), config.feeds_dir.clone()));
    let data_manager = DataManager::new(store.clone(), fetcher);
    let planner = Planner::new(store.clone());

    let state = AppState::new(store, planner, data_manager, Default::default());
    let data_manager_for_shutdown = state.data_manager.clone();
    let app = api::router(state, &config);

    let listener = tokio::net::TcpListener::bind(&config.http_bind_addr).await?;
    info!(addr = %config.http_bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Kill any downloader subprocess still running rather than orphaning it
    // once this process exits.
    data_manager_for_shutdown.cancel_all();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining in-flight requests");
}
