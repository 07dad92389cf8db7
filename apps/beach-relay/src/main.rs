use anyhow::{Context, Result};
use beach_relay::cli::{self, Cli, Command};
use beach_relay::config::RelayConfig;
use beach_relay::state::AppState;
use beach_relay::telemetry;
use clap::Parser;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing()?;

    match Cli::parse().into_command() {
        Command::Serve(args) => run(RelayConfig::try_from(args)?).await,
        Command::Peer(args) => cli::run_peer(args).await,
    }
}

async fn run(config: RelayConfig) -> Result<()> {
    let metrics = telemetry::install_metrics()?;
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!(
        listen_addr = %config.listen_addr,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        keepalive_interval_secs = config.keepalive_interval.as_secs(),
        keepalive_timeout_secs = config.keepalive_timeout.as_secs(),
        fail_pending_on_disconnect = config.fail_pending_on_disconnect,
        "starting beach-relay"
    );

    let grace = config.shutdown_grace;
    let state = AppState::build(config, Some(metrics));
    let background = state.spawn_background();

    beach_relay::serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    for handle in background {
        handle.abort();
    }
    tokio::time::sleep(grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
