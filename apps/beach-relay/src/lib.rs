//! Relay between HTTP callers and long-lived peer websocket connections.
//!
//! Peers connect on `/relay` and are tracked by the [`registry`]. Callers
//! originate typed requests through the [`dispatch`] glue; answers are
//! correlated back to them by the [`pending`] table.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod pending;
pub mod registry;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod websocket;

use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::state::AppState;

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = routes::router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}
