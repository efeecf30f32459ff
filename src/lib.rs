#![doc = include_str!("../Readme.md")]

pub mod app;
pub mod config;
pub mod database;
pub mod federation;
pub mod mining;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod task_monitor;
pub mod utils;

use thiserror::Error;
use tracing::info;

use crate::app::App;
use crate::config::Config;
use crate::shutdown::Shutdown;
use crate::task_monitor::TaskMonitor;

/// Top-level failure classes, mapped onto process exit codes by `main`.
#[derive(Debug, Error)]
pub enum RunError {
    /// Persistence unavailable, bad config, port bind failure. Exit 1.
    #[error("initialization failed: {0}")]
    Init(#[source] anyhow::Error),
    /// The server loop died after a successful start. Exit 2.
    #[error("unrecoverable internal state: {0}")]
    Internal(#[source] anyhow::Error),
}

/// Composition root: connect, start the background tasks, serve until
/// shutdown.
pub async fn run(config: Config, shutdown: Shutdown) -> Result<(), RunError> {
    let (app, queues) = App::new(config.clone()).await.map_err(RunError::Init)?;

    TaskMonitor::init(app.clone(), queues, shutdown.clone())
        .await
        .map_err(RunError::Init)?;

    let listener = tokio::net::TcpListener::bind(config.server.address)
        .await
        .map_err(|error| RunError::Init(error.into()))?;
    info!("Will listen on {}", config.server.address);

    server::bind_from_listener(app, listener, shutdown)
        .await
        .map_err(RunError::Internal)?;

    info!("server stopped cleanly");
    Ok(())
}
