//! Agentdeck Server
//!
//! Single-tenant gateway between a browser UI and the locally installed
//! agent CLI. Discovers projects and their conversation logs, spawns the
//! agent with an isolated environment, and streams its output over
//! WebSocket while watching the project tree.

mod config;
mod env_store;
mod error;
mod http;
mod logging;
mod projects;
mod sandbox;
mod sessions;
mod state;
mod watcher;
mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use crate::config::{AgentPaths, Cli};
use crate::logging::init_logging;
use crate::state::Gateway;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Env file first so PORT and friends are visible to everything below
    match &cli.env {
        Some(path) => {
            config::load_env_file(path)?;
        }
        None => config::load_default_env_file(),
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    let _log_guard = init_logging()?;

    let paths = AgentPaths::resolve(cli.data_dir.as_deref());
    paths.ensure()?;

    info!(
        component = "server",
        event = "server.starting",
        pid = std::process::id(),
        claude_dir = %paths.claude_dir().display(),
        "Starting agentdeck server..."
    );

    let state = Arc::new(Gateway::new(
        paths.projects_root(),
        paths.sidecar(),
        paths.mcp_config(),
    ));

    // Watcher: project-tree changes fan out to every attached socket
    let watcher_registry = state.projects.clone();
    let watcher_clients = state.watch_clients.clone();
    tokio::spawn(async move {
        if let Err(e) = watcher::run_watcher(watcher_registry, watcher_clients).await {
            warn!(
                component = "watcher",
                event = "watcher.stopped_with_error",
                error = %e,
                "Filesystem watcher failed"
            );
        }
    });

    let app = http::router(state.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], cli.resolved_port()));
    info!(
        component = "server",
        event = "server.listening",
        bind_address = %addr,
        "Listening for connections"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // SIGTERM every live child and wait for natural exits
    state.shutdown(SHUTDOWN_GRACE).await;
    info!(
        component = "server",
        event = "server.stopped",
        "Shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(
                    component = "server",
                    event = "server.signal_install_failed",
                    error = %e,
                    "Failed to install SIGTERM handler"
                );
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(
        component = "server",
        event = "server.shutdown_signal",
        "Shutdown signal received"
    );
}
