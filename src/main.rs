#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tether
//!
//! Reverse-connected remote agent. The agent dials out to the controller and
//! keeps one WebSocket control connection open; file transfers, screenshots
//! and terminals ride on short-lived HTTP exchanges the controller pairs with
//! control requests by id.
//!
//! ## Subcommands
//!
//! - `tether controller`: run the HTTP/WS controller
//! - `tether agent`: connect to a controller and serve its requests
//!
//! ## Controller API surface
//!
//! | Method | Path                              | Auth     | Description                     |
//! |--------|-----------------------------------|----------|---------------------------------|
//! | GET    | `/api/device/register`            | `?token` | Agent control socket            |
//! | PUT    | `/api/bridge/push`                | bridge id| Agent upload into a bridge      |
//! | GET    | `/api/bridge/pull`                | bridge id| Agent download from a bridge    |
//! | GET    | `/api/devices`                    | Bearer   | Connected agents                |
//! | POST   | `/api/device/{id}/files/list`     | Bearer   | Directory listing               |
//! | POST   | `/api/device/{id}/files/remove`   | Bearer   | Recursive removal               |
//! | POST   | `/api/device/{id}/files/get`      | Bearer   | File, byte range or ZIP archive |
//! | POST   | `/api/device/{id}/files/text`     | Bearer   | Small text file with encoding   |
//! | PUT    | `/api/device/{id}/files/upload`   | Bearer   | Stream a file onto the agent    |
//! | GET    | `/api/device/{id}/screenshot`     | Bearer   | Screen capture                  |
//! | GET    | `/api/device/{id}/terminal`       | `?token` | Terminal WebSocket relay        |

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use tether::config::Config;
use tether::controller::{self, ControllerState};

/// Reverse-connected remote agent.
#[derive(Parser)]
#[command(name = "tether", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller.
    Controller {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the agent.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Controller { config } => run_controller(load(config.as_deref())).await,
        Commands::Agent { config } => run_agent(load(config.as_deref())).await,
    }
}

/// Load config and initialize tracing from it.
fn load(path: Option<&str>) -> Config {
    let config = match Config::load(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("tether: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    if config.auth.token == "change-me" {
        warn!("Using default token, set TETHER_TOKEN or update config");
    }
    config
}

async fn run_controller(config: Config) {
    info!("tether controller v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.controller.listen);

    let state = ControllerState::new(Arc::new(config));
    let app = controller::router(state.clone()).layer(TraceLayer::new_for_http());

    let listener = match TcpListener::bind(&state.config.controller.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}: {e}", state.config.controller.listen);
            std::process::exit(1);
        }
    };
    info!("Controller ready");

    let sweep_task = state.spawn_heartbeat_sweep();

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {e}");
    }

    info!("Shutting down...");
    sweep_task.abort();
    state.drain_all().await;
    info!("Goodbye");
}

async fn run_agent(config: Config) {
    info!("tether agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Device id: {}", config.agent.device_id);

    let agent = tether::agent::spawn(Arc::new(config));
    shutdown_signal().await;

    info!("Shutting down...");
    agent.shutdown().await;
    info!("Goodbye");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
