//! espaced — the execution-space daemon.
//!
//! Single binary that can run in two modes:
//!
//! - **provider** — the execution-space provider API (checkout, status,
//!   stop, executor start)
//! - **sse** — the live-log SSE relay
//!
//! # Usage
//!
//! ```text
//! espaced provider
//! espaced sse
//! ```
//!
//! All configuration comes from environment variables; see
//! `espace_core::config`.

mod provider;
mod sse;

use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "espaced", about = "ETOS execution space daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the execution space provider API.
    Provider,
    /// Run the live-log SSE relay.
    Sse,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Provider => provider::run().await,
        Command::Sse => sse::run().await,
    }
}

/// Resolves on SIGINT or SIGTERM, after which a second signal hard-exits
/// the process.
pub(crate) async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    info!("shutdown signal received");

    tokio::spawn(async {
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        info!("second shutdown signal received, exiting immediately");
        std::process::exit(1);
    });
}
