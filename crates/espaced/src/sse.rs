//! SSE mode — serves the live-log relay.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use espace_core::SseConfig;
use espace_runner::ClusterInspector;
use espace_sse::SseState;

pub async fn run() -> anyhow::Result<()> {
    let cfg = SseConfig::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,espaced=debug,espace_sse=debug".parse().unwrap());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("SSE log relay starting");

    let kube = kube::Client::try_default()
        .await
        .context("creating the cluster client")?;
    let inspector = Arc::new(ClusterInspector::new(kube, cfg.etos_namespace.clone()));

    let shutdown = CancellationToken::new();
    let router = espace_sse::router(SseState::new(inspector, shutdown.child_token()));

    let address = format!("{}:{}", cfg.service_host, cfg.service_port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!(%address, "SSE relay server starting");

    // Cancelling the relay token makes every producer emit its shutdown
    // event and close, which in turn lets the server finish draining.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            crate::shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    info!("SSE log relay stopped");
    Ok(())
}
