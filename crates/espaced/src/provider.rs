//! Provider mode — serves the execution-space provider API.
//!
//! In this mode, the daemon:
//! 1. Connects to the shared state store and the cluster
//! 2. Optionally wires the user-log broker publisher into tracing
//! 3. Serves the provider API over HTTP
//! 4. On shutdown, drains outstanding checkouts, check-ins and cleanups

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use espace_api::AppState;
use espace_broker::{Publisher, PublisherConfig, UserLogLayer};
use espace_core::ProviderConfig;
use espace_events::EventRepositoryClient;
use espace_provider::Provider;
use espace_runner::KubernetesExecutor;
use espace_state::StateStore;

pub async fn run() -> anyhow::Result<()> {
    let cfg = ProviderConfig::from_env()?;
    let shutdown = CancellationToken::new();

    // ── Logging, with user-log mirroring when a broker is configured ──
    let publisher = match (&cfg.rabbitmq_url, &cfg.rabbitmq_exchange) {
        (Some(url), Some(exchange)) => Some(Arc::new(Publisher::new(PublisherConfig {
            url: url.clone(),
            exchange: exchange.clone(),
        }))),
        _ => None,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,espaced=debug,espace_provider=debug".parse().unwrap());
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    let mut forwarder = None;
    if let Some(publisher) = publisher.clone() {
        let (layer, mut records) = UserLogLayer::new();
        registry.with(layer).init();

        let publish_token = shutdown.child_token();
        forwarder = Some(tokio::spawn(async move {
            while let Some(record) = records.recv().await {
                if let Err(e) = publisher
                    .publish(&publish_token, &record.routing_key, &record.body)
                    .await
                {
                    warn!(error = %e, "dropping user log record");
                }
            }
        }));
    } else {
        registry.init();
    }

    info!("execution space provider starting");
    match std::env::var("OTEL_EXPORTER_OTLP_TRACES_ENDPOINT") {
        Ok(collector) => info!(%collector, "OpenTelemetry collector configured"),
        Err(_) => info!("no OpenTelemetry collector is set, traces stay process-local"),
    }

    // ── Subsystems ───────────────────────────────────────────────
    let store = StateStore::connect(&cfg.database_endpoint, "execution-space")
        .await
        .context("connecting to the state store")?;
    info!(endpoint = %cfg.database_endpoint, "state store connected");

    let kube = kube::Client::try_default()
        .await
        .context("creating the cluster client")?;
    let executor = Arc::new(KubernetesExecutor::new(kube, cfg.etos_namespace.clone()));
    let events = Arc::new(EventRepositoryClient::new(cfg.event_repository_url.clone()));

    let provider = Provider::new(
        store,
        executor,
        events,
        &cfg.provider_hostname,
        cfg.execution_space_wait_timeout,
        shutdown.child_token(),
    );
    info!(namespace = %cfg.etos_namespace, "provider initialized");

    // ── API server ───────────────────────────────────────────────
    let router = espace_api::router(AppState {
        provider: provider.clone(),
        request_timeout: cfg.request_timeout,
    });
    let address = format!("{}:{}", cfg.service_host, cfg.service_port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!(%address, "provider API server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(crate::shutdown_signal())
        .await?;

    // ── Drain ────────────────────────────────────────────────────
    info!("waiting for checkout and checkin jobs to complete");
    if tokio::time::timeout(cfg.request_timeout, provider.close())
        .await
        .is_err()
    {
        warn!("shutdown timeout expired before all jobs finished");
    }
    shutdown.cancel();
    if let Some(publisher) = publisher {
        publisher.close().await;
    }
    if let Some(forwarder) = forwarder {
        forwarder.abort();
        let _ = forwarder.await;
    }

    info!("execution space provider stopped");
    Ok(())
}
