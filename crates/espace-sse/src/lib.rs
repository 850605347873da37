//! espace-sse — live-log relay for running test runners.
//!
//! Each connected client gets a producer task that polls the runner's
//! in-cluster log endpoint once a second from the client's counter,
//! injects a `ping` every fifteen seconds of the stream's life, and turns
//! runner completion or process shutdown into a final `shutdown` event.
//! Two wire variants share that core: the v1 stream relays the runner's
//! own numbered events, the legacy stream numbers raw log lines itself.

mod event;
mod relay;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use espace_runner::RunnerInspector;

pub use event::LogEvent;

/// Shared state for the relay handlers.
#[derive(Clone)]
pub struct SseState {
    pub inspector: Arc<dyn RunnerInspector>,
    pub client: reqwest::Client,
    /// Application-level shutdown, independent from the HTTP server's own
    /// drain: cancelling it makes every producer emit `shutdown` and end
    /// its stream.
    pub shutdown: CancellationToken,
}

impl SseState {
    pub fn new(inspector: Arc<dyn RunnerInspector>, shutdown: CancellationToken) -> Self {
        Self {
            inspector,
            client: reqwest::Client::new(),
            shutdown,
        }
    }
}

/// Build the SSE relay router.
pub fn router(state: SseState) -> Router {
    Router::new()
        .route("/sse/v1/selftest/ping", get(relay::selftest))
        .route("/sse/v1/events/{identifier}", get(relay::stream_events))
        .route("/sse/v1/event/{identifier}/{id}", get(relay::get_event))
        .route("/v1alpha/logs/{identifier}", get(relay::stream_logs))
        .with_state(state)
}
