//! espace-api — HTTP surface of the execution-space provider.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/executionspace/start` | Check out execution spaces (background) |
//! | GET | `/executionspace/status?id=` | Checkout status with joined executors |
//! | POST | `/executionspace/stop` | Stop workloads and check executors in |
//! | POST | `/executionspace/v1alpha/executor/<backend>` | Start one executor synchronously |
//! | GET | `/executionspace/v1alpha/selftest/ping` | Liveness probe |
//!
//! Every business endpoint runs behind panic isolation and a request
//! timeout; the selftest probe runs bare.

pub mod middleware;
pub mod routes;

use std::time::Duration;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;

use espace_provider::Provider;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub provider: Provider,
    pub request_timeout: Duration,
}

/// Build the provider API router.
pub fn router(state: AppState) -> Router {
    let executor_route = format!(
        "/executionspace/v1alpha/executor/{}",
        state.provider.executor_name()
    );
    Router::new()
        .route("/executionspace/start", post(routes::start))
        .route("/executionspace/status", get(routes::status))
        .route("/executionspace/stop", post(routes::stop))
        .route(&executor_route, post(routes::executor_start))
        .layer(from_fn_with_state(state.clone(), middleware::request_timeout))
        .layer(from_fn(middleware::panic_recovery))
        .route("/executionspace/v1alpha/selftest/ping", get(routes::selftest))
        .with_state(state)
}
