//! Provider API handlers.

use std::collections::HashMap;
use std::str::FromStr;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use packageurl::PackageUrl;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use espace_core::Checkout;
use espace_provider::{CheckoutRequest, ProviderError, StartError};

use crate::AppState;

/// Body of the start endpoint. Callers send more fields than the provider
/// reads; everything unrecognized is ignored.
#[derive(Debug, Deserialize)]
struct StartRequest {
    minimum_amount: usize,
    #[serde(default)]
    maximum_amount: usize,
    test_runner: String,
    #[serde(default)]
    environment: HashMap<String, String>,
    /// Package-URL of the artifact under test.
    identity: String,
    #[serde(default)]
    context: Option<Uuid>,
    #[serde(default)]
    dataset: Dataset,
}

#[derive(Debug, Default, Deserialize)]
struct Dataset {
    #[serde(default, rename = "ETR_BRANCH")]
    etr_branch: String,
    #[serde(default, rename = "ETR_REPO")]
    etr_repo: String,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ExecutorStartRequest {
    id: Uuid,
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

fn correlation_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Etos-Id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Trace-context headers to propagate into executor callbacks.
fn trace_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut propagated = HashMap::new();
    for name in ["traceparent", "tracestate"] {
        if let Some(value) = headers.get(name).and_then(|value| value.to_str().ok()) {
            propagated.insert(name.to_string(), value.to_string());
        }
    }
    propagated
}

/// POST /executionspace/start — fire-and-forget checkout.
pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(identifier) = correlation_id(&headers) else {
        return bad_request("missing required X-Etos-Id header".to_string());
    };
    let mut request: StartRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return bad_request(format!("unable to decode post body: {e}")),
    };
    if let Err(e) = PackageUrl::from_str(&request.identity) {
        return bad_request(format!("start input could not be verified: {e}"));
    }
    if request.maximum_amount == 0 {
        request.maximum_amount = request.minimum_amount;
    }
    if request.maximum_amount == 0 {
        return bad_request("minimum_amount must be at least 1".to_string());
    }
    if !request.dataset.etr_branch.is_empty() {
        request
            .environment
            .insert("ETR_BRANCH".to_string(), request.dataset.etr_branch.clone());
    }
    if !request.dataset.etr_repo.is_empty() {
        request.environment.insert(
            "ETR_REPOSITORY".to_string(),
            request.dataset.etr_repo.clone(),
        );
    }

    let checkout_id = Uuid::new_v4();
    debug!(
        identifier = %identifier,
        checkout_id = %checkout_id,
        test_runner = %request.test_runner,
        maximum_amount = request.maximum_amount,
        context = ?request.context,
        "checking out execution spaces"
    );
    state.provider.checkout(CheckoutRequest {
        amount: request.maximum_amount,
        test_runner: request.test_runner,
        environment: request.environment,
        checkout_id,
        identifier,
        trace_headers: trace_headers(&headers),
    });
    (StatusCode::OK, Json(StartResponse { id: checkout_id })).into_response()
}

/// GET /executionspace/status?id= — pure read of a checkout.
pub async fn status(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> Response {
    let id = match Uuid::parse_str(&params.id) {
        Ok(id) => id,
        Err(e) => {
            return bad_request(format!("error parsing id parameter in status request: {e}"));
        }
    };
    match state.provider.status(id).await {
        Ok(checkout) => (StatusCode::OK, Json(checkout)).into_response(),
        Err(e) => {
            error!(checkout_id = %id, error = %e, "failed to retrieve execution space status");
            let code = match &e {
                ProviderError::State(espace_state::StateError::NotFound(_)) => {
                    StatusCode::NOT_FOUND
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (code, Json(Checkout::failed(id, e.to_string()))).into_response()
        }
    }
}

/// POST /executionspace/stop — stop workloads and check their specs in.
pub async fn stop(State(state): State<AppState>, body: Bytes) -> Response {
    let executors: Vec<espace_core::ExecutorSpec> = match serde_json::from_slice(&body) {
        Ok(executors) => executors,
        Err(e) => return bad_request(format!("unable to decode post body: {e}")),
    };
    match state.provider.stop_executors(&executors).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!(error = %e, "failed to stop executors");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// POST /executionspace/v1alpha/executor/<backend> — start one executor and
/// wait for it to verifiably run.
pub async fn executor_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let identifier = correlation_id(&headers).unwrap_or_default();
    let request: ExecutorStartRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return bad_request("could not read ID from post body".to_string()),
    };

    // The flow runs on the provider's tracker: a disconnecting client
    // abandons this await, not the workload cleanup.
    match state
        .provider
        .spawn_start_executor(request.id, identifier)
        .await
    {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e @ StartError::Deadline(_))) => {
            (StatusCode::REQUEST_TIMEOUT, e.to_string()).into_response()
        }
        Ok(Err(e @ StartError::Upstream(_))) => {
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Ok(Err(e @ StartError::NotStarted(_))) => bad_request(e.to_string()),
        Err(e) => {
            error!(error = %e, "executor start task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "executor start task failed".to_string(),
            )
                .into_response()
        }
    }
}

/// GET /executionspace/v1alpha/selftest/ping.
pub async fn selftest() -> StatusCode {
    StatusCode::NO_CONTENT
}
