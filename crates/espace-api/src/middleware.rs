//! Cross-cutting middleware: panic isolation and request timeouts.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::error;

use crate::AppState;

/// Bound every request by the configured timeout. Handlers that manage
/// their own deadline (executor start) keep running on the in-flight
/// tracker after the 408 goes out.
pub async fn request_timeout(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match tokio::time::timeout(state.request_timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => (StatusCode::REQUEST_TIMEOUT, "request timed out").into_response(),
    }
}

/// Catch panics from handlers, log them with the caller's correlation id
/// and answer with an opaque 500 referencing that id.
pub async fn panic_recovery(request: Request, next: Next) -> Response {
    let identifier = request
        .headers()
        .get("X-Etos-Id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                identifier = %identifier,
                panic = %reason,
                backtrace = %std::backtrace::Backtrace::force_capture(),
                "recovered from panic in request handler"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("unknown error: contact server admin with id '{identifier}'"),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::middleware::{from_fn, from_fn_with_state};
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use espace_provider::Provider;
    use espace_state::StateStore;
    use espace_testing::{FakeEventRepository, FakeExecutor};

    use super::*;

    fn test_state(timeout: Duration) -> AppState {
        AppState {
            provider: Provider::new(
                StateStore::in_memory("execution-space"),
                Arc::new(FakeExecutor::new()),
                Arc::new(FakeEventRepository::new()),
                "http://provider",
                Duration::from_secs(60),
                CancellationToken::new(),
            ),
            request_timeout: timeout,
        }
    }

    async fn boom_handler() -> axum::response::Response {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn panics_become_opaque_500s() {
        let app = Router::new()
            .route("/boom", get(boom_handler))
            .layer(from_fn(panic_recovery));

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/boom")
                    .header("X-Etos-Id", "abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8_lossy(&body);
        assert!(body.contains("abc"));
        assert!(!body.contains("handler exploded"));
    }

    #[tokio::test]
    async fn slow_handlers_hit_the_request_timeout() {
        let state = test_state(Duration::from_millis(50));
        let app = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    StatusCode::NO_CONTENT
                }),
            )
            .layer(from_fn_with_state(state, request_timeout));

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/slow")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
