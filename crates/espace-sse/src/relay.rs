//! Relay handlers and the per-client producer loop.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::event::LogEvent;
use crate::SseState;

/// How often the runner's log endpoint is polled.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How often a synthetic ping is injected.
const PING_INTERVAL: Duration = Duration::from_secs(15);

/// GET /sse/v1/selftest/ping.
pub async fn selftest() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// GET /sse/v1/events/{identifier} — stream runner events.
pub async fn stream_events(
    State(state): State<SseState>,
    Path(identifier): Path<String>,
    headers: HeaderMap,
) -> Response {
    if state.inspector.is_finished(&identifier).await {
        return StatusCode::NOT_FOUND.into_response();
    }
    let counter = match parse_last_event_id(&headers) {
        Ok(counter) => counter,
        Err(()) => {
            error!(%identifier, "Last-Event-ID header is not parsable");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    let url = match runner_url(&state, &identifier, "v1/log").await {
        Ok(url) => url,
        Err(e) => {
            info!(%identifier, error = %e, "runner has no log listener yet");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    info!(%identifier, "client connected to SSE");
    let (sender, receiver) = mpsc::channel(64);
    tokio::spawn(subscribe(state.clone(), sender, identifier, url, counter));
    sse_response(receiver)
}

/// GET /sse/v1/event/{identifier}/{id} — a single runner event.
pub async fn get_event(
    State(state): State<SseState>,
    Path((identifier, id)): Path<(String, u64)>,
) -> Response {
    if state.inspector.is_finished(&identifier).await {
        return StatusCode::NOT_FOUND.into_response();
    }
    let url = match runner_url(&state, &identifier, "v1/log").await {
        Ok(url) => url,
        Err(e) => {
            info!(%identifier, error = %e, "runner has no log listener yet");
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    match fetch_single(&state.client, &url, id).await {
        Ok(Some(event)) => (
            [(header::CONTENT_TYPE, "text/event-stream")],
            event.to_frame(),
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(%identifier, id, error = %e, "could not fetch event from runner");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /v1alpha/logs/{identifier} — legacy stream over raw log lines.
pub async fn stream_logs(
    State(state): State<SseState>,
    Path(identifier): Path<String>,
    headers: HeaderMap,
) -> Response {
    if state.inspector.is_finished(&identifier).await {
        return StatusCode::NOT_FOUND.into_response();
    }
    // The old clients sometimes send garbage here; keep the stream going.
    let counter = match parse_last_event_id(&headers) {
        Ok(counter) => counter,
        Err(()) => {
            error!(%identifier, "Last-Event-ID header is not parsable");
            1
        }
    };
    let url = match runner_url(&state, &identifier, "log").await {
        Ok(url) => url,
        Err(e) => {
            info!(%identifier, error = %e, "runner has no log listener yet");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    info!(%identifier, "client connected to legacy SSE");
    let (sender, receiver) = mpsc::channel(64);
    tokio::spawn(subscribe_legacy(
        state.clone(),
        sender,
        identifier,
        url,
        counter,
    ));
    sse_response(receiver)
}

fn sse_response(receiver: mpsc::Receiver<LogEvent>) -> Response {
    let stream =
        ReceiverStream::new(receiver).map(|event| Ok::<_, Infallible>(event.into_sse()));
    Sse::new(stream).into_response()
}

/// Parse `Last-Event-ID`, defaulting to 1 when absent.
fn parse_last_event_id(headers: &HeaderMap) -> Result<u64, ()> {
    match headers.get("Last-Event-ID") {
        None => Ok(1),
        Some(value) => value
            .to_str()
            .map_err(|_| ())?
            .trim()
            .parse()
            .map_err(|_| ()),
    }
}

async fn runner_url(
    state: &SseState,
    identifier: &str,
    path: &str,
) -> Result<String, espace_runner::ExecutorError> {
    let ip = state.inspector.log_listener_ip(identifier).await?;
    Ok(format!("http://{ip}:8000/{path}"))
}

/// Producer for the v1 stream: relay the runner's own numbered events from
/// the client's counter onward.
async fn subscribe(
    state: SseState,
    sender: mpsc::Sender<LogEvent>,
    identifier: String,
    url: String,
    mut counter: u64,
) {
    let mut poll = interval_at(Instant::now() + POLL_INTERVAL, POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sender.send(LogEvent::shutdown("service shutting down")).await;
                return;
            }
            _ = ping.tick() => {
                if sender.send(LogEvent::ping()).await.is_err() {
                    debug!(%identifier, "client lost, closing subscriber");
                    return;
                }
            }
            _ = poll.tick() => {
                match fetch_events(&state.client, &url, counter).await {
                    Ok(events) => {
                        for event in events {
                            counter += 1;
                            if sender.send(event).await.is_err() {
                                debug!(%identifier, "client lost, closing subscriber");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        // Completion is checked on the relay's own client,
                        // never the request: cluster-side throttling must not
                        // tear down this stream.
                        if state.inspector.is_finished(&identifier).await {
                            info!(%identifier, "runner finished, shutting down");
                            let _ = sender
                                .send(LogEvent::shutdown("runner finished, shutting down"))
                                .await;
                            return;
                        }
                        warn!(%identifier, error = %e, "could not fetch events from runner");
                    }
                }
            }
        }
    }
}

/// Producer for the legacy stream: number raw log lines from the client's
/// counter.
async fn subscribe_legacy(
    state: SseState,
    sender: mpsc::Sender<LogEvent>,
    identifier: String,
    url: String,
    mut counter: u64,
) {
    let mut poll = interval_at(Instant::now() + POLL_INTERVAL, POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sender.send(LogEvent::shutdown("service shutting down")).await;
                return;
            }
            _ = ping.tick() => {
                if sender.send(LogEvent::ping()).await.is_err() {
                    debug!(%identifier, "client lost, closing subscriber");
                    return;
                }
            }
            _ = poll.tick() => {
                match fetch_lines(&state.client, &url).await {
                    Ok(lines) => {
                        for event in number_lines(lines, counter) {
                            counter = event.id + 1;
                            if sender.send(event).await.is_err() {
                                debug!(%identifier, "client lost, closing subscriber");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        if state.inspector.is_finished(&identifier).await {
                            info!(%identifier, "runner finished, shutting down");
                            let _ = sender
                                .send(LogEvent::shutdown("runner finished, shutting down"))
                                .await;
                            return;
                        }
                        warn!(%identifier, error = %e, "could not fetch log lines from runner");
                    }
                }
            }
        }
    }
}

/// Turn the full log into numbered events starting at the counter. The
/// first line carries id 1.
fn number_lines(lines: Vec<String>, counter: u64) -> Vec<LogEvent> {
    let skip = counter.saturating_sub(1) as usize;
    lines
        .into_iter()
        .enumerate()
        .skip(skip)
        .map(|(index, line)| LogEvent::message(index as u64 + 1, line))
        .collect()
}

/// All events from the runner starting at `from` (inclusive).
async fn fetch_events(
    client: &reqwest::Client,
    url: &str,
    from: u64,
) -> Result<Vec<LogEvent>, String> {
    let response = client
        .get(url)
        .query(&[("start", from)])
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("runner answered {}", response.status()));
    }
    let body = response.text().await.map_err(|e| e.to_string())?;
    Ok(parse_events(&body))
}

/// One event from the runner.
async fn fetch_single(
    client: &reqwest::Client,
    url: &str,
    id: u64,
) -> Result<Option<LogEvent>, String> {
    let response = client
        .get(url)
        .query(&[("start", id), ("end", id)])
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("runner answered {}", response.status()));
    }
    let body = response.text().await.map_err(|e| e.to_string())?;
    Ok(parse_events(&body).into_iter().next())
}

/// The full legacy log as raw lines.
async fn fetch_lines(client: &reqwest::Client, url: &str) -> Result<Vec<String>, String> {
    let response = client.get(url).send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("runner answered {}", response.status()));
    }
    let body = response.text().await.map_err(|e| e.to_string())?;
    Ok(body.lines().map(str::to_string).collect())
}

/// Decode line-delimited runner output, skipping anything malformed.
fn parse_events(body: &str) -> Vec<LogEvent> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| LogEvent::parse(line).ok())
        .collect()
}
