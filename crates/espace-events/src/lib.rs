//! espace-events — read-only client for the event repository.
//!
//! The start supervisor confirms that a test runner has entered its
//! execution phase by walking three lookups: the environment-defined event
//! for the executor's environment id, the main suite started in that
//! environment's context, and finally the sub-suite-started event that links
//! to the main suite and carries the environment's name.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Result type alias for event repository lookups.
pub type EventResult<T> = Result<T, EventError>;

/// Errors from event repository lookups.
#[derive(Debug, Error)]
pub enum EventError {
    /// The repository answered but held no matching event. Retryable while
    /// waiting for an event to appear.
    #[error("event not found in event repository")]
    NotFound,

    /// The repository could not be reached or answered abnormally.
    #[error("event repository error: {0}")]
    Transient(String),
}

/// Metadata common to all events.
#[derive(Debug, Clone, Deserialize)]
pub struct EventMeta {
    pub id: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
}

/// A link from one event to another.
#[derive(Debug, Clone, Deserialize)]
pub struct EventLink {
    #[serde(rename = "type")]
    pub link_type: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub name: String,
}

/// An event as returned by the repository. Only the fields the provider
/// reads are modeled; everything else is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub meta: EventMeta,
    #[serde(default)]
    pub data: EventData,
    #[serde(default)]
    pub links: Vec<EventLink>,
}

impl Event {
    /// Target of the first link of the given type.
    pub fn link(&self, link_type: &str) -> Option<&str> {
        self.links
            .iter()
            .find(|link| link.link_type == link_type)
            .map(|link| link.target.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct EventItems {
    #[serde(default)]
    items: Vec<Event>,
}

/// Lookups the start supervisor needs, behind a trait so tests can script
/// repository behavior.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// The environment-defined event with the given id.
    async fn environment_defined(&self, id: &str) -> EventResult<Event>;

    /// The main-suite-started event for an environment's CONTEXT link.
    async fn main_suite_started(&self, context_id: &str) -> EventResult<Event>;

    /// The sub-suite-started event linking to the main suite and named after
    /// the environment.
    async fn sub_suite_started(&self, main_suite_id: &str, name: &str) -> EventResult<Event>;
}

/// HTTP client for the event repository.
pub struct EventRepositoryClient {
    url: String,
    client: reqwest::Client,
}

impl EventRepositoryClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Query the repository and return the first matching event.
    async fn first_event(&self, query: &[(&str, &str)]) -> EventResult<Event> {
        let response = self
            .client
            .get(&self.url)
            .query(query)
            .send()
            .await
            .map_err(|e| EventError::Transient(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EventError::NotFound);
        }
        if !response.status().is_success() {
            return Err(EventError::Transient(format!(
                "event repository answered {}",
                response.status()
            )));
        }

        let mut events: EventItems = response
            .json()
            .await
            .map_err(|e| EventError::Transient(e.to_string()))?;
        if events.items.is_empty() {
            return Err(EventError::NotFound);
        }
        Ok(events.items.remove(0))
    }
}

#[async_trait]
impl EventRepository for EventRepositoryClient {
    async fn environment_defined(&self, id: &str) -> EventResult<Event> {
        self.first_event(&[
            ("meta.id", id),
            ("meta.type", "EiffelEnvironmentDefinedEvent"),
        ])
        .await
    }

    async fn main_suite_started(&self, context_id: &str) -> EventResult<Event> {
        let activity = self
            .first_event(&[
                ("meta.id", context_id),
                ("meta.type", "EiffelActivityTriggeredEvent"),
            ])
            .await?;
        let suite_id = activity.link("CONTEXT").ok_or(EventError::NotFound)?;
        self.first_event(&[
            ("meta.id", suite_id),
            ("meta.type", "EiffelTestSuiteStartedEvent"),
        ])
        .await
    }

    async fn sub_suite_started(&self, main_suite_id: &str, name: &str) -> EventResult<Event> {
        self.first_event(&[
            ("links.target", main_suite_id),
            ("meta.type", "EiffelTestSuiteStartedEvent"),
            ("data.name", name),
        ])
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::extract::{Query, State};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;

    /// Serve canned repository answers keyed by the `meta.id` / `links.target`
    /// filter of the incoming query.
    async fn serve(answers: HashMap<String, Value>) -> String {
        let answers = Arc::new(answers);
        let app = Router::new().route(
            "/",
            get(
                |State(answers): State<Arc<HashMap<String, Value>>>,
                 Query(query): Query<HashMap<String, String>>| async move {
                    let key = query
                        .get("meta.id")
                        .or_else(|| query.get("links.target"))
                        .cloned()
                        .unwrap_or_default();
                    match answers.get(&key) {
                        Some(answer) => Json(answer.clone()),
                        None => Json(json!({ "items": [] })),
                    }
                },
            )
            .with_state(answers),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{address}")
    }

    fn event(id: &str, name: &str, links: Value) -> Value {
        json!({
            "items": [{
                "meta": { "id": id, "type": "test" },
                "data": { "name": name },
                "links": links,
            }]
        })
    }

    #[tokio::test]
    async fn environment_defined_returns_first_item() {
        let url = serve(HashMap::from([(
            "env-1".to_string(),
            event("env-1", "sub suite 0", json!([])),
        )]))
        .await;

        let client = EventRepositoryClient::new(url);
        let environment = client.environment_defined("env-1").await.unwrap();
        assert_eq!(environment.meta.id, "env-1");
        assert_eq!(environment.data.name, "sub suite 0");
    }

    #[tokio::test]
    async fn empty_items_is_not_found() {
        let url = serve(HashMap::new()).await;
        let client = EventRepositoryClient::new(url);

        assert!(matches!(
            client.environment_defined("missing").await,
            Err(EventError::NotFound)
        ));
    }

    #[tokio::test]
    async fn main_suite_walks_activity_context_link() {
        let url = serve(HashMap::from([
            (
                "context-1".to_string(),
                event(
                    "activity-1",
                    "",
                    json!([{ "type": "CONTEXT", "target": "suite-1" }]),
                ),
            ),
            (
                "suite-1".to_string(),
                event("suite-1", "main suite", json!([])),
            ),
        ]))
        .await;

        let client = EventRepositoryClient::new(url);
        let suite = client.main_suite_started("context-1").await.unwrap();
        assert_eq!(suite.meta.id, "suite-1");
    }

    #[tokio::test]
    async fn sub_suite_queries_by_target_and_name() {
        let url = serve(HashMap::from([(
            "main-1".to_string(),
            event("sub-1", "sub suite 0", json!([])),
        )]))
        .await;

        let client = EventRepositoryClient::new(url);
        let sub = client.sub_suite_started("main-1", "sub suite 0").await.unwrap();
        assert_eq!(sub.meta.id, "sub-1");
    }

    #[tokio::test]
    async fn unreachable_repository_is_transient() {
        let client = EventRepositoryClient::new("http://127.0.0.1:1");
        assert!(matches!(
            client.environment_defined("env-1").await,
            Err(EventError::Transient(_))
        ));
    }

    #[test]
    fn link_lookup_finds_first_match() {
        let event = Event {
            meta: EventMeta {
                id: "e".to_string(),
                event_type: String::new(),
            },
            data: EventData::default(),
            links: vec![
                EventLink {
                    link_type: "CAUSE".to_string(),
                    target: "a".to_string(),
                },
                EventLink {
                    link_type: "CONTEXT".to_string(),
                    target: "b".to_string(),
                },
            ],
        };
        assert_eq!(event.link("CONTEXT"), Some("b"));
        assert_eq!(event.link("FLOW"), None);
    }
}
