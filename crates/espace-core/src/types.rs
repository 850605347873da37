//! Persisted domain types for checkouts and executors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default timeout, in seconds, given to the test controller for calling an
/// executor back. Two hours.
pub const EXECUTOR_REQUEST_TIMEOUT: u64 = 7200;

/// Status of a checkout. Monotone: PENDING may move to DONE or FAILED, after
/// which the record is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutStatus {
    Pending,
    Done,
    Failed,
}

/// A checkout session reserving executors for one test run.
///
/// `executors` is populated only on reads, by joining `references` against
/// the executor records in the store; it is cleared before every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkout {
    pub id: Uuid,
    #[serde(rename = "execution_spaces", default, skip_serializing_if = "Vec::is_empty")]
    pub executors: Vec<ExecutorSpec>,
    #[serde(default)]
    pub references: Vec<String>,
    pub status: CheckoutStatus,
    pub description: String,
}

impl Checkout {
    /// A fresh checkout in the PENDING state.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            executors: Vec::new(),
            references: Vec::new(),
            status: CheckoutStatus::Pending,
            description: "Checking out execution spaces".to_string(),
        }
    }

    /// A terminal FAILED checkout carrying the failure description.
    pub fn failed(id: Uuid, description: impl Into<String>) -> Self {
        Self {
            id,
            executors: Vec::new(),
            references: Vec::new(),
            status: CheckoutStatus::Failed,
            description: description.into(),
        }
    }

    /// Record an executor. References keep creation order.
    pub fn add(&mut self, executor: ExecutorSpec) {
        self.references.push(executor.id.to_string());
        self.executors.push(executor);
    }

    /// Mark the checkout failed, keeping the references gathered so far so
    /// that every persisted executor stays reachable for check-in.
    pub fn fail(&mut self, description: impl Into<String>) {
        self.status = CheckoutStatus::Failed;
        self.description = description.into();
    }

    /// The form written to the state store: executors are stored under their
    /// own keys and must not be duplicated into the checkout record.
    pub fn for_storage(&self) -> Checkout {
        let mut stored = self.clone();
        stored.executors.clear();
        stored
    }
}

/// Callback contract telling the test controller how to start one executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub url: String,
    pub method: String,
    #[serde(rename = "json")]
    pub data: RequestData,
    pub headers: HashMap<String, String>,
    pub timeout: u64,
}

/// Body of the executor start callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    pub id: Uuid,
}

/// Launch instructions for one test-runner workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instructions {
    pub image: String,
    pub environment: HashMap<String, String>,
    pub parameters: HashMap<String, String>,
    pub identifier: Uuid,
}

/// The serialized instructions plus callback contract for one runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSpec {
    pub request: Request,
    pub instructions: Instructions,
    pub id: Uuid,
    /// Orchestrator handle for the launched workload. Empty until the
    /// workload-create call has returned; readers must tolerate the window
    /// between the first and second write of the spec.
    #[serde(rename = "BuildID", default)]
    pub build_id: String,
}

impl ExecutorSpec {
    /// Create a spec for one executor.
    ///
    /// `url` is the provider's own executor-start endpoint, `identifier` the
    /// caller's correlation id, `trace_headers` any trace-context headers to
    /// propagate into the callback.
    pub fn new(
        url: &str,
        identifier: &str,
        test_runner: &str,
        mut environment: HashMap<String, String>,
        trace_headers: &HashMap<String, String>,
    ) -> Self {
        let id = Uuid::new_v4();

        let mut headers = HashMap::new();
        headers.insert("X-Etos-Id".to_string(), identifier.to_string());
        for (key, value) in trace_headers {
            headers.insert(key.clone(), value.clone());
        }

        environment.insert("ENVIRONMENT_ID".to_string(), id.to_string());
        apply_executor_environment(&mut environment);

        Self {
            request: Request {
                url: url.to_string(),
                method: "POST".to_string(),
                data: RequestData { id },
                headers,
                timeout: EXECUTOR_REQUEST_TIMEOUT,
            },
            instructions: Instructions {
                image: test_runner.to_string(),
                environment,
                parameters: HashMap::new(),
                identifier: Uuid::new_v4(),
            },
            id,
            build_id: String::new(),
        }
    }
}

/// Inject proxy and timezone settings from the provider's own environment
/// into a runner environment.
fn apply_executor_environment(environment: &mut HashMap<String, String>) {
    if let Ok(proxy) = std::env::var("EXECUTOR_HTTPS_PROXY") {
        if !proxy.is_empty() {
            environment.insert("HTTPS_PROXY".to_string(), proxy.clone());
            environment.insert("https_proxy".to_string(), proxy);
        }
    }
    if let Ok(proxy) = std::env::var("EXECUTOR_HTTP_PROXY") {
        if !proxy.is_empty() {
            environment.insert("HTTP_PROXY".to_string(), proxy.clone());
            environment.insert("http_proxy".to_string(), proxy);
        }
    }
    if let Ok(no_proxy) = std::env::var("EXECUTOR_NO_PROXY") {
        if !no_proxy.is_empty() {
            environment.insert("NO_PROXY".to_string(), no_proxy.clone());
            environment.insert("no_proxy".to_string(), no_proxy);
        }
    }
    if let Ok(tz) = std::env::var("EXECUTOR_TZ") {
        if !tz.is_empty() {
            environment.insert("TZ".to_string(), tz);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> ExecutorSpec {
        let mut environment = HashMap::new();
        environment.insert("K".to_string(), "v".to_string());
        ExecutorSpec::new(
            "http://provider/v1alpha/executor/kubernetes",
            "test-run-1",
            "registry/runner:1",
            environment,
            &HashMap::new(),
        )
    }

    #[test]
    fn executor_spec_environment_id_matches_spec_id() {
        let spec = test_spec();
        assert_eq!(
            spec.instructions.environment.get("ENVIRONMENT_ID"),
            Some(&spec.id.to_string())
        );
    }

    #[test]
    fn executor_spec_callback_contract() {
        let spec = test_spec();
        assert_eq!(spec.request.method, "POST");
        assert_eq!(spec.request.timeout, EXECUTOR_REQUEST_TIMEOUT);
        assert_eq!(spec.request.data.id, spec.id);
        assert_eq!(
            spec.request.headers.get("X-Etos-Id"),
            Some(&"test-run-1".to_string())
        );
        assert_eq!(spec.instructions.image, "registry/runner:1");
        assert!(spec.build_id.is_empty());
    }

    #[test]
    fn executor_spec_propagates_trace_headers() {
        let mut trace = HashMap::new();
        trace.insert(
            "traceparent".to_string(),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
        );
        let spec = ExecutorSpec::new(
            "http://provider",
            "abc",
            "img:1",
            HashMap::new(),
            &trace,
        );
        assert_eq!(
            spec.request.headers.get("traceparent"),
            trace.get("traceparent")
        );
    }

    #[test]
    fn checkout_add_keeps_reference_order() {
        let mut checkout = Checkout::new(Uuid::new_v4());
        let first = test_spec();
        let second = test_spec();
        checkout.add(first.clone());
        checkout.add(second.clone());

        assert_eq!(
            checkout.references,
            vec![first.id.to_string(), second.id.to_string()]
        );
        assert_eq!(checkout.status, CheckoutStatus::Pending);
    }

    #[test]
    fn checkout_storage_form_drops_executors() {
        let mut checkout = Checkout::new(Uuid::new_v4());
        checkout.add(test_spec());

        let stored = checkout.for_storage();
        assert!(stored.executors.is_empty());
        assert_eq!(stored.references, checkout.references);

        let raw = serde_json::to_vec(&stored).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("execution_spaces"));
    }

    #[test]
    fn checkout_round_trips_without_executors() {
        let mut checkout = Checkout::new(Uuid::new_v4());
        checkout.add(test_spec());
        checkout.status = CheckoutStatus::Done;
        checkout.description = "Execution spaces checked out successfully".to_string();

        let raw = serde_json::to_vec(&checkout.for_storage()).unwrap();
        let loaded: Checkout = serde_json::from_slice(&raw).unwrap();

        assert_eq!(loaded.id, checkout.id);
        assert_eq!(loaded.status, CheckoutStatus::Done);
        assert_eq!(loaded.references, checkout.references);
        assert!(loaded.executors.is_empty());
    }

    #[test]
    fn checkout_fail_keeps_references() {
        let mut checkout = Checkout::new(Uuid::new_v4());
        checkout.add(test_spec());
        checkout.fail("store exploded");

        assert_eq!(checkout.status, CheckoutStatus::Failed);
        assert_eq!(checkout.description, "store exploded");
        assert_eq!(checkout.references.len(), 1);
    }

    #[test]
    fn status_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&CheckoutStatus::Pending).unwrap(),
            "\"PENDING\""
        );
        assert_eq!(
            serde_json::to_string(&CheckoutStatus::Done).unwrap(),
            "\"DONE\""
        );
        assert_eq!(
            serde_json::to_string(&CheckoutStatus::Failed).unwrap(),
            "\"FAILED\""
        );
    }
}
