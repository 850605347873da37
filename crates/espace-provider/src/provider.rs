//! Checkout coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use espace_core::{Checkout, CheckoutStatus, ExecutorSpec};
use espace_events::EventRepository;
use espace_runner::Executor;
use espace_state::{StateError, StateStore, StoreHandle};

/// Store record kinds. Checkouts and executors live under disjoint key
/// prefixes with single-writer discipline per key.
pub(crate) const CHECKOUT: &str = "checkout";
pub(crate) const EXECUTOR: &str = "executor";

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors from coordinator operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("failed to decode stored record: {0}")]
    Decode(String),

    #[error("some of the executors could not be stopped: {0}")]
    Stop(String),
}

/// Parameters for one checkout.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    /// Number of executors to reserve. At least 1.
    pub amount: usize,
    /// Container image reference for the test runner.
    pub test_runner: String,
    /// Environment handed to every executor.
    pub environment: HashMap<String, String>,
    /// Caller-generated id of the checkout record.
    pub checkout_id: Uuid,
    /// Correlation id of the test run.
    pub identifier: String,
    /// Trace-context headers to propagate into executor callbacks.
    pub trace_headers: HashMap<String, String>,
}

/// The execution-space provider.
///
/// Cloning is cheap and clones share the state store, the executor backend
/// and the in-flight tracker.
#[derive(Clone)]
pub struct Provider {
    pub(crate) store: StateStore,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) events: Arc<dyn EventRepository>,
    executor_url: String,
    wait_timeout: Duration,
    pub(crate) tracker: TaskTracker,
    pub(crate) shutdown: CancellationToken,
}

impl Provider {
    pub fn new(
        store: StateStore,
        executor: Arc<dyn Executor>,
        events: Arc<dyn EventRepository>,
        hostname: &str,
        wait_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let executor_url = format!(
            "{}/executionspace/v1alpha/executor/{}",
            hostname.trim_end_matches('/'),
            executor.name()
        );
        Self {
            store,
            executor,
            events,
            executor_url,
            wait_timeout,
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    /// Name of the executor backend, used as the final segment of the
    /// executor-start route.
    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    /// Check out execution spaces in the background. The checkout record is
    /// immediately readable through [`Provider::status`]; its terminal state
    /// lands within the configured wait timeout.
    pub fn checkout(&self, request: CheckoutRequest) {
        let provider = self.clone();
        let span = tracing::info_span!(
            "checkout",
            checkout_id = %request.checkout_id,
            identifier = %request.identifier,
            amount = request.amount,
        );
        self.tracker
            .spawn(async move { provider.run_checkout(request).await }.instrument(span));
    }

    async fn run_checkout(&self, request: CheckoutRequest) {
        let handle = match self.store.open(CHECKOUT, request.checkout_id) {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "refusing checkout, could not open checkout record");
                return;
            }
        };

        let mut checkout = Checkout::new(request.checkout_id);
        if let Err(e) = write_checkout(&handle, &checkout).await {
            error!(error = %e, "failed to write checkout pending status to database");
            return;
        }

        match tokio::time::timeout(self.wait_timeout, self.fan_out(&mut checkout, &request)).await
        {
            Ok(Ok(())) => {
                checkout.status = CheckoutStatus::Done;
                checkout.description = "Execution spaces checked out successfully".to_string();
                if let Err(e) = write_checkout(&handle, &checkout).await {
                    error!(error = %e, "failed to write checkout done status to database");
                    self.fail(&handle, &mut checkout, e.to_string()).await;
                    return;
                }
                info!(
                    user_log = true,
                    identifier = %request.identifier,
                    "Executor prepared for running tests"
                );
            }
            Ok(Err(e)) => self.fail(&handle, &mut checkout, e.to_string()).await,
            Err(_) => {
                self.fail(
                    &handle,
                    &mut checkout,
                    "timed out while checking out execution spaces".to_string(),
                )
                .await
            }
        }
    }

    /// Generate and persist the executor specs, recording each reference in
    /// creation order. A spec is added to the checkout only once its record
    /// is safely in the store.
    async fn fan_out(
        &self,
        checkout: &mut Checkout,
        request: &CheckoutRequest,
    ) -> ProviderResult<()> {
        for _ in 0..request.amount {
            let spec = ExecutorSpec::new(
                &self.executor_url,
                &request.identifier,
                &request.test_runner,
                request.environment.clone(),
                &request.trace_headers,
            );
            self.save_executor(&spec).await?;
            checkout.add(spec);
        }
        Ok(())
    }

    async fn fail(&self, handle: &StoreHandle, checkout: &mut Checkout, description: String) {
        error!(checkout_id = %checkout.id, %description, "checkout failed");
        checkout.fail(description);
        if let Err(e) = write_checkout(handle, checkout).await {
            error!(error = %e, "failed to write checkout failure status to database");
        }
    }

    /// The checkout with all its executor specs joined in. A pure read of
    /// store state.
    pub async fn status(&self, id: Uuid) -> ProviderResult<Checkout> {
        self.tracker.track_future(self.status_inner(id)).await
    }

    async fn status_inner(&self, id: Uuid) -> ProviderResult<Checkout> {
        let raw = self.store.open(CHECKOUT, id)?.read_all().await?;
        let mut checkout: Checkout =
            serde_json::from_slice(&raw).map_err(|e| ProviderError::Decode(e.to_string()))?;

        for reference in checkout.references.clone() {
            let reference = Uuid::parse_str(&reference)
                .map_err(|e| ProviderError::Decode(format!("bad executor reference: {e}")))?;
            checkout.executors.push(self.executor_spec(reference).await?);
        }
        Ok(checkout)
    }

    /// Release executors by deleting their records. Deleting an executor
    /// that was already checked in is not an error.
    pub async fn checkin(&self, executors: &[ExecutorSpec]) -> ProviderResult<()> {
        self.tracker
            .track_future(async {
                for executor in executors {
                    self.store.open(EXECUTOR, executor.id)?.delete().await?;
                }
                Ok(())
            })
            .await
    }

    /// Stop the workloads behind the given specs and check each one in.
    /// Specs that were already checked in are skipped silently; a spec
    /// without a workload is checked in directly. Failures are joined and
    /// reported only after every executor was attempted, and a spec whose
    /// stop failed stays in the store so the stop can be retried.
    pub async fn stop_executors(&self, executors: &[ExecutorSpec]) -> ProviderResult<()> {
        self.tracker
            .track_future(async {
                let mut failures: Vec<String> = Vec::new();
                for executor in executors {
                    let stored = match self.executor_spec(executor.id).await {
                        Ok(stored) => stored,
                        // Already checked in.
                        Err(ProviderError::State(StateError::NotFound(_))) => continue,
                        Err(e) => {
                            failures.push(e.to_string());
                            continue;
                        }
                    };
                    if !stored.build_id.is_empty() {
                        if let Err(e) = self.executor.stop(&stored.build_id).await {
                            error!(workload = %stored.build_id, error = %e, "failed to stop executor");
                            failures
                                .push(format!("failed to stop executor {}: {e}", stored.build_id));
                            continue;
                        }
                    }
                    if let Err(e) = self.checkin(std::slice::from_ref(executor)).await {
                        failures.push(e.to_string());
                    }
                }
                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(ProviderError::Stop(failures.join("; ")))
                }
            })
            .await
    }

    /// The stored spec of one executor.
    pub async fn executor_spec(&self, id: Uuid) -> ProviderResult<ExecutorSpec> {
        let raw = self.store.open(EXECUTOR, id)?.read_all().await?;
        serde_json::from_slice(&raw).map_err(|e| ProviderError::Decode(e.to_string()))
    }

    /// Persist an executor spec under its own key.
    pub async fn save_executor(&self, spec: &ExecutorSpec) -> ProviderResult<()> {
        let raw = serde_json::to_vec(spec).map_err(|e| ProviderError::Decode(e.to_string()))?;
        self.store.open(EXECUTOR, spec.id)?.write(&raw).await?;
        Ok(())
    }

    /// Wait for every outstanding checkout, check-in, executor start and
    /// cleanup to finish. Called once, on shutdown.
    pub async fn close(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn write_checkout(handle: &StoreHandle, checkout: &Checkout) -> ProviderResult<()> {
    let raw = serde_json::to_vec(&checkout.for_storage())
        .map_err(|e| ProviderError::Decode(e.to_string()))?;
    Ok(handle.write(&raw).await?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use espace_testing::{FakeEventRepository, FakeExecutor};

    use super::*;

    fn test_provider(store: StateStore) -> Provider {
        Provider::new(
            store,
            Arc::new(FakeExecutor::new()),
            Arc::new(FakeEventRepository::new()),
            "http://provider",
            Duration::from_secs(60),
            CancellationToken::new(),
        )
    }

    fn test_request(amount: usize) -> CheckoutRequest {
        CheckoutRequest {
            amount,
            test_runner: "registry/runner:1".to_string(),
            environment: HashMap::from([("K".to_string(), "v".to_string())]),
            checkout_id: Uuid::new_v4(),
            identifier: "test-run-1".to_string(),
            trace_headers: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn checkout_lands_done_with_all_executors() {
        let provider = test_provider(StateStore::in_memory("execution-space"));
        let request = test_request(2);
        let id = request.checkout_id;

        provider.checkout(request);
        provider.close().await;

        let checkout = provider.status(id).await.unwrap();
        assert_eq!(checkout.status, CheckoutStatus::Done);
        assert_eq!(
            checkout.description,
            "Execution spaces checked out successfully"
        );
        assert_eq!(checkout.references.len(), 2);
        assert_eq!(checkout.executors.len(), 2);
        for (reference, executor) in checkout.references.iter().zip(&checkout.executors) {
            assert_eq!(reference, &executor.id.to_string());
            assert_eq!(
                executor.instructions.environment.get("ENVIRONMENT_ID"),
                Some(&executor.id.to_string())
            );
        }
    }

    #[tokio::test]
    async fn checkout_callback_url_targets_executor_endpoint() {
        let provider = test_provider(StateStore::in_memory("execution-space"));
        let request = test_request(1);
        let id = request.checkout_id;

        provider.checkout(request);
        provider.close().await;

        let checkout = provider.status(id).await.unwrap();
        assert_eq!(
            checkout.executors[0].request.url,
            "http://provider/executionspace/v1alpha/executor/kubernetes"
        );
    }

    #[tokio::test]
    async fn store_failure_mid_fanout_lands_failed() {
        // Budget: the PENDING write and the first executor succeed, the
        // second executor write fails.
        let store = StateStore::in_memory_failing("execution-space", 2);
        let provider = test_provider(store);
        let request = test_request(3);
        let id = request.checkout_id;

        provider.checkout(request);
        provider.close().await;

        let checkout = provider.status(id).await.unwrap();
        assert_eq!(checkout.status, CheckoutStatus::Failed);
        assert!(checkout.description.contains("injected write failure"));
        // Only the persisted executor is referenced, so every reference
        // remains resolvable.
        assert_eq!(checkout.references.len(), 1);
        assert_eq!(checkout.executors.len(), 1);
    }

    #[tokio::test]
    async fn status_of_unknown_checkout_is_not_found() {
        let provider = test_provider(StateStore::in_memory("execution-space"));
        let err = provider.status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::State(StateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn status_is_a_pure_read() {
        let provider = test_provider(StateStore::in_memory("execution-space"));
        let request = test_request(2);
        let id = request.checkout_id;
        provider.checkout(request);
        provider.close().await;

        let first = provider.status(id).await.unwrap();
        let second = provider.status(id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn checkin_twice_is_idempotent() {
        let provider = test_provider(StateStore::in_memory("execution-space"));
        let request = test_request(2);
        let id = request.checkout_id;
        provider.checkout(request);
        provider.close().await;

        let executors = provider.status(id).await.unwrap().executors;
        provider.checkin(&executors).await.unwrap();
        provider.checkin(&executors).await.unwrap();

        for executor in &executors {
            assert!(matches!(
                provider.executor_spec(executor.id).await.unwrap_err(),
                ProviderError::State(StateError::NotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn stop_skips_absent_specs_and_checks_in_unstarted_ones() {
        let provider = test_provider(StateStore::in_memory("execution-space"));
        let request = test_request(1);
        let id = request.checkout_id;
        provider.checkout(request);
        provider.close().await;

        // One spec that was never persisted, one persisted without a build
        // id: neither is an error, and the persisted one is checked in.
        let mut executors = provider.status(id).await.unwrap().executors;
        let persisted = executors[0].id;
        executors.push(ExecutorSpec::new(
            "http://provider",
            "other",
            "img:1",
            HashMap::new(),
            &HashMap::new(),
        ));
        provider.stop_executors(&executors).await.unwrap();
        assert!(matches!(
            provider.executor_spec(persisted).await.unwrap_err(),
            ProviderError::State(StateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stop_batch_reports_joined_failures_but_stops_the_rest() {
        let store = StateStore::in_memory("execution-space");
        let request = test_request(2);
        let id = request.checkout_id;

        // Provision two specs, then mark both as started.
        let seeding = test_provider(store.clone());
        seeding.checkout(request);
        seeding.close().await;
        let mut executors = seeding.status(id).await.unwrap().executors;
        for executor in &mut executors {
            executor.build_id = format!("etr-{}", executor.id);
            seeding.save_executor(executor).await.unwrap();
        }

        let failing = format!("etr-{}", executors[0].id);
        let executor_backend =
            Arc::new(FakeExecutor::new().with_stop_failure_for(&failing));
        let provider = Provider::new(
            store,
            executor_backend.clone(),
            Arc::new(FakeEventRepository::new()),
            "http://provider",
            Duration::from_secs(60),
            CancellationToken::new(),
        );

        let err = provider.stop_executors(&executors).await.unwrap_err();
        assert!(matches!(err, ProviderError::Stop(_)));
        assert!(err.to_string().contains(&failing));
        // The second workload was still stopped and its spec checked in;
        // the failing one stays so the stop can be retried.
        assert_eq!(
            executor_backend.stopped(),
            vec![format!("etr-{}", executors[1].id)]
        );
        assert!(matches!(
            provider.executor_spec(executors[1].id).await.unwrap_err(),
            ProviderError::State(StateError::NotFound(_))
        ));
        assert!(provider.executor_spec(executors[0].id).await.is_ok());
    }
}
