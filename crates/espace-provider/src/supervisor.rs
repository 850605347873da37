//! Executor start supervision.
//!
//! The start flow is bounded by the deadline carried in the executor spec
//! and runs detached from the HTTP request: a dropped client can never
//! abort a workload cleanup. Every failure path after the workload exists
//! issues exactly one cancel or stop, spawned on the in-flight tracker
//! under the process shutdown token.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn, Instrument, Span};
use uuid::Uuid;

use espace_core::ExecutorSpec;
use espace_events::{Event, EventRepository, EventResult};

use crate::provider::Provider;

/// Interval between started-sub-suite barrier attempts.
const SUB_SUITE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Errors from the executor start flow, by HTTP mapping.
#[derive(Debug, Error)]
pub enum StartError {
    /// The spec's deadline fired. 408.
    #[error("{0}")]
    Deadline(String),

    /// The cluster, store or repository failed. 500.
    #[error("{0}")]
    Upstream(String),

    /// The runner never reached its execution phase. 400.
    #[error("{0}")]
    NotStarted(String),
}

enum BarrierError {
    Deadline,
    Fatal(String),
}

enum CleanupAction {
    Cancel,
    Stop,
}

impl Provider {
    /// Launch one executor's workload and wait until it has verifiably
    /// started. Runs on the in-flight tracker so the work survives a
    /// disconnecting client; the returned handle yields the outcome.
    pub fn spawn_start_executor(
        &self,
        id: Uuid,
        identifier: String,
    ) -> tokio::task::JoinHandle<Result<(), StartError>> {
        let provider = self.clone();
        self.tracker
            .spawn(async move { provider.run_start_executor(id, identifier).await })
    }

    async fn run_start_executor(
        &self,
        id: Uuid,
        identifier: String,
    ) -> Result<(), StartError> {
        let span = tracing::info_span!(
            "start_executor",
            executor = %id,
            identifier = %identifier,
            build_id = tracing::field::Empty,
            build_url = tracing::field::Empty,
        );
        let result = self.start_flow(id).instrument(span).await;
        match &result {
            Ok(()) => {
                info!(user_log = true, identifier = %identifier, "Executor has started successfully");
            }
            Err(e) => {
                error!(user_log = true, identifier = %identifier, "{e}");
            }
        }
        result
    }

    async fn start_flow(&self, id: Uuid) -> Result<(), StartError> {
        let mut spec = self.executor_spec(id).await.map_err(|e| {
            StartError::NotStarted(format!(
                "could not read the execution space configuration from the database: {e}"
            ))
        })?;
        let deadline = Instant::now() + Duration::from_secs(spec.request.timeout);

        let workload = match timeout_at(deadline, self.executor.start(&spec)).await {
            Err(_) => {
                return Err(StartError::Deadline(
                    "timed out when trying to start the test execution job".to_string(),
                ));
            }
            Ok(Err(e)) => {
                return Err(StartError::Upstream(format!(
                    "error trying to start the test execution job: {e}"
                )));
            }
            Ok(Ok(workload)) => workload,
        };

        let started = match timeout_at(deadline, self.executor.wait_ready(&workload)).await {
            Err(_) => {
                self.spawn_cleanup(CleanupAction::Cancel, workload);
                return Err(StartError::Deadline(
                    "timed out when waiting for the test execution job to start".to_string(),
                ));
            }
            Ok(Err(e)) => {
                self.spawn_cleanup(CleanupAction::Cancel, workload);
                return Err(StartError::Upstream(format!(
                    "error when waiting for the test execution job to start: {e}"
                )));
            }
            Ok(Ok(started)) => started,
        };
        Span::current().record("build_id", started.build_id.as_str());
        if let Some(url) = &started.build_url {
            Span::current().record("build_url", url.as_str());
            info!(user_log = true, identifier = %spec.request.headers.get("X-Etos-Id").cloned().unwrap_or_default(), "Executor build URL: {url}");
        }

        // Persist the handle before the barrier: without it the stop
        // endpoint could never find this workload.
        spec.build_id = started.build_id.clone();
        match timeout_at(deadline, self.save_executor(&spec)).await {
            Err(_) => {
                self.spawn_cleanup(CleanupAction::Stop, spec.build_id);
                return Err(StartError::Deadline(
                    "timed out when saving the test execution configuration".to_string(),
                ));
            }
            Ok(Err(e)) => {
                self.spawn_cleanup(CleanupAction::Stop, spec.build_id);
                return Err(StartError::Upstream(format!(
                    "error when saving the test execution configuration: {e}"
                )));
            }
            Ok(Ok(())) => {}
        }

        match self.wait_started(deadline, &spec).await {
            Ok(()) => Ok(()),
            Err(BarrierError::Deadline) => {
                self.spawn_cleanup(CleanupAction::Stop, spec.build_id);
                Err(StartError::Deadline(
                    "timed out when waiting for the test execution job to initialize".to_string(),
                ))
            }
            Err(BarrierError::Fatal(reason)) => {
                self.spawn_cleanup(CleanupAction::Stop, spec.build_id);
                Err(StartError::NotStarted(format!(
                    "error when waiting for the test execution job to initialize: {reason}"
                )))
            }
        }
    }

    /// The started-sub-suite barrier: the workload must stay alive while the
    /// event repository is polled for the sub-suite-started event. Liveness
    /// errors and missing events are retried on a fixed interval until the
    /// deadline; a workload that is positively gone is fatal.
    async fn wait_started(
        &self,
        deadline: Instant,
        spec: &ExecutorSpec,
    ) -> Result<(), BarrierError> {
        let mut lookup = SuiteLookup::new(spec);
        let barrier = async {
            loop {
                match self.executor.alive(&spec.build_id).await {
                    Ok(false) => {
                        return Err(BarrierError::Fatal(
                            "the test runner did not start properly".to_string(),
                        ));
                    }
                    Ok(true) => match lookup.sub_suite(self.events.as_ref()).await {
                        Ok(event) => {
                            debug!(sub_suite = %event.meta.id, "sub suite has started");
                            return Ok(());
                        }
                        Err(e) => debug!(reason = %e, "sub suite not yet started, retrying"),
                    },
                    Err(e) => warn!(error = %e, "could not check test runner liveness, retrying"),
                }
                tokio::time::sleep(SUB_SUITE_RETRY_INTERVAL).await;
            }
        };
        match timeout_at(deadline, barrier).await {
            Err(_) => Err(BarrierError::Deadline),
            Ok(result) => result,
        }
    }

    /// Run a workload cleanup outside the request, bounded only by process
    /// shutdown. Tracked so `close()` waits for it.
    fn spawn_cleanup(&self, action: CleanupAction, workload: String) {
        let executor = Arc::clone(&self.executor);
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            let cleanup = async {
                match action {
                    CleanupAction::Cancel => executor.cancel(&workload).await,
                    CleanupAction::Stop => executor.stop(&workload).await,
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!(workload = %workload, "process shutdown interrupted workload cleanup");
                }
                result = cleanup => {
                    if let Err(e) = result {
                        error!(workload = %workload, error = %e, "workload cleanup failed");
                    }
                }
            }
        });
    }
}

/// Lookup state for the sub-suite walk. Environment and main-suite results
/// are memoised so an earlier lookup is not repeated after a later one
/// fails.
struct SuiteLookup {
    environment_id: String,
    environment: Option<Event>,
    main_suite: Option<Event>,
}

impl SuiteLookup {
    fn new(spec: &ExecutorSpec) -> Self {
        Self {
            environment_id: spec.id.to_string(),
            environment: None,
            main_suite: None,
        }
    }

    async fn sub_suite(&mut self, events: &dyn EventRepository) -> EventResult<Event> {
        if self.environment.is_none() {
            self.environment = Some(events.environment_defined(&self.environment_id).await?);
        }
        let (context, environment_name) = match &self.environment {
            Some(environment) => (
                environment.link("CONTEXT").map(str::to_string),
                environment.data.name.clone(),
            ),
            None => (None, String::new()),
        };
        let context = context.ok_or(espace_events::EventError::NotFound)?;

        if self.main_suite.is_none() {
            self.main_suite = Some(events.main_suite_started(&context).await?);
        }
        let main_suite_id = match &self.main_suite {
            Some(main_suite) => main_suite.meta.id.clone(),
            None => return Err(espace_events::EventError::NotFound),
        };

        events.sub_suite_started(&main_suite_id, &environment_name).await
    }
}
