//! The common interface for test executor backends.

use async_trait::async_trait;
use thiserror::Error;

use espace_core::ExecutorSpec;

/// Result type alias for executor operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Errors from the cluster backend. Surfaced verbatim; retry and cleanup
/// policy belongs to the caller.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("no pod found for workload {0}")]
    NoPod(String),
}

/// A workload that has reached its ready state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedWorkload {
    /// Orchestrator handle, stored on the executor spec as `buildId`.
    pub build_id: String,
    /// Human-facing build page, when the backend has one.
    pub build_url: Option<String>,
}

/// Capability set for one executor backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Backend name, also the final path segment of the executor-start
    /// endpoint.
    fn name(&self) -> &str;

    /// Create the workload for a spec. Returns the workload name.
    async fn start(&self, spec: &ExecutorSpec) -> ExecutorResult<String>;

    /// Wait until the workload reports ready. Observes orchestrator events;
    /// bounded only by the caller's deadline.
    async fn wait_ready(&self, name: &str) -> ExecutorResult<StartedWorkload>;

    /// Whether the workload exists and is ready. A deleted workload is
    /// `false`, not an error.
    async fn alive(&self, name: &str) -> ExecutorResult<bool>;

    /// Delete the workload and all its descendants, waiting for the delete
    /// to land. Stopping an already-deleted workload succeeds.
    async fn stop(&self, name: &str) -> ExecutorResult<()>;

    /// Cancel a workload that may not have started. Backends without a
    /// pre-start queue implement this as [`Executor::stop`].
    async fn cancel(&self, name: &str) -> ExecutorResult<()>;
}
