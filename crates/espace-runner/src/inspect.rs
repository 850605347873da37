//! Read-only cluster queries for the SSE relay.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{error, warn};

use crate::executor::{ExecutorError, ExecutorResult};

/// The two questions the relay asks about a runner, behind a trait so the
/// relay can be driven without a cluster in tests.
#[async_trait]
pub trait RunnerInspector: Send + Sync {
    /// Whether the runner job for a test-run identifier has finished.
    /// An absent job counts as finished.
    async fn is_finished(&self, identifier: &str) -> bool;

    /// The pod IP of the runner's log listener.
    async fn log_listener_ip(&self, identifier: &str) -> ExecutorResult<String>;
}

/// Kubernetes-backed inspector. Jobs are found through their `id` label.
pub struct ClusterInspector {
    client: Client,
    namespace: String,
}

impl ClusterInspector {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    async fn job(&self, identifier: &str) -> ExecutorResult<Option<Job>> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = jobs
            .list(&ListParams::default().labels(&format!("id={identifier}")))
            .await
            .map_err(|e| ExecutorError::Cluster(e.to_string()))?;
        Ok(list.items.into_iter().next())
    }
}

#[async_trait]
impl RunnerInspector for ClusterInspector {
    async fn is_finished(&self, identifier: &str) -> bool {
        let job = match self.job(identifier).await {
            Ok(job) => job,
            Err(e) => {
                error!(%identifier, error = %e, "could not query runner job");
                return false;
            }
        };
        match job {
            None => {
                warn!(%identifier, "runner job does not exist, assuming finished");
                true
            }
            Some(job) => job_finished(&job),
        }
    }

    async fn log_listener_ip(&self, identifier: &str) -> ExecutorResult<String> {
        let job = self
            .job(identifier)
            .await?
            .ok_or_else(|| ExecutorError::Cluster(format!("no runner job with id {identifier}")))?;
        let name = job.metadata.name.unwrap_or_default();

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods
            .list(&ListParams::default().labels(&format!("job-name={name}")))
            .await
            .map_err(|e| ExecutorError::Cluster(e.to_string()))?;
        let pod = list
            .items
            .into_iter()
            .next()
            .ok_or_else(|| ExecutorError::NoPod(name.clone()))?;
        pod.status
            .and_then(|status| status.pod_ip)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| ExecutorError::NoPod(name))
    }
}

/// A job with at least one succeeded or failed completion is finished.
fn job_finished(job: &Job) -> bool {
    match &job.status {
        None => false,
        Some(status) => status.succeeded.unwrap_or(0) > 0 || status.failed.unwrap_or(0) > 0,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn job_with_status(status: serde_json::Value) -> Job {
        serde_json::from_value(json!({
            "metadata": { "name": "etr-1" },
            "status": status,
        }))
        .unwrap()
    }

    #[test]
    fn running_job_is_not_finished() {
        assert!(!job_finished(&job_with_status(json!({ "active": 1 }))));
    }

    #[test]
    fn succeeded_job_is_finished() {
        assert!(job_finished(&job_with_status(json!({ "succeeded": 1 }))));
    }

    #[test]
    fn failed_job_is_finished() {
        assert!(job_finished(&job_with_status(json!({ "failed": 1 }))));
    }

    #[test]
    fn statusless_job_is_not_finished() {
        let job: Job = serde_json::from_value(json!({ "metadata": { "name": "etr-1" } })).unwrap();
        assert!(!job_finished(&job));
    }
}
