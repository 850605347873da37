//! Kubernetes executor backend.
//!
//! Each executor runs as a batch Job named `etr-<spec id>` with a single
//! pod. Readiness is observed through the pod watch stream rather than by
//! polling; deletion is foreground and waits for the job to actually go
//! away.

use std::pin::pin;

use either::Either;
use futures::TryStreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde_json::json;
use tracing::{debug, info};

use async_trait::async_trait;
use espace_core::ExecutorSpec;

use crate::executor::{Executor, ExecutorError, ExecutorResult, StartedWorkload};

/// Cluster secret holding the runner encryption key.
const ENCRYPTION_KEY_SECRET: &str = "etos-encryption-key";

/// Executor backend running test runners as Kubernetes jobs.
pub struct KubernetesExecutor {
    client: Client,
    namespace: String,
}

impl KubernetesExecutor {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// The pod belonging to a job, once the job controller has created it.
    async fn pod_for_job(&self, name: &str) -> ExecutorResult<Pod> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&format!("job-name={name}")))
            .await
            .map_err(|e| ExecutorError::Cluster(e.to_string()))?;
        pods.items
            .into_iter()
            .next()
            .ok_or_else(|| ExecutorError::NoPod(name.to_string()))
    }
}

#[async_trait]
impl Executor for KubernetesExecutor {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn start(&self, spec: &ExecutorSpec) -> ExecutorResult<String> {
        let name = workload_name(spec);
        info!(workload = %name, image = %spec.instructions.image, "starting test runner workload");

        let job = build_job(spec)?;
        self.jobs()
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| ExecutorError::Cluster(e.to_string()))?;
        Ok(name)
    }

    async fn wait_ready(&self, name: &str) -> ExecutorResult<StartedWorkload> {
        debug!(workload = %name, "waiting for test runner pod to become ready");
        let config = watcher::Config::default().labels(&format!("job-name={name}"));
        let stream = watcher(self.pods(), config)
            .default_backoff()
            .applied_objects();
        let mut stream = pin!(stream);

        while let Some(pod) = stream
            .try_next()
            .await
            .map_err(|e| ExecutorError::Cluster(e.to_string()))?
        {
            if pod_is_ready(&pod) {
                return Ok(StartedWorkload {
                    build_id: name.to_string(),
                    build_url: None,
                });
            }
        }
        Err(ExecutorError::Cluster(format!(
            "watch ended before workload {name} became ready"
        )))
    }

    async fn alive(&self, name: &str) -> ExecutorResult<bool> {
        let job = self
            .jobs()
            .get_opt(name)
            .await
            .map_err(|e| ExecutorError::Cluster(e.to_string()))?;
        if job.is_none() {
            return Ok(false);
        }
        let pod = self.pod_for_job(name).await?;
        Ok(pod_is_ready(&pod))
    }

    async fn stop(&self, name: &str) -> ExecutorResult<()> {
        info!(workload = %name, "stopping test runner workload");
        let jobs = self.jobs();
        let uid = match jobs.delete(name, &DeleteParams::foreground()).await {
            Ok(Either::Left(job)) => job.metadata.uid,
            Ok(Either::Right(_)) => None,
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(workload = %name, "workload already gone, treating stop as done");
                return Ok(());
            }
            Err(e) => return Err(ExecutorError::Cluster(e.to_string())),
        };
        // Without a uid the delete already finalized.
        let Some(uid) = uid else { return Ok(()) };

        await_condition(jobs, name, conditions::is_deleted(&uid))
            .await
            .map_err(|e| ExecutorError::Cluster(e.to_string()))?;
        Ok(())
    }

    async fn cancel(&self, name: &str) -> ExecutorResult<()> {
        // Kubernetes has no pre-start queue, so cancel and stop coincide.
        self.stop(name).await
    }
}

/// The cluster name for a spec's workload.
pub fn workload_name(spec: &ExecutorSpec) -> String {
    format!("etr-{}", spec.id)
}

/// Whether the pod reports the Ready condition.
pub(crate) fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Build the job manifest for one executor spec.
fn build_job(spec: &ExecutorSpec) -> ExecutorResult<Job> {
    let env: Vec<serde_json::Value> = spec
        .instructions
        .environment
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    let args: Vec<String> = spec
        .instructions
        .parameters
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();

    serde_json::from_value(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": workload_name(spec),
            "labels": { "id": spec.instructions.identifier },
        },
        "spec": {
            "backoffLimit": 0,
            "completions": 1,
            "parallelism": 1,
            "template": {
                "spec": {
                    "containers": [{
                        "name": "etos-test-runner",
                        "image": spec.instructions.image,
                        "args": args,
                        "env": env,
                        "envFrom": [{
                            "secretRef": {
                                "name": ENCRYPTION_KEY_SECRET,
                                "optional": true,
                            },
                        }],
                    }],
                    "restartPolicy": "Never",
                },
            },
        },
    }))
    .map_err(|e| ExecutorError::Cluster(format!("invalid job manifest: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn test_spec() -> ExecutorSpec {
        let mut environment = HashMap::new();
        environment.insert("SUITE".to_string(), "regression".to_string());
        let mut spec = ExecutorSpec::new(
            "http://provider/v1alpha/executor/kubernetes",
            "test-run-1",
            "registry/etos-test-runner:latest",
            environment,
            &HashMap::new(),
        );
        spec.instructions
            .parameters
            .insert("verbosity".to_string(), "2".to_string());
        spec
    }

    #[test]
    fn job_manifest_shape() {
        let spec = test_spec();
        let job = build_job(&spec).unwrap();

        assert_eq!(job.metadata.name, Some(format!("etr-{}", spec.id)));
        assert_eq!(
            job.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get("id"))
                .cloned(),
            Some(spec.instructions.identifier.to_string())
        );

        let job_spec = job.spec.unwrap();
        assert_eq!(job_spec.backoff_limit, Some(0));
        assert_eq!(job_spec.completions, Some(1));
        assert_eq!(job_spec.parallelism, Some(1));

        let pod_spec = job_spec.template.spec.unwrap();
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        let container = &pod_spec.containers[0];
        assert_eq!(container.name, "etos-test-runner");
        assert_eq!(
            container.image.as_deref(),
            Some("registry/etos-test-runner:latest")
        );
        assert_eq!(container.args, Some(vec!["verbosity=2".to_string()]));
    }

    #[test]
    fn job_environment_contains_environment_id() {
        let spec = test_spec();
        let job = build_job(&spec).unwrap();
        let container = &job.spec.unwrap().template.spec.unwrap().containers[0];

        let env = container.env.as_ref().unwrap();
        assert!(env
            .iter()
            .any(|var| var.name == "ENVIRONMENT_ID"
                && var.value.as_deref() == Some(spec.id.to_string().as_str())));
    }

    #[test]
    fn pod_ready_condition() {
        let ready: Pod = serde_json::from_value(json!({
            "metadata": { "name": "etr-1-abc" },
            "status": { "conditions": [{ "type": "Ready", "status": "True" }] },
        }))
        .unwrap();
        assert!(pod_is_ready(&ready));

        let pending: Pod = serde_json::from_value(json!({
            "metadata": { "name": "etr-1-abc" },
            "status": { "conditions": [{ "type": "Ready", "status": "False" }] },
        }))
        .unwrap();
        assert!(!pod_is_ready(&pending));

        let no_status: Pod = serde_json::from_value(json!({
            "metadata": { "name": "etr-1-abc" },
        }))
        .unwrap();
        assert!(!pod_is_ready(&no_status));
    }
}
