/*
Copyright 2024 The Convoy Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tonic::transport::Channel;
use tracing::{error, info};

use protocol::deployment::dispatch_client::DispatchClient;
use protocol::deployment::{DeploymentRequest, DeploymentStatus};
use protocol::identity_of;

use crate::applier::ClusterClient;
use crate::rollout::wait_for_rollout;

/// Where emitted state transitions go. The live sink pushes them to the
/// dispatcher; tests collect them.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn report(&self, status: DeploymentStatus) -> anyhow::Result<()>;
}

pub struct GrpcStatusSink {
    client: DispatchClient<Channel>,
}

impl GrpcStatusSink {
    pub fn new(client: DispatchClient<Channel>) -> Self {
        GrpcStatusSink { client }
    }
}

#[async_trait]
impl StatusSink for GrpcStatusSink {
    async fn report(&self, status: DeploymentStatus) -> anyhow::Result<()> {
        let mut client = self.client.clone();
        client.report_status(status).await?;
        Ok(())
    }
}

/// Drive one routed request to its terminal state and report every
/// transition along the way.
pub async fn handle_request(
    client: Arc<dyn ClusterClient>,
    sink: Arc<dyn StatusSink>,
    request: DeploymentRequest,
) {
    let terminal = run(client.as_ref(), sink.as_ref(), &request).await;
    info!(
        id = %request.id,
        state = %terminal.state().as_str_name(),
        "deployment finished"
    );
    if let Err(err) = sink.report(terminal).await {
        error!(id = %request.id, %err, "unable to report terminal status");
    }
}

async fn run(
    client: &dyn ClusterClient,
    sink: &dyn StatusSink,
    request: &DeploymentRequest,
) -> DeploymentStatus {
    let deadline = match request.deadline_time() {
        Some(deadline) => deadline,
        None => {
            return DeploymentStatus::error(request, "deployment request carries no deadline");
        }
    };
    if Utc::now() >= deadline {
        return DeploymentStatus::error(request, "deployment deadline exceeded");
    }

    if let Err(err) = sink.report(DeploymentStatus::in_progress(request)).await {
        error!(id = %request.id, %err, "unable to report in-progress status");
    }

    let manifests = match request.manifests() {
        Ok(manifests) => manifests,
        Err(err) => {
            return DeploymentStatus::failure(request, format!("unable to decode manifests: {err}"))
        }
    };

    // (namespace, name) of every applied deployment-shaped resource.
    let mut rollouts: Vec<(String, String)> = Vec::new();
    for (index, manifest) in manifests.iter().enumerate() {
        if Utc::now() >= deadline {
            return DeploymentStatus::error(
                request,
                "deployment deadline exceeded while applying resources",
            );
        }
        let identity = match identity_of(manifest, index) {
            Ok(identity) => identity,
            Err(err) => return DeploymentStatus::failure(request, err.to_string()),
        };
        if let Err(err) = client.apply_generic(manifest).await {
            return DeploymentStatus::failure(request, format!("apply {identity}: {err}"));
        }
        info!(id = %request.id, resource = %identity, "resource applied");

        if identity.kind == "Deployment" {
            // An undeclared namespace resolves to the client's default, the
            // same namespace the apply above was scoped to.
            let namespace = if identity.namespace.is_empty() {
                client.default_namespace().to_string()
            } else {
                identity.namespace.clone()
            };
            rollouts.push((namespace, identity.name.clone()));
        }
    }

    let waits = rollouts
        .iter()
        .map(|(namespace, name)| wait_for_rollout(client, namespace, name, deadline));
    for result in join_all(waits).await {
        if let Err(err) = result {
            return DeploymentStatus::failure(request, err.to_string());
        }
    }

    DeploymentStatus::success(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::ApplyError;
    use k8s_openapi::api::apps::v1::{
        Deployment, DeploymentSpec, DeploymentStatus as KubeDeploymentStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use protocol::deployment::{DeploymentState, Payload};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCluster {
        applied: Mutex<Vec<String>>,
        fail_on: Option<String>,
        rollout_completes: bool,
        rollout_namespaces: Mutex<Vec<String>>,
        default_namespace: String,
        version: AtomicU64,
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        fn default_namespace(&self) -> &str {
            &self.default_namespace
        }

        async fn apply_generic(&self, manifest: &Value) -> Result<kube::api::DynamicObject, ApplyError> {
            let name = manifest["metadata"]["name"].as_str().unwrap_or("").to_string();
            if self.fail_on.as_deref() == Some(name.as_str()) {
                return Err(ApplyError::InvalidManifest("rejected by admission".into()));
            }
            self.applied.lock().unwrap().push(name);
            Ok(serde_json::from_value(manifest.clone()).unwrap())
        }

        async fn read_rollout(
            &self,
            namespace: &str,
            _name: &str,
        ) -> Result<Option<Deployment>, ApplyError> {
            self.rollout_namespaces
                .lock()
                .unwrap()
                .push(namespace.to_string());
            if !self.rollout_completes {
                return Ok(None);
            }
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Some(Deployment {
                metadata: ObjectMeta {
                    resource_version: Some(version.to_string()),
                    generation: Some(1),
                    ..Default::default()
                },
                spec: Some(DeploymentSpec {
                    replicas: Some(1),
                    ..Default::default()
                }),
                status: Some(KubeDeploymentStatus {
                    observed_generation: Some(1),
                    replicas: Some(1),
                    updated_replicas: Some(1),
                    ready_replicas: Some(1),
                    available_replicas: Some(1),
                    ..Default::default()
                }),
            }))
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        statuses: Mutex<Vec<DeploymentStatus>>,
    }

    #[async_trait]
    impl StatusSink for CollectingSink {
        async fn report(&self, status: DeploymentStatus) -> anyhow::Result<()> {
            self.statuses.lock().unwrap().push(status);
            Ok(())
        }
    }

    fn request(manifests: &[Value], deadline_secs: i64) -> DeploymentRequest {
        DeploymentRequest {
            id: "r1".into(),
            cluster: "c1".into(),
            payload: Some(Payload::from_json_resources(manifests)),
            deadline: Some(protocol::to_timestamp(
                Utc::now() + chrono::Duration::seconds(deadline_secs),
            )),
            ..Default::default()
        }
    }

    fn states(sink: &CollectingSink) -> Vec<DeploymentState> {
        sink.statuses.lock().unwrap().iter().map(|s| s.state()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn applies_in_order_and_succeeds() {
        let cluster = Arc::new(FakeCluster {
            rollout_completes: true,
            ..Default::default()
        });
        let sink = Arc::new(CollectingSink::default());
        let req = request(
            &[
                json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg", "namespace": "ns"}}),
                json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "app", "namespace": "ns"}, "spec": {"replicas": 1}}),
            ],
            300,
        );

        handle_request(cluster.clone(), sink.clone(), req).await;

        assert_eq!(*cluster.applied.lock().unwrap(), vec!["cfg", "app"]);
        assert_eq!(
            states(&sink),
            vec![DeploymentState::InProgress, DeploymentState::Success]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_apply_error_fails_and_stops() {
        let cluster = Arc::new(FakeCluster {
            fail_on: Some("bad".into()),
            rollout_completes: true,
            ..Default::default()
        });
        let sink = Arc::new(CollectingSink::default());
        let req = request(
            &[
                json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "bad"}}),
                json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "after"}}),
            ],
            300,
        );

        handle_request(cluster.clone(), sink.clone(), req).await;

        // Nothing past the failing manifest is applied.
        assert!(cluster.applied.lock().unwrap().is_empty());
        assert_eq!(
            states(&sink),
            vec![DeploymentState::InProgress, DeploymentState::Failure]
        );
        let statuses = sink.statuses.lock().unwrap();
        let failure = statuses.last().unwrap();
        assert!(failure.message.contains("v1/ConfigMap bad"));
        assert!(failure.message.contains("rejected by admission"));
    }

    #[tokio::test(start_paused = true)]
    async fn undeclared_namespace_rollout_polls_the_client_default() {
        let cluster = Arc::new(FakeCluster {
            rollout_completes: true,
            default_namespace: "team-apps".into(),
            ..Default::default()
        });
        let sink = Arc::new(CollectingSink::default());
        let req = request(
            &[json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "app"}})],
            300,
        );

        handle_request(cluster.clone(), sink.clone(), req).await;

        let namespaces = cluster.rollout_namespaces.lock().unwrap();
        assert!(!namespaces.is_empty());
        assert!(namespaces.iter().all(|namespace| namespace == "team-apps"));
        assert_eq!(
            states(&sink),
            vec![DeploymentState::InProgress, DeploymentState::Success]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rollout_timeout_is_a_failure() {
        let cluster = Arc::new(FakeCluster::default());
        let sink = Arc::new(CollectingSink::default());
        let mut req = request(
            &[json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "app", "namespace": "ns"}})],
            300,
        );
        req.deadline = Some(protocol::to_timestamp(
            Utc::now() + chrono::Duration::milliseconds(200),
        ));

        handle_request(cluster, sink.clone(), req).await;

        assert_eq!(
            states(&sink),
            vec![DeploymentState::InProgress, DeploymentState::Failure]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_is_an_error_before_any_apply() {
        let cluster = Arc::new(FakeCluster {
            rollout_completes: true,
            ..Default::default()
        });
        let sink = Arc::new(CollectingSink::default());
        let req = request(
            &[json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg"}})],
            -10,
        );

        handle_request(cluster.clone(), sink.clone(), req).await;

        assert!(cluster.applied.lock().unwrap().is_empty());
        assert_eq!(states(&sink), vec![DeploymentState::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_status_is_emitted_exactly_once() {
        let cluster = Arc::new(FakeCluster {
            rollout_completes: true,
            ..Default::default()
        });
        let sink = Arc::new(CollectingSink::default());
        let req = request(
            &[json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg"}})],
            300,
        );

        handle_request(cluster, sink.clone(), req).await;

        let statuses = sink.statuses.lock().unwrap();
        let terminal = statuses.iter().filter(|s| s.is_finished()).count();
        assert_eq!(terminal, 1);
        assert!(statuses.last().unwrap().is_finished());
    }
}
