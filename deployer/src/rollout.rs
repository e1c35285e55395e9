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

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use thiserror::Error;
use tracing::{debug, warn};

use crate::applier::ClusterClient;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum RolloutError {
    #[error("timeout while waiting for deployment {namespace}/{name} to roll out")]
    Timeout { namespace: String, name: String },
}

fn resource_version(deployment: &Deployment) -> u64 {
    deployment
        .metadata
        .resource_version
        .as_deref()
        .and_then(|version| version.parse().ok())
        .unwrap_or(0)
}

/// A deployment has finished rolling out once every desired replica is
/// updated, ready and available, and the control plane has observed the
/// spec generation.
pub fn rollout_complete(deployment: &Deployment) -> bool {
    let Some(status) = &deployment.status else {
        return false;
    };
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let generation = deployment.metadata.generation.unwrap_or(0);

    status.updated_replicas.unwrap_or(0) == desired
        && status.replicas.unwrap_or(0) == desired
        && status.ready_replicas.unwrap_or(0) == desired
        && status.available_replicas.unwrap_or(0) == desired
        && status.observed_generation.unwrap_or(0) >= generation
}

/// Poll the named deployment until it completes a rollout or the deadline
/// passes. Completion additionally requires that the resource-version has
/// advanced past the baseline recorded up front, proving the control plane
/// accepted a new generation. An object missing at baseline counts as
/// version 0, so the first read of a fresh create registers as an advance.
/// Transient read errors never terminate the wait; only the deadline does.
pub async fn wait_for_rollout(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    deadline: DateTime<Utc>,
) -> Result<(), RolloutError> {
    let mut baseline: u64 = 0;
    while Utc::now() < deadline {
        match client.read_rollout(namespace, name).await {
            Ok(Some(current)) => {
                baseline = resource_version(&current);
                debug!(%namespace, %name, baseline, "recorded rollout baseline");
                break;
            }
            Ok(None) => {
                debug!(%namespace, %name, "deployment not present in the cluster yet");
                break;
            }
            Err(err) => {
                warn!(%namespace, %name, %err, "reading rollout baseline");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }

    let mut advanced = false;
    while Utc::now() < deadline {
        match client.read_rollout(namespace, name).await {
            Ok(Some(current)) => {
                let version = resource_version(&current);
                if version > baseline {
                    debug!(%namespace, %name, version, "new deployment generation appeared");
                    baseline = version;
                    advanced = true;
                }
                if advanced && rollout_complete(&current) {
                    return Ok(());
                }
                if let Some(status) = &current.status {
                    debug!(
                        %namespace,
                        %name,
                        replicas = status.replicas.unwrap_or(0),
                        updated = status.updated_replicas.unwrap_or(0),
                        available = status.available_replicas.unwrap_or(0),
                        observed_generation = status.observed_generation.unwrap_or(0),
                        "still waiting for rollout to finish"
                    );
                }
            }
            Ok(None) => {
                debug!(%namespace, %name, "deployment not present in the cluster yet");
            }
            Err(err) => {
                warn!(%namespace, %name, %err, "transient error while watching rollout");
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    Err(RolloutError::Timeout {
        namespace: namespace.to_string(),
        name: name.to_string(),
    })
}
