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

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use protocol::deployment::{DeploymentRequest, DeploymentState, DeploymentStatus};
use protocol::{from_timestamp, to_timestamp};

/// One admitted deployment request.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: String,
    pub team: String,
    pub cluster: String,
    pub created: DateTime<Utc>,
    pub repository: Option<String>,
}

/// One manifest of a deployment, in request order.
#[derive(Debug, Clone)]
pub struct DeploymentResource {
    pub id: String,
    pub deployment_id: String,
    pub index: i32,
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

/// One state transition of a deployment.
#[derive(Debug, Clone)]
pub struct StatusRow {
    pub deployment_id: String,
    pub state: DeploymentState,
    pub message: String,
    pub created: DateTime<Utc>,
}

impl StatusRow {
    pub fn from_status(status: &DeploymentStatus) -> Self {
        StatusRow {
            deployment_id: status.request_id().to_string(),
            state: status.state(),
            message: status.message.clone(),
            created: status.status_time().unwrap_or_else(Utc::now),
        }
    }

    /// Rehydrate a wire status from a persisted row; the request is the one
    /// the caller presented on the status stream.
    pub fn into_status(self, request: &DeploymentRequest) -> DeploymentStatus {
        DeploymentStatus {
            request: Some(request.clone()),
            state: self.state as i32,
            message: self.message,
            time: Some(to_timestamp(self.created)),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The persistence seam. The relational store behind it is an external
/// collaborator; everything in this crate talks to this trait only.
#[async_trait]
pub trait DeploymentStore: Send + Sync + 'static {
    async fn write_deployment(&self, deployment: Deployment) -> Result<(), StoreError>;
    async fn write_resource(&self, resource: DeploymentResource) -> Result<(), StoreError>;
    async fn write_status(&self, status: StatusRow) -> Result<(), StoreError>;
    async fn latest_status(&self, deployment_id: &str) -> Result<Option<StatusRow>, StoreError>;
}

#[derive(Default)]
struct Tables {
    deployments: HashMap<String, Deployment>,
    resources: HashMap<String, Vec<DeploymentResource>>,
    statuses: HashMap<String, Vec<StatusRow>>,
}

/// Map-backed store used by the binary and the tests.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub async fn deployment(&self, id: &str) -> Option<Deployment> {
        self.tables.read().await.deployments.get(id).cloned()
    }

    pub async fn resources(&self, deployment_id: &str) -> Vec<DeploymentResource> {
        self.tables
            .read()
            .await
            .resources
            .get(deployment_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeploymentStore for InMemoryStore {
    async fn write_deployment(&self, deployment: Deployment) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.deployments.insert(deployment.id.clone(), deployment);
        Ok(())
    }

    async fn write_resource(&self, resource: DeploymentResource) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .resources
            .entry(resource.deployment_id.clone())
            .or_default()
            .push(resource);
        Ok(())
    }

    async fn write_status(&self, status: StatusRow) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .statuses
            .entry(status.deployment_id.clone())
            .or_default()
            .push(status);
        Ok(())
    }

    async fn latest_status(&self, deployment_id: &str) -> Result<Option<StatusRow>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .statuses
            .get(deployment_id)
            .and_then(|rows| rows.last())
            .cloned())
    }
}

/// Sanity check used when admitting requests: the request timestamp wins
/// when present, the admission time otherwise.
pub fn created_time(request: &DeploymentRequest) -> DateTime<Utc> {
    request
        .time
        .as_ref()
        .and_then(from_timestamp)
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::deployment::DeploymentRequest;

    fn row(id: &str, state: DeploymentState, secs: i64) -> StatusRow {
        StatusRow {
            deployment_id: id.to_string(),
            state,
            message: "m".into(),
            created: chrono::TimeZone::timestamp_opt(&Utc, secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn deployments_and_resources_read_back_what_was_written() {
        let store = InMemoryStore::default();
        store
            .write_deployment(Deployment {
                id: "r1".into(),
                team: "t-platform".into(),
                cluster: "c1".into(),
                created: Utc::now(),
                repository: Some("org/repo".into()),
            })
            .await
            .unwrap();
        store
            .write_resource(DeploymentResource {
                id: "res-1".into(),
                deployment_id: "r1".into(),
                index: 0,
                group: "apps".into(),
                version: "v1".into(),
                kind: "Deployment".into(),
                name: "api".into(),
                namespace: "ns".into(),
            })
            .await
            .unwrap();

        let deployment = store.deployment("r1").await.unwrap();
        assert_eq!(deployment.cluster, "c1");
        let resources = store.resources("r1").await;
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].kind, "Deployment");
        assert!(store.deployment("r9").await.is_none());
    }

    #[tokio::test]
    async fn latest_status_returns_most_recent_write() {
        let store = InMemoryStore::default();
        store
            .write_status(row("r1", DeploymentState::Queued, 1))
            .await
            .unwrap();
        store
            .write_status(row("r1", DeploymentState::InProgress, 2))
            .await
            .unwrap();
        store
            .write_status(row("r2", DeploymentState::Queued, 3))
            .await
            .unwrap();

        let latest = store.latest_status("r1").await.unwrap().unwrap();
        assert_eq!(latest.state, DeploymentState::InProgress);
        assert!(store.latest_status("r9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_row_round_trips_through_the_wire_type() {
        let request = DeploymentRequest {
            id: "r1".into(),
            ..Default::default()
        };
        let wire = row("r1", DeploymentState::Success, 42).into_status(&request);
        assert_eq!(wire.state(), DeploymentState::Success);
        assert_eq!(wire.request_id(), "r1");
        assert_eq!(wire.status_time().unwrap().timestamp(), 42);
    }
}
