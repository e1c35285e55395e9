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
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use protocol::deployment::deploy_server::Deploy;
use protocol::deployment::{DeploymentRequest, DeploymentStatus};
use protocol::identities;

use crate::router::Router;
use crate::store::{created_time, Deployment, DeploymentResource, DeploymentStore, StatusRow};
use crate::ERR_DATABASE_UNAVAILABLE;

/// The requester-facing service: admits deployment requests and serves
/// per-request status streams.
pub struct DeployService {
    store: Arc<dyn DeploymentStore>,
    router: Arc<Router>,
    redirect: HashMap<String, String>,
}

impl DeployService {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        router: Arc<Router>,
        redirect: HashMap<String, String>,
    ) -> Self {
        DeployService {
            store,
            router,
            redirect,
        }
    }

    /// Persist the deployment and one row per manifest as a single logical
    /// unit of work. Any store failure is the retryable database-unavailable
    /// condition.
    async fn add_to_store(&self, request: &DeploymentRequest) -> Result<(), Status> {
        let manifests = request.manifests().map_err(|err| {
            Status::invalid_argument(format!("invalid resources in request: {err}"))
        })?;
        let identifiers = identities(&manifests).map_err(|err| {
            Status::invalid_argument(format!("invalid resources in request: {err}"))
        })?;

        for (index, identity) in identifiers.iter().enumerate() {
            info!(id = %request.id, index, resource = %identity, "identified resource");
        }

        let deployment = Deployment {
            id: request.id.clone(),
            team: request.team.clone(),
            cluster: request.cluster.clone(),
            created: created_time(request),
            repository: (!request.repository.is_empty()).then(|| request.repository.clone()),
        };
        self.store.write_deployment(deployment).await.map_err(|err| {
            error!(%err, "write deployment");
            Status::unavailable(ERR_DATABASE_UNAVAILABLE)
        })?;

        for (index, identity) in identifiers.into_iter().enumerate() {
            let resource = DeploymentResource {
                id: Uuid::new_v4().to_string(),
                deployment_id: request.id.clone(),
                index: index as i32,
                group: identity.group,
                version: identity.version,
                kind: identity.kind,
                name: identity.name,
                namespace: identity.namespace,
            };
            self.store.write_resource(resource).await.map_err(|err| {
                error!(%err, "write deployment resource");
                Status::unavailable(ERR_DATABASE_UNAVAILABLE)
            })?;
        }

        Ok(())
    }
}

#[tonic::async_trait]
impl Deploy for DeployService {
    async fn deploy(
        &self,
        request: Request<DeploymentRequest>,
    ) -> Result<Response<DeploymentStatus>, Status> {
        let mut request = request.into_inner();

        // A fresh submission has no id; a resubmission after server amnesia
        // keeps the id it was originally assigned.
        if request.id.is_empty() {
            request.id = Uuid::new_v4().to_string();
        }
        info!(
            id = %request.id,
            cluster = %request.cluster,
            team = %request.team,
            "received deployment request"
        );

        if let Some(target) = self.redirect.get(&request.cluster) {
            info!(from = %request.cluster, to = %target, "redirecting deployment");
            request.cluster = target.clone();
        }

        self.add_to_store(&request).await?;
        debug!(id = %request.id, "deployment committed to store");

        self.router
            .dispatch(request.clone())
            .await
            .map_err(|err| Status::unavailable(err.to_string()))?;

        let status = DeploymentStatus::queued(&request);
        if let Err(err) = self.store.write_status(StatusRow::from_status(&status)).await {
            error!(%err, "unable to persist deployment status");
        }
        self.router.publish(status.clone());

        Ok(Response::new(status))
    }

    type StatusStream = ReceiverStream<Result<DeploymentStatus, Status>>;

    async fn status(
        &self,
        request: Request<DeploymentRequest>,
    ) -> Result<Response<Self::StatusStream>, Status> {
        let request = request.into_inner();
        let id = request.id.clone();
        debug!(%id, "status stream opened");

        let (tx, rx) = mpsc::channel(16);

        // Subscribe before reading the persisted state so no transition can
        // fall between the two.
        let mut updates = self.router.subscribe();

        let latest = self
            .store
            .latest_status(&id)
            .await
            .map_err(|_| Status::unavailable(ERR_DATABASE_UNAVAILABLE))?;

        let mut finished = false;
        match latest {
            Some(row) => {
                finished = row.state.is_finished();
                let _ = tx.send(Ok(row.into_status(&request))).await;
            }
            None => {
                // Nothing persisted means this server has never seen the
                // request: tell the caller to resubmit.
                let _ = tx.send(Ok(DeploymentStatus::inactive(&request))).await;
            }
        }

        if !finished {
            tokio::spawn(async move {
                loop {
                    match updates.recv().await {
                        Ok(status) => {
                            if status.request_id() != id {
                                continue;
                            }
                            let terminal = status.is_finished();
                            if tx.send(Ok(status)).await.is_err() {
                                break;
                            }
                            if terminal {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%id, skipped, "status subscriber too slow; closing stream");
                            let _ = tx
                                .send(Err(Status::unavailable(
                                    "status stream lagged behind; please reconnect",
                                )))
                                .await;
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                debug!(%id, "status stream closed");
            });
        }

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
