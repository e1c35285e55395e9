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

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{error, info};

use protocol::deployment::dispatch_server::Dispatch;
use protocol::deployment::{DeploymentRequest, DeploymentStatus, ReportStatusResponse, Subscription};

use crate::router::Router;
use crate::store::{DeploymentStore, StatusRow};
use crate::ERR_DATABASE_UNAVAILABLE;

/// The agent-facing service: cluster agents subscribe for routed requests
/// and push state transitions back.
pub struct DispatchService {
    store: Arc<dyn DeploymentStore>,
    router: Arc<Router>,
}

impl DispatchService {
    pub fn new(store: Arc<dyn DeploymentStore>, router: Arc<Router>) -> Self {
        DispatchService { store, router }
    }
}

#[tonic::async_trait]
impl Dispatch for DispatchService {
    type DeploymentsStream =
        Pin<Box<dyn Stream<Item = Result<DeploymentRequest, Status>> + Send + 'static>>;

    async fn deployments(
        &self,
        request: Request<Subscription>,
    ) -> Result<Response<Self::DeploymentsStream>, Status> {
        let subscription = request.into_inner();
        if subscription.cluster.is_empty() {
            return Err(Status::invalid_argument("cluster label is required"));
        }
        info!(cluster = %subscription.cluster, "agent subscribed for deployments");

        let mailbox = self.router.register_agent(&subscription.cluster).await;
        let stream = ReceiverStream::new(mailbox).map(Ok);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn report_status(
        &self,
        request: Request<DeploymentStatus>,
    ) -> Result<Response<ReportStatusResponse>, Status> {
        let status = request.into_inner();
        info!(
            id = %status.request_id(),
            state = %status.state().as_str_name(),
            message = %status.message,
            "deployment status reported"
        );

        self.store
            .write_status(StatusRow::from_status(&status))
            .await
            .map_err(|err| {
                error!(%err, "write deployment status");
                Status::unavailable(ERR_DATABASE_UNAVAILABLE)
            })?;

        self.router.publish(status);
        Ok(Response::new(ReportStatusResponse {}))
    }
}
