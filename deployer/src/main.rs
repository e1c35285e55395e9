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
use std::time::Duration;

use clap::Parser;
use tonic::transport::Endpoint;
use tracing::{info, warn};

use deployer::config::Config;
use deployer::runner::GrpcStatusSink;
use deployer::{handle_request, ClusterClient, KubeClusterClient, StatusSink};
use protocol::deployment::dispatch_client::DispatchClient;
use protocol::deployment::Subscription;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber)?;

    let kube_client = kube::Client::try_default().await?;
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(kube_client));

    let channel = Endpoint::from_shared(config.dispatcher_url.clone())?.connect_lazy();
    let sink: Arc<dyn StatusSink> = Arc::new(GrpcStatusSink::new(DispatchClient::new(
        channel.clone(),
    )));

    loop {
        let mut dispatch = DispatchClient::new(channel.clone());
        match dispatch
            .deployments(Subscription {
                cluster: config.cluster.clone(),
            })
            .await
        {
            Ok(response) => {
                info!(cluster = %config.cluster, "subscribed to dispatcher");
                let mut deployments = response.into_inner();
                loop {
                    match deployments.message().await {
                        Ok(Some(request)) => {
                            info!(id = %request.id, "deployment request received");
                            tokio::spawn(handle_request(cluster.clone(), sink.clone(), request));
                        }
                        Ok(None) => {
                            warn!("dispatcher closed the deployment stream");
                            break;
                        }
                        Err(status) => {
                            warn!(%status, "deployment stream failed");
                            break;
                        }
                    }
                }
            }
            Err(status) => {
                warn!(%status, "unable to subscribe to dispatcher");
            }
        }
        tokio::time::sleep(RECONNECT_INTERVAL).await;
    }
}
