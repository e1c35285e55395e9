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

use clap::Parser;
use tonic::transport::Server;
use tracing::info;

use dispatcher::config::Config;
use dispatcher::{DeployService, DispatchService, InMemoryStore, Router};
use protocol::deployment::deploy_server::DeployServer;
use protocol::deployment::dispatch_server::DispatchServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber)?;

    // Listener and routing state live in memory only; a restart forgets all
    // in-flight requests, and status streams for unknown ids answer with a
    // single `inactive` so requesters resubmit.
    let store: Arc<dyn dispatcher::DeploymentStore> = Arc::new(InMemoryStore::default());
    let router = Arc::new(Router::new());

    let deploy_service = DeployService::new(store.clone(), router.clone(), config.redirect_map());
    let dispatch_service = DispatchService::new(store, router);

    let (_, health_service) = tonic_health::server::health_reporter();

    info!("dispatcher listening on {}", config.listen_address);
    Server::builder()
        .add_service(health_service)
        .add_service(DeployServer::new(deploy_service))
        .add_service(DispatchServer::new(dispatch_service))
        .serve(config.listen_address)
        .await?;

    Ok(())
}
