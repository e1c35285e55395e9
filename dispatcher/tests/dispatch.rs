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

use chrono::Utc;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::Code;

use dispatcher::{DeployService, DeploymentStore, DispatchService, InMemoryStore, Router};
use protocol::deployment::deploy_client::DeployClient;
use protocol::deployment::deploy_server::DeployServer;
use protocol::deployment::dispatch_client::DispatchClient;
use protocol::deployment::dispatch_server::DispatchServer;
use protocol::deployment::{DeploymentRequest, DeploymentState, Payload, Subscription};

async fn start_server(redirects: HashMap<String, String>) -> String {
    let store: Arc<dyn DeploymentStore> = Arc::new(InMemoryStore::default());
    let router = Arc::new(Router::new());

    let deploy = DeployService::new(store.clone(), router.clone(), redirects);
    let dispatch = DispatchService::new(store, router);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        Server::builder()
            .add_service(DeployServer::new(deploy))
            .add_service(DispatchServer::new(dispatch))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    format!("http://{addr}")
}

fn sample_request(cluster: &str) -> DeploymentRequest {
    let manifest = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "api", "namespace": "ns-platform"},
        "spec": {"replicas": 1},
    });
    DeploymentRequest {
        cluster: cluster.to_string(),
        team: "t-platform".to_string(),
        payload: Some(Payload::from_json_resources(&[manifest])),
        time: Some(protocol::timestamp_now()),
        deadline: Some(protocol::to_timestamp(Utc::now() + chrono::Duration::minutes(10))),
        ..Default::default()
    }
}

#[tokio::test]
async fn happy_path_streams_queued_through_success() {
    let url = start_server(HashMap::new()).await;

    let mut agent = DispatchClient::connect(url.clone()).await.unwrap();
    let mut deployments = agent
        .deployments(Subscription {
            cluster: "c1".to_string(),
        })
        .await
        .unwrap()
        .into_inner();

    let mut requester = DeployClient::connect(url.clone()).await.unwrap();
    let queued = requester
        .deploy(sample_request("c1"))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(queued.state(), DeploymentState::Queued);
    let id = queued.request_id().to_string();
    assert!(!id.is_empty());

    let routed = deployments.message().await.unwrap().unwrap();
    assert_eq!(routed.id, id);
    assert_eq!(routed.cluster, "c1");

    let mut statuses = requester
        .status(DeploymentRequest {
            id: id.clone(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();

    // The most recent persisted status is replayed first.
    let first = statuses.message().await.unwrap().unwrap();
    assert_eq!(first.state(), DeploymentState::Queued);

    agent
        .report_status(protocol::deployment::DeploymentStatus::in_progress(&routed))
        .await
        .unwrap();
    agent
        .report_status(protocol::deployment::DeploymentStatus::success(&routed))
        .await
        .unwrap();

    let second = statuses.message().await.unwrap().unwrap();
    assert_eq!(second.state(), DeploymentState::InProgress);
    let third = statuses.message().await.unwrap().unwrap();
    assert_eq!(third.state(), DeploymentState::Success);

    // Terminal state closes the stream; nothing follows.
    assert!(statuses.message().await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_request_id_yields_a_single_inactive_status() {
    let url = start_server(HashMap::new()).await;
    let mut requester = DeployClient::connect(url).await.unwrap();

    let mut statuses = requester
        .status(DeploymentRequest {
            id: "ghost".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();

    let first = statuses.message().await.unwrap().unwrap();
    assert_eq!(first.state(), DeploymentState::Inactive);
}

#[tokio::test]
async fn resubmission_after_amnesia_keeps_the_request_id() {
    let url = start_server(HashMap::new()).await;
    let mut requester = DeployClient::connect(url).await.unwrap();

    // The requester was mid-stream when the server restarted; its stream on
    // the fresh server starts with the amnesia signal.
    let mut resubmission = sample_request("c1");
    resubmission.id = "r-original".to_string();

    let mut statuses = requester
        .status(DeploymentRequest {
            id: "r-original".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    let first = statuses.message().await.unwrap().unwrap();
    assert_eq!(first.state(), DeploymentState::Inactive);

    let queued = requester.deploy(resubmission).await.unwrap().into_inner();
    assert_eq!(queued.request_id(), "r-original");

    // The already-open stream picks the resubmitted request back up.
    let second = statuses.message().await.unwrap().unwrap();
    assert_eq!(second.state(), DeploymentState::Queued);
    assert_eq!(second.request_id(), "r-original");
}

#[tokio::test]
async fn deploys_for_unattended_cluster_queue_until_overflow() {
    let url = start_server(HashMap::new()).await;
    let mut requester = DeployClient::connect(url).await.unwrap();

    for _ in 0..16 {
        requester.deploy(sample_request("c9")).await.unwrap();
    }
    let err = requester.deploy(sample_request("c9")).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
}

#[tokio::test]
async fn accepted_deploys_get_distinct_ids() {
    let url = start_server(HashMap::new()).await;
    let mut requester = DeployClient::connect(url).await.unwrap();

    let first = requester
        .deploy(sample_request("c1"))
        .await
        .unwrap()
        .into_inner();
    let second = requester
        .deploy(sample_request("c1"))
        .await
        .unwrap()
        .into_inner();
    assert_ne!(first.request_id(), second.request_id());
}

#[tokio::test]
async fn cluster_redirects_apply_before_routing() {
    let redirects = HashMap::from([("c-old".to_string(), "c-new".to_string())]);
    let url = start_server(redirects).await;

    let mut agent = DispatchClient::connect(url.clone()).await.unwrap();
    let mut deployments = agent
        .deployments(Subscription {
            cluster: "c-new".to_string(),
        })
        .await
        .unwrap()
        .into_inner();

    let mut requester = DeployClient::connect(url).await.unwrap();
    let queued = requester
        .deploy(sample_request("c-old"))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(queued.request.as_ref().unwrap().cluster, "c-new");

    let routed = deployments.message().await.unwrap().unwrap();
    assert_eq!(routed.cluster, "c-new");
}

#[tokio::test]
async fn malformed_payload_is_rejected_up_front() {
    let url = start_server(HashMap::new()).await;
    let mut requester = DeployClient::connect(url).await.unwrap();

    let mut request = sample_request("c1");
    request.payload = Some(Payload {
        resources: vec![b"{not json".to_vec()],
    });

    let err = requester.deploy(request).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}
