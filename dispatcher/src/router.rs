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

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use protocol::deployment::{DeploymentRequest, DeploymentStatus};

/// Capacity of each per-cluster mailbox and of the pending queue that backs
/// it while no agent is registered. Overflow is a typed error, never a
/// blocked producer.
pub const MAILBOX_CAPACITY: usize = 16;

const BROADCAST_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("deployment queue for cluster '{cluster}' is full; try again later")]
    QueueFull { cluster: String },
}

/// Owns the only shared mutable state of the server: the agent registry and
/// the per-cluster pending queues. Locks guard map mutation only and are
/// never held across I/O.
pub struct Router {
    agents: Mutex<HashMap<String, mpsc::Sender<DeploymentRequest>>>,
    pending: Mutex<HashMap<String, VecDeque<DeploymentRequest>>>,
    statuses: broadcast::Sender<DeploymentStatus>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        let (statuses, _) = broadcast::channel(BROADCAST_CAPACITY);
        Router {
            agents: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            statuses,
        }
    }

    /// Register the active agent for a cluster, displacing any prior
    /// registration (last writer wins). Requests queued while no agent was
    /// connected are drained into the fresh mailbox.
    pub async fn register_agent(&self, cluster: &str) -> mpsc::Receiver<DeploymentRequest> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

        {
            let mut pending = self.pending.lock().await;
            if let Some(queue) = pending.get_mut(cluster) {
                while let Some(request) = queue.pop_front() {
                    match tx.try_send(request) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(request)) => {
                            queue.push_front(request);
                            break;
                        }
                        Err(mpsc::error::TrySendError::Closed(request)) => {
                            queue.push_front(request);
                            break;
                        }
                    }
                }
            }
        }

        let prior = self.agents.lock().await.insert(cluster.to_string(), tx);
        if prior.is_some() {
            info!(%cluster, "displacing previous agent registration");
        } else {
            info!(%cluster, "agent registered");
        }
        rx
    }

    /// Route a request to its cluster's agent, or park it in the bounded
    /// pending queue until one registers.
    pub async fn dispatch(&self, request: DeploymentRequest) -> Result<(), RouterError> {
        let cluster = request.cluster.clone();

        let mailbox = self.agents.lock().await.get(&cluster).cloned();
        let Some(mailbox) = mailbox else {
            return self.park(cluster, request).await;
        };

        match mailbox.try_send(request) {
            Ok(()) => {
                debug!(%cluster, "request handed to agent mailbox");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%cluster, "agent mailbox full");
                Err(RouterError::QueueFull { cluster })
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                // The agent went away without being displaced; drop the dead
                // registration unless a new agent has already taken over.
                let mut agents = self.agents.lock().await;
                if agents.get(&cluster).is_some_and(|sender| sender.is_closed()) {
                    agents.remove(&cluster);
                }
                drop(agents);
                self.park(cluster, request).await
            }
        }
    }

    async fn park(&self, cluster: String, request: DeploymentRequest) -> Result<(), RouterError> {
        let mut pending = self.pending.lock().await;
        let queue = pending.entry(cluster.clone()).or_default();
        if queue.len() >= MAILBOX_CAPACITY {
            warn!(%cluster, "pending queue full");
            return Err(RouterError::QueueFull { cluster });
        }
        debug!(%cluster, queued = queue.len() + 1, "no agent connected; request parked");
        queue.push_back(request);
        Ok(())
    }

    /// Publish a status to every active subscriber. Statuses for one request
    /// id keep their publish order; there is no ordering across requests.
    pub fn publish(&self, status: DeploymentStatus) {
        // send only fails when nobody is subscribed, which is fine.
        let _ = self.statuses.send(status);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentStatus> {
        self.statuses.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::deployment::DeploymentStatus;

    fn request(id: &str, cluster: &str) -> DeploymentRequest {
        DeploymentRequest {
            id: id.to_string(),
            cluster: cluster.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dispatch_reaches_registered_agent() {
        let router = Router::new();
        let mut mailbox = router.register_agent("c1").await;
        router.dispatch(request("r1", "c1")).await.unwrap();
        assert_eq!(mailbox.recv().await.unwrap().id, "r1");
    }

    #[tokio::test]
    async fn dispatch_without_agent_parks_until_registration() {
        let router = Router::new();
        router.dispatch(request("r1", "c1")).await.unwrap();
        router.dispatch(request("r2", "c1")).await.unwrap();

        let mut mailbox = router.register_agent("c1").await;
        assert_eq!(mailbox.recv().await.unwrap().id, "r1");
        assert_eq!(mailbox.recv().await.unwrap().id, "r2");
    }

    #[tokio::test]
    async fn pending_queue_overflow_is_an_error() {
        let router = Router::new();
        for i in 0..MAILBOX_CAPACITY {
            router
                .dispatch(request(&format!("r{i}"), "c9"))
                .await
                .unwrap();
        }
        let err = router.dispatch(request("overflow", "c9")).await.unwrap_err();
        assert!(matches!(err, RouterError::QueueFull { .. }));
    }

    #[tokio::test]
    async fn reregistration_displaces_prior_agent() {
        let router = Router::new();
        let mut first = router.register_agent("c1").await;
        let mut second = router.register_agent("c1").await;

        router.dispatch(request("r1", "c1")).await.unwrap();
        assert_eq!(second.recv().await.unwrap().id, "r1");
        // The first mailbox's sender was dropped by the displacement.
        assert!(first.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_mailbox_falls_back_to_pending() {
        let router = Router::new();
        let mailbox = router.register_agent("c1").await;
        drop(mailbox);

        router.dispatch(request("r1", "c1")).await.unwrap();
        let mut mailbox = router.register_agent("c1").await;
        assert_eq!(mailbox.recv().await.unwrap().id, "r1");
    }

    #[tokio::test]
    async fn statuses_fan_out_to_all_subscribers_in_order() {
        let router = Router::new();
        let mut first = router.subscribe();
        let mut second = router.subscribe();

        let req = request("r1", "c1");
        router.publish(DeploymentStatus::queued(&req));
        router.publish(DeploymentStatus::in_progress(&req));

        for sub in [&mut first, &mut second] {
            assert_eq!(
                sub.recv().await.unwrap().state(),
                protocol::deployment::DeploymentState::Queued
            );
            assert_eq!(
                sub.recv().await.unwrap().state(),
                protocol::deployment::DeploymentState::InProgress
            );
        }
    }
}
