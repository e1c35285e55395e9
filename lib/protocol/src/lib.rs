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

pub mod deployment;
mod identity;

pub use identity::{identities, identity_of, IdentityError, ResourceIdentity};

use chrono::{DateTime, TimeZone, Utc};
use prost_types::Timestamp;
use thiserror::Error;

use deployment::{DeploymentRequest, DeploymentState, DeploymentStatus, Payload};

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("manifest {index} is not valid JSON: {source}")]
    InvalidJson {
        index: usize,
        source: serde_json::Error,
    },
}

/// Current wall-clock time as a protobuf timestamp.
pub fn timestamp_now() -> Timestamp {
    to_timestamp(Utc::now())
}

pub fn to_timestamp(time: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: time.timestamp(),
        nanos: time.timestamp_subsec_nanos() as i32,
    }
}

pub fn from_timestamp(timestamp: &Timestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(timestamp.seconds, timestamp.nanos as u32)
        .single()
}

impl DeploymentState {
    /// Terminal states are absorbing: no further status may be emitted for
    /// a request once one of these has been reported.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            DeploymentState::Success | DeploymentState::Failure | DeploymentState::Error
        )
    }

    pub fn emoji(&self) -> char {
        match self {
            DeploymentState::Pending => '🕒',
            DeploymentState::Queued => '📬',
            DeploymentState::InProgress => '⏳',
            DeploymentState::Success => '✅',
            DeploymentState::Failure => '❌',
            DeploymentState::Error => '🚨',
            DeploymentState::Inactive => '💤',
        }
    }
}

impl Payload {
    /// Wrap a set of JSON manifests into a wire payload, preserving order.
    pub fn from_json_resources(resources: &[serde_json::Value]) -> Self {
        Payload {
            resources: resources
                .iter()
                .map(|doc| doc.to_string().into_bytes())
                .collect(),
        }
    }
}

impl DeploymentRequest {
    /// Decode the payload back into ordered JSON manifests.
    pub fn manifests(&self) -> Result<Vec<serde_json::Value>, PayloadError> {
        let resources = match &self.payload {
            Some(payload) => payload.resources.as_slice(),
            None => &[],
        };
        resources
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                serde_json::from_slice(raw).map_err(|source| PayloadError::InvalidJson { index, source })
            })
            .collect()
    }

    pub fn created_time(&self) -> Option<DateTime<Utc>> {
        self.time.as_ref().and_then(from_timestamp)
    }

    pub fn deadline_time(&self) -> Option<DateTime<Utc>> {
        self.deadline.as_ref().and_then(from_timestamp)
    }
}

impl DeploymentStatus {
    fn transition(
        request: &DeploymentRequest,
        state: DeploymentState,
        message: impl Into<String>,
    ) -> Self {
        DeploymentStatus {
            request: Some(request.clone()),
            state: state as i32,
            message: message.into(),
            time: Some(timestamp_now()),
        }
    }

    pub fn queued(request: &DeploymentRequest) -> Self {
        Self::transition(
            request,
            DeploymentState::Queued,
            "deployment request has been put in queue for further processing",
        )
    }

    pub fn in_progress(request: &DeploymentRequest) -> Self {
        Self::transition(
            request,
            DeploymentState::InProgress,
            "deployment is under way",
        )
    }

    pub fn success(request: &DeploymentRequest) -> Self {
        Self::transition(
            request,
            DeploymentState::Success,
            "deployment completed successfully",
        )
    }

    pub fn failure(request: &DeploymentRequest, message: impl Into<String>) -> Self {
        Self::transition(request, DeploymentState::Failure, message)
    }

    pub fn error(request: &DeploymentRequest, message: impl Into<String>) -> Self {
        Self::transition(request, DeploymentState::Error, message)
    }

    pub fn inactive(request: &DeploymentRequest) -> Self {
        Self::transition(
            request,
            DeploymentState::Inactive,
            "deployment request is not active on this server; please resubmit",
        )
    }

    /// The id of the request this transition refers to.
    pub fn request_id(&self) -> &str {
        self.request.as_ref().map(|r| r.id.as_str()).unwrap_or("")
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    pub fn status_time(&self) -> Option<DateTime<Utc>> {
        self.time.as_ref().and_then(from_timestamp)
    }
}
