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

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tonic::metadata::MetadataValue;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;
use tonic::{Code, Status, Streaming};
use tracing::{info, warn};

use protocol::deployment::deploy_client::DeployClient;
use protocol::deployment::{DeploymentRequest, DeploymentState, DeploymentStatus};

use crate::config::Config;
use crate::error::{Error, ExitCode};

/// Attaches the requester's credentials to every outgoing call.
#[derive(Clone)]
pub struct AuthInterceptor {
    api_key: Option<MetadataValue<tonic::metadata::Ascii>>,
    bearer: Option<MetadataValue<tonic::metadata::Ascii>>,
}

impl AuthInterceptor {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let api_key = config
            .apikey
            .as_deref()
            .map(|key| {
                key.parse().map_err(|_| {
                    Error::new(ExitCode::InvocationFailure, "API key is not valid metadata")
                })
            })
            .transpose()?;
        let bearer = config
            .github_token
            .as_deref()
            .map(|token| {
                format!("Bearer {token}").parse().map_err(|_| {
                    Error::new(
                        ExitCode::InvocationFailure,
                        "GitHub token is not valid metadata",
                    )
                })
            })
            .transpose()?;
        Ok(AuthInterceptor { api_key, bearer })
    }
}

impl tonic::service::Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        if let Some(key) = &self.api_key {
            request.metadata_mut().insert("x-api-key", key.clone());
        }
        if let Some(bearer) = &self.bearer {
            request.metadata_mut().insert("authorization", bearer.clone());
        }
        Ok(request)
    }
}

pub type AuthedDeployClient = DeployClient<InterceptedService<Channel, AuthInterceptor>>;

/// Transient transport failures and server bugs are retryable; everything
/// else is final.
pub fn retriable(status: &Status) -> bool {
    matches!(status.code(), Code::Unavailable | Code::Internal)
}

fn format_grpc_error(status: &Status) -> String {
    format!("server: {:?}: {}", status.code(), status.message())
}

fn time_left(deadline: DateTime<Utc>) -> Option<Duration> {
    (deadline - Utc::now()).to_std().ok()
}

/// Call `operation` until it succeeds, sleeping `interval` between attempts
/// while `retry` is set and the failure is retryable. With `retry` unset
/// the first failure is final. The deadline is observed on every iteration:
/// a hung call is cut off, and no attempt or sleep outlives it. Expiry
/// surfaces as `deadline_exceeded`.
pub async fn retry_unavailable<T, F, Fut>(
    deadline: DateTime<Utc>,
    interval: Duration,
    retry: bool,
    mut operation: F,
) -> Result<T, Status>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Status>>,
{
    loop {
        let Some(remaining) = time_left(deadline) else {
            return Err(Status::deadline_exceeded("deployment deadline exceeded"));
        };
        let attempt = match tokio::time::timeout(remaining, operation()).await {
            Ok(attempt) => attempt,
            Err(_) => return Err(Status::deadline_exceeded("deployment deadline exceeded")),
        };
        match attempt {
            Err(status) if retry && retriable(&status) => {
                warn!(
                    "{} (retrying in {}s...)",
                    format_grpc_error(&status),
                    interval.as_secs()
                );
                let nap = time_left(deadline)
                    .map(|left| left.min(interval))
                    .unwrap_or(Duration::ZERO);
                tokio::time::sleep(nap).await;
            }
            other => return other,
        }
    }
}

fn log_status(status: &DeploymentStatus) {
    info!(
        "{} {}: {}",
        status.state().emoji(),
        status.state().as_str_name().to_lowercase(),
        status.message
    );
}

fn finalize(request_id: &str, status: &DeploymentStatus) -> Result<(), Error> {
    log_status(status);
    info!("final deployment status:");
    info!("---");
    info!("id.......: {}", request_id);
    info!("state....: {}", status.state().as_str_name().to_lowercase());
    info!("message..: {}", status.message);
    info!("---");
    match ExitCode::from_terminal_state(status.state()) {
        ExitCode::Success => Ok(()),
        code => Err(Error::new(
            code,
            format!("deployment {}: {}", status.state().as_str_name().to_lowercase(), status.message),
        )),
    }
}

fn logs_url(config: &Config, id: &str) -> String {
    format!(
        "{}/logs?delivery_id={}",
        config.deploy_server_url.trim_end_matches('/'),
        id
    )
}

pub struct Deployer {
    pub client: AuthedDeployClient,
}

impl Deployer {
    /// Submit the request with retry discipline and return the accepted
    /// status.
    async fn send(
        &mut self,
        config: &Config,
        environment: &str,
        deadline: DateTime<Utc>,
        request: &DeploymentRequest,
    ) -> Result<DeploymentStatus, Error> {
        let interval = Duration::from_secs(config.retry_interval);
        let result = retry_unavailable(deadline, interval, config.retry, || {
            let mut client = self.client.clone();
            let request = request.clone();
            async move { client.deploy(request).await.map(|response| response.into_inner()) }
        })
        .await;

        match result {
            Ok(status) => {
                info!(
                    "deployment request accepted and dispatched to cluster '{}'",
                    status
                        .request
                        .as_ref()
                        .map(|r| r.cluster.as_str())
                        .unwrap_or_default()
                );
                Ok(status)
            }
            Err(status) if status.code() == Code::DeadlineExceeded => Err(Error::new(
                ExitCode::Timeout,
                format!("deployment timed out: {}", status.message()),
            )),
            Err(status) => {
                if status.code() == Code::Unauthenticated
                    && !environment.ends_with(&format!(":{}", request.team))
                {
                    warn!(
                        "hint: team '{}' does not match the namespace in '{}'",
                        request.team, environment
                    );
                }
                // A transient rejection that the caller chose not to retry
                // keeps its transport meaning; anything else means the
                // server refused the deployment outright.
                let code = if retriable(&status) {
                    ExitCode::Unavailable
                } else {
                    ExitCode::NoDeployment
                };
                Err(Error::new(code, format_grpc_error(&status)))
            }
        }
    }

    async fn open_stream(
        &mut self,
        config: &Config,
        deadline: DateTime<Utc>,
        request: &DeploymentRequest,
        connection_lost: &mut bool,
    ) -> Result<Streaming<DeploymentStatus>, Error> {
        let interval = Duration::from_secs(config.retry_interval);
        let result = retry_unavailable(deadline, interval, config.retry, || {
            let mut client = self.client.clone();
            let request = request.clone();
            async move { client.status(request).await.map(|response| response.into_inner()) }
        })
        .await;

        match result {
            Ok(stream) => {
                if *connection_lost {
                    info!("connection to the deploy server re-established");
                    *connection_lost = false;
                }
                Ok(stream)
            }
            Err(status) if status.code() == Code::DeadlineExceeded => Err(Error::new(
                ExitCode::Timeout,
                format!("deployment timed out: {}", status.message()),
            )),
            Err(status) => Err(Error::new(
                ExitCode::Unavailable,
                format_grpc_error(&status),
            )),
        }
    }

    /// Drive the deployment: submit, optionally stream until terminal,
    /// resubmitting on server amnesia and reconnecting on transient errors.
    pub async fn run(
        &mut self,
        config: &Config,
        environment: &str,
        mut request: DeploymentRequest,
    ) -> Result<(), Error> {
        info!(
            "sending deployment request to the deploy server at {}...",
            config.deploy_server_url
        );

        // The request deadline bounds everything that follows, including the
        // very first submission attempt.
        let deadline = request
            .deadline_time()
            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(config.timeout as i64));

        let mut status = self.send(config, environment, deadline, &request).await?;
        request.id = status.request_id().to_string();

        info!("deployment information:");
        info!("---");
        info!("id...........: {}", request.id);
        if !config.tracing_dashboard_url.is_empty() {
            info!(
                "tracing......: {}{}",
                config.tracing_dashboard_url, request.trace_parent
            );
        }
        info!("debug logs...: {}", logs_url(config, &request.id));
        info!("deadline.....: {}", deadline);
        info!("---");

        if status.is_finished() {
            return finalize(&request.id, &status);
        }
        if !config.wait {
            log_status(&status);
            return Ok(());
        }

        info!("waiting for deployment to complete...");
        let mut connection_lost = false;

        while Utc::now() < deadline {
            let mut stream = self
                .open_stream(config, deadline, &request, &mut connection_lost)
                .await?;

            loop {
                let Some(remaining) = time_left(deadline) else {
                    break;
                };
                // A stalled stream must not outlive the deadline.
                let message = match tokio::time::timeout(remaining, stream.message()).await {
                    Ok(message) => message,
                    Err(_) => {
                        return Err(Error::new(ExitCode::Timeout, "deployment timed out"));
                    }
                };
                match message {
                    Ok(Some(received)) => {
                        log_status(&received);
                        status = received;
                        if status.state() == DeploymentState::Inactive {
                            warn!("the deploy server has restarted; re-sending deployment request...");
                            self.send(config, environment, deadline, &request).await?;
                        } else if status.is_finished() {
                            return finalize(&request.id, &status);
                        }
                    }
                    Ok(None) => {
                        // Server closed the stream without a terminal state.
                        connection_lost = true;
                        break;
                    }
                    Err(received) => {
                        connection_lost = true;
                        if config.retry && retriable(&received) {
                            warn!("{}", format_grpc_error(&received));
                            break;
                        }
                        return Err(Error::new(
                            ExitCode::Unavailable,
                            format_grpc_error(&received),
                        ));
                    }
                }
            }
        }

        Err(Error::new(ExitCode::Timeout, "deployment timed out"))
    }
}
