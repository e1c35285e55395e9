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

use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, ExitCode};

#[derive(Debug, Parser, Default)]
#[clap(name = "deploy", about = "Submit a deployment and follow it to completion")]
pub struct Config {
    /// Target cluster label.
    #[clap(long)]
    pub cluster: String,

    /// Owning team; auto-detected from the manifests when omitted.
    #[clap(long)]
    pub team: Option<String>,

    /// Environment name; defaults to `cluster` or `cluster:namespace`.
    #[clap(long)]
    pub environment: Option<String>,

    /// Manifest file to deploy. May be repeated; order is preserved.
    #[clap(long = "resource", required = true)]
    pub resource: Vec<PathBuf>,

    /// Inline template variable, `key=value`. Overrides the variables file.
    #[clap(long = "var")]
    pub variables: Vec<String>,

    /// YAML file of template variables.
    #[clap(long)]
    pub variables_file: Option<PathBuf>,

    /// Stream deployment status until a terminal state.
    #[clap(long)]
    pub wait: bool,

    /// Retry transient transport errors.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub retry: bool,

    /// Seconds between retries.
    #[clap(long, default_value_t = 5)]
    pub retry_interval: u64,

    /// Seconds until the deployment deadline.
    #[clap(long, default_value_t = 600)]
    pub timeout: u64,

    /// Endpoint of the dispatch server.
    #[clap(long, default_value = "http://localhost:9090")]
    pub deploy_server_url: String,

    /// Hex-encoded team API key.
    #[clap(long)]
    pub apikey: Option<String>,

    /// GitHub OIDC bearer token.
    #[clap(long)]
    pub github_token: Option<String>,

    /// Git reference being deployed.
    #[clap(long = "ref", default_value = "")]
    pub git_ref: String,

    /// Source repository slug, e.g. `org/repo`.
    #[clap(long)]
    pub repository: Option<String>,

    /// Username recorded as the deployer.
    #[clap(long)]
    pub deployer_username: Option<String>,

    /// URL of the run that triggered this deployment.
    #[clap(long)]
    pub trigger_url: Option<String>,

    /// Print the rendered payload before submitting.
    #[clap(long)]
    pub print_payload: bool,

    /// Base URL of the tracing dashboard; the trace id is appended.
    #[clap(long, default_value = "")]
    pub tracing_dashboard_url: String,
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.apikey.is_none() && self.github_token.is_none() {
            return Err(Error::new(
                ExitCode::InvocationFailure,
                "either an API key or a GitHub token is required",
            ));
        }
        if let Some(key) = &self.apikey {
            if hex::decode(key).is_err() {
                return Err(Error::new(
                    ExitCode::InvocationFailure,
                    "API key must be a hex encoded string",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_key(key: Option<&str>, token: Option<&str>) -> Config {
        Config {
            cluster: "c1".into(),
            apikey: key.map(String::from),
            github_token: token.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn auth_material_is_required() {
        let err = config_with_key(None, None).validate().unwrap_err();
        assert_eq!(err.exit_code, ExitCode::InvocationFailure);
    }

    #[test]
    fn api_key_must_be_hex() {
        assert!(config_with_key(Some("cafef00d"), None).validate().is_ok());
        let err = config_with_key(Some("not-hex!"), None)
            .validate()
            .unwrap_err();
        assert_eq!(err.exit_code, ExitCode::InvocationFailure);
    }

    #[test]
    fn github_token_alone_is_enough() {
        assert!(config_with_key(None, Some("gh-token")).validate().is_ok());
    }
}
