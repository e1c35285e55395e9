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

use clap::Parser;
use tonic::transport::Endpoint;
use tracing::error;

use deploy_cli::deploy::AuthInterceptor;
use deploy_cli::prepare::prepare;
use deploy_cli::{Config, Deployer, Error, ExitCode};
use protocol::deployment::deploy_client::DeployClient;

async fn run(config: Config) -> Result<(), Error> {
    config.validate()?;

    let prepared = prepare(&config)?;

    let endpoint = Endpoint::from_shared(config.deploy_server_url.clone()).map_err(|err| {
        Error::new(
            ExitCode::InvocationFailure,
            format!("invalid deploy server url: {err}"),
        )
    })?;
    let channel = endpoint.connect_lazy();
    let interceptor = AuthInterceptor::from_config(&config)?;
    let client = DeployClient::with_interceptor(channel, interceptor);

    let mut deployer = Deployer { client };
    deployer
        .run(&config, &prepared.environment, prepared.request)
        .await
}

#[tokio::main]
async fn main() {
    let config = Config::parse();

    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber).expect("set tracing subscriber");

    let code = match run(config).await {
        Ok(()) => ExitCode::Success,
        Err(err) => {
            error!("{err}");
            err.exit_code
        }
    };
    std::process::exit(code as i32);
}
