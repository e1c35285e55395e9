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

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use protocol::deployment::{DeploymentRequest, Payload};
use protocol::to_timestamp;

use crate::config::Config;
use crate::error::{Error, ExitCode};

pub type TemplateVariables = BTreeMap<String, Value>;

/// A request ready for submission plus the environment label derived for
/// presentation and hints.
pub struct Prepared {
    pub request: DeploymentRequest,
    pub environment: String,
}

/// Load variables from the variables file, then overlay inline `key=value`
/// pairs. Inline values win; overriding logs a warning.
pub fn load_variables(config: &Config) -> Result<TemplateVariables, Error> {
    let mut variables = TemplateVariables::new();

    if let Some(path) = &config.variables_file {
        let raw = fs::read_to_string(path).map_err(|err| {
            Error::new(
                ExitCode::InvocationFailure,
                format!("load template variables: {err}"),
            )
        })?;
        variables = serde_yaml::from_str(&raw).map_err(|err| {
            Error::new(
                ExitCode::InvocationFailure,
                format!("load template variables: {err}"),
            )
        })?;
    }

    for pair in &config.variables {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            Error::new(
                ExitCode::InvocationFailure,
                format!("invalid template variable '{pair}'; expected key=value"),
            )
        })?;
        if let Some(previous) = variables.get(key) {
            warn!("overwriting template variable '{key}'; previous value was '{previous}'");
        }
        variables.insert(key.to_string(), Value::String(value.to_string()));
    }

    Ok(variables)
}

/// Render one manifest file and split it into its JSON documents.
pub fn render_file(path: &Path, variables: &TemplateVariables) -> Result<Vec<Value>, Error> {
    let raw = fs::read_to_string(path).map_err(|err| {
        Error::new(
            ExitCode::InvocationFailure,
            format!("read manifest {}: {err}", path.display()),
        )
    })?;

    let mut env = minijinja::Environment::new();
    env.add_template("manifest", &raw)
        .map_err(|err| template_error(path, err))?;
    let rendered = env
        .get_template("manifest")
        .map_err(|err| template_error(path, err))?
        .render(variables)
        .map_err(|err| template_error(path, err))?;

    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&rendered) {
        let value = Value::deserialize(document).map_err(|err| {
            Error::new(
                ExitCode::TemplateError,
                format!("{}: invalid YAML after templating: {err}", path.display()),
            )
        })?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

fn template_error(path: &Path, err: minijinja::Error) -> Error {
    Error::new(
        ExitCode::TemplateError,
        format!("{}: {err}", path.display()),
    )
}

fn detect_team(manifest: &Value) -> Option<&str> {
    manifest["metadata"]["annotations"]["team"]
        .as_str()
        .filter(|team| !team.is_empty())
}

fn detect_namespace(manifest: &Value) -> &str {
    manifest["metadata"]["namespace"].as_str().unwrap_or("")
}

fn resolve_team(config: &Config, manifests: &[Value]) -> Result<String, Error> {
    if let Some(team) = &config.team {
        return Ok(team.clone());
    }
    info!("team not explicitly specified; attempting auto-detection...");
    for manifest in manifests {
        if let Some(team) = detect_team(manifest) {
            info!("detected team '{team}' from manifest annotation");
            return Ok(team.to_string());
        }
    }
    for manifest in manifests {
        let namespace = detect_namespace(manifest);
        if !namespace.is_empty() {
            info!("detected team '{namespace}' from manifest namespace");
            return Ok(namespace.to_string());
        }
    }
    Err(Error::new(
        ExitCode::InvocationFailure,
        "no team specified, and unable to auto-detect from the manifests",
    ))
}

fn resolve_environment(config: &Config, manifests: &[Value]) -> String {
    if let Some(environment) = &config.environment {
        return environment.clone();
    }

    let namespaces: BTreeSet<&str> = manifests.iter().map(detect_namespace).collect();
    let environment = match namespaces.iter().next() {
        Some(namespace) if namespaces.len() == 1 && !namespace.is_empty() => {
            format!("{}:{}", config.cluster, namespace)
        }
        _ => config.cluster.clone(),
    };
    info!("detected environment '{environment}'");
    environment
}

/// Stamp build provenance onto every manifest.
fn inject_annotations(manifest: &mut Value, config: &Config) -> Result<(), Error> {
    let metadata = manifest
        .as_object_mut()
        .and_then(|object| {
            object
                .entry("metadata")
                .or_insert_with(|| Value::Object(Default::default()))
                .as_object_mut()
        })
        .ok_or_else(|| {
            Error::new(
                ExitCode::InternalError,
                "manifest metadata is not an object",
            )
        })?;
    let annotations = metadata
        .entry("annotations")
        .or_insert_with(|| Value::Object(Default::default()))
        .as_object_mut()
        .ok_or_else(|| {
            Error::new(
                ExitCode::InternalError,
                "manifest annotations are not an object",
            )
        })?;

    annotations.insert(
        "deploy.convoy.io/timestamp".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    if !config.git_ref.is_empty() {
        annotations.insert(
            "deploy.convoy.io/git-ref".to_string(),
            Value::String(config.git_ref.clone()),
        );
    }
    if let Some(username) = &config.deployer_username {
        annotations.insert(
            "deploy.convoy.io/deployer".to_string(),
            Value::String(username.clone()),
        );
    }
    Ok(())
}

/// Build the deployment request from the configuration: render, detect,
/// annotate, wrap and stamp the deadline.
pub fn prepare(config: &Config) -> Result<Prepared, Error> {
    let variables = load_variables(config)?;

    let mut manifests = Vec::new();
    for path in &config.resource {
        manifests.extend(render_file(path, &variables)?);
    }
    if manifests.is_empty() {
        return Err(Error::new(
            ExitCode::InvocationFailure,
            "at least one resource is required to make sense of the deployment",
        ));
    }

    let team = resolve_team(config, &manifests)?;
    let environment = resolve_environment(config, &manifests);

    for manifest in &mut manifests {
        inject_annotations(manifest, config)?;
    }

    if config.print_payload {
        for manifest in &manifests {
            println!("{}", serde_json::to_string_pretty(manifest).unwrap_or_default());
        }
    }

    let now = Utc::now();
    let deadline = now + chrono::Duration::seconds(config.timeout as i64);

    let request = DeploymentRequest {
        id: String::new(),
        time: Some(to_timestamp(now)),
        deadline: Some(to_timestamp(deadline)),
        cluster: config.cluster.clone(),
        team,
        git_ref_sha: config.git_ref.clone(),
        payload: Some(Payload::from_json_resources(&manifests)),
        repository: config.repository.clone().unwrap_or_default(),
        deployer_username: config.deployer_username.clone().unwrap_or_default(),
        trigger_url: config.trigger_url.clone().unwrap_or_default(),
        trace_parent: String::new(),
    };

    Ok(Prepared {
        request,
        environment,
    })
}
