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

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DynamicObject, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::{Discovery, Scope};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("manifest is invalid: {0}")]
    InvalidManifest(String),
    #[error("unable to discover resource '{0}' in the cluster")]
    UnknownKind(String),
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
}

/// Cluster access behind one seam with two capabilities: schema-discovered
/// apply for arbitrary kinds, and typed reads of deployment rollout state.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Namespace that namespaced manifests without a declared namespace are
    /// applied into. Rollout reads for such manifests must use the same
    /// namespace.
    fn default_namespace(&self) -> &str;
    async fn apply_generic(&self, manifest: &Value) -> Result<DynamicObject, ApplyError>;
    async fn read_rollout(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, ApplyError>;
}

pub struct KubeClusterClient {
    client: kube::Client,
}

impl KubeClusterClient {
    pub fn new(client: kube::Client) -> Self {
        KubeClusterClient { client }
    }
}

fn gvk_of(manifest: &Value) -> Result<GroupVersionKind, ApplyError> {
    let api_version = manifest["apiVersion"]
        .as_str()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApplyError::InvalidManifest("missing apiVersion".into()))?;
    let kind = manifest["kind"]
        .as_str()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApplyError::InvalidManifest("missing kind".into()))?;

    let (group, version) = match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };
    Ok(GroupVersionKind::gvk(group, version, kind))
}

async fn create_or_update(
    api: &Api<DynamicObject>,
    name: &str,
    mut object: DynamicObject,
) -> Result<DynamicObject, ApplyError> {
    match api.create(&PostParams::default(), &object).await {
        Ok(created) => Ok(created),
        Err(kube::Error::Api(err)) if err.code == 409 => {
            // The object exists; copy its resource-version into ours so the
            // optimistic-concurrency check on update passes.
            let existing = api.get(name).await?;
            object.metadata.resource_version = existing.metadata.resource_version;
            Ok(api.replace(name, &PostParams::default(), &object).await?)
        }
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    async fn apply_generic(&self, manifest: &Value) -> Result<DynamicObject, ApplyError> {
        let gvk = gvk_of(manifest)?;
        let name = manifest["metadata"]["name"]
            .as_str()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApplyError::InvalidManifest("missing metadata.name".into()))?
            .to_string();
        let object: DynamicObject = serde_json::from_value(manifest.clone())
            .map_err(|err| ApplyError::InvalidManifest(err.to_string()))?;

        let discovery = Discovery::new(self.client.clone()).run().await?;
        let (resource, capabilities) = discovery.resolve_gvk(&gvk).ok_or_else(|| {
            ApplyError::UnknownKind(format!("{}/{} {}", gvk.group, gvk.version, gvk.kind))
        })?;
        debug!(kind = %gvk.kind, scope = ?capabilities.scope, "resolved resource mapping");

        let api: Api<DynamicObject> = if matches!(capabilities.scope, Scope::Namespaced) {
            match manifest["metadata"]["namespace"].as_str().filter(|ns| !ns.is_empty()) {
                Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
                None => Api::default_namespaced_with(self.client.clone(), &resource),
            }
        } else {
            // Cluster-scoped kinds ignore any declared namespace.
            Api::all_with(self.client.clone(), &resource)
        };

        create_or_update(&api, &name, object).await
    }

    async fn read_rollout(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, ApplyError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(deployment) => Ok(Some(deployment)),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gvk_from_grouped_api_version() {
        let gvk = gvk_of(&json!({"apiVersion": "apps/v1", "kind": "Deployment"})).unwrap();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Deployment");
    }

    #[test]
    fn gvk_from_core_api_version() {
        let gvk = gvk_of(&json!({"apiVersion": "v1", "kind": "Service"})).unwrap();
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
    }

    #[test]
    fn gvk_requires_api_version_and_kind() {
        assert!(gvk_of(&json!({"kind": "Service"})).is_err());
        assert!(gvk_of(&json!({"apiVersion": "v1"})).is_err());
    }
}
