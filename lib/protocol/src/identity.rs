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

use std::fmt::{Display, Formatter};

use serde_json::Value;
use thiserror::Error;

/// The tuple that locates an object in a cluster: (group, version, kind,
/// namespace, name). The namespace is empty for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceIdentity {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdentityError {
    #[error("manifest {index} is missing required field '{field}'")]
    MissingField { index: usize, field: &'static str },
}

impl Display for ResourceIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)?;
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)?;
        }
        if self.namespace.is_empty() {
            write!(f, " {}", self.name)
        } else {
            write!(f, " {}/{}", self.namespace, self.name)
        }
    }
}

/// Split "apps/v1" into ("apps", "v1"); a bare "v1" belongs to the core
/// group, which is the empty string.
fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Extract the identity tuple from one manifest.
pub fn identity_of(manifest: &Value, index: usize) -> Result<ResourceIdentity, IdentityError> {
    let api_version = manifest["apiVersion"]
        .as_str()
        .filter(|v| !v.is_empty())
        .ok_or(IdentityError::MissingField {
            index,
            field: "apiVersion",
        })?;
    let kind = manifest["kind"]
        .as_str()
        .filter(|v| !v.is_empty())
        .ok_or(IdentityError::MissingField { index, field: "kind" })?;
    let name = manifest["metadata"]["name"]
        .as_str()
        .filter(|v| !v.is_empty())
        .ok_or(IdentityError::MissingField {
            index,
            field: "metadata.name",
        })?;
    let namespace = manifest["metadata"]["namespace"].as_str().unwrap_or("");

    let (group, version) = parse_api_version(api_version);

    Ok(ResourceIdentity {
        group: group.to_string(),
        version: version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: namespace.to_string(),
    })
}

/// Extract identities for a full request payload, preserving order.
pub fn identities(manifests: &[Value]) -> Result<Vec<ResourceIdentity>, IdentityError> {
    manifests
        .iter()
        .enumerate()
        .map(|(index, manifest)| identity_of(manifest, index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_from_namespaced_manifest() {
        let doc = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "api", "namespace": "ns-platform"},
        });
        let id = identity_of(&doc, 0).unwrap();
        assert_eq!(id.group, "apps");
        assert_eq!(id.version, "v1");
        assert_eq!(id.kind, "Deployment");
        assert_eq!(id.name, "api");
        assert_eq!(id.namespace, "ns-platform");
        assert_eq!(id.to_string(), "apps/v1/Deployment ns-platform/api");
    }

    #[test]
    fn identity_from_core_group_manifest() {
        let doc = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "ns-platform"},
        });
        let id = identity_of(&doc, 0).unwrap();
        assert_eq!(id.group, "");
        assert_eq!(id.version, "v1");
        assert_eq!(id.namespace, "");
        assert_eq!(id.to_string(), "v1/Namespace ns-platform");
    }

    #[test]
    fn missing_name_is_rejected() {
        let doc = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {},
        });
        assert_eq!(
            identity_of(&doc, 3),
            Err(IdentityError::MissingField {
                index: 3,
                field: "metadata.name"
            })
        );
    }

    #[test]
    fn missing_kind_is_rejected() {
        let doc = json!({
            "apiVersion": "v1",
            "metadata": {"name": "thing"},
        });
        assert_eq!(
            identity_of(&doc, 0),
            Err(IdentityError::MissingField {
                index: 0,
                field: "kind"
            })
        );
    }

    #[test]
    fn identities_preserve_order() {
        let docs = vec![
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}),
            json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "b"}}),
        ];
        let ids = identities(&docs).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].name, "a");
        assert_eq!(ids[1].name, "b");
    }
}
