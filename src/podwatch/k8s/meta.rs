/*
 * Copyright (C) 2025 The Podwatch Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use crate::podwatch::k8s::node::Node;
use crate::podwatch::k8s::pod::Pod;

/// Minimal representation of Kubernetes object metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: Option<String>,
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(rename = "creationTimestamp", skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
}

/// Metadata included with Kubernetes list responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListMeta {
    #[serde(rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Identifies one API group/version/resource collection to watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }

    pub fn pods() -> Self {
        Self::new("", "v1", "pods")
    }

    pub fn nodes() -> Self {
        Self::new("", "v1", "nodes")
    }

    /// Collection path on the API server. The core group lives under
    /// `/api`, everything else under `/apis/<group>`.
    pub fn collection_path(&self) -> String {
        if self.group.is_empty() {
            format!("/api/{}/{}", self.version, self.resource)
        } else {
            format!("/apis/{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Closed variant over the resource kinds this controller understands.
/// Reconcile logic pattern-matches on the variant instead of inspecting
/// runtime types.
#[derive(Debug, Clone)]
pub enum KubeObject {
    Pod(Pod),
    Node(Node),
}

impl KubeObject {
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            KubeObject::Pod(pod) => &pod.metadata,
            KubeObject::Node(node) => &node.metadata,
        }
    }

    /// Decodes a raw API object into the variant the resource collection
    /// carries. The watched resource decides the shape; there is no
    /// kind-sniffing of the payload.
    pub fn from_value(
        gvr: &GroupVersionResource,
        value: Value,
    ) -> Result<Self, ObjectDecodeError> {
        match gvr.resource.as_str() {
            "pods" => serde_json::from_value::<Pod>(value)
                .map(KubeObject::Pod)
                .map_err(ObjectDecodeError::Json),
            "nodes" => serde_json::from_value::<Node>(value)
                .map(KubeObject::Node)
                .map_err(ObjectDecodeError::Json),
            other => Err(ObjectDecodeError::UnsupportedResource(other.to_string())),
        }
    }
}

#[derive(Debug)]
pub enum ObjectDecodeError {
    UnsupportedResource(String),
    Json(serde_json::Error),
}

impl fmt::Display for ObjectDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectDecodeError::UnsupportedResource(resource) => {
                write!(f, "unsupported resource: {resource}")
            }
            ObjectDecodeError::Json(err) => write!(f, "object decode failed: {err}"),
        }
    }
}

impl Error for ObjectDecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ObjectDecodeError::Json(err) => Some(err),
            ObjectDecodeError::UnsupportedResource(_) => None,
        }
    }
}
