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

use serde::Serialize;

use crate::podwatch::k8s::node::Node;

/// Flat node observation forwarded to the sink.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub name: String,
    pub status: String,
    pub version: String,
    pub internal_ip: String,
    pub capacity: String,
}

impl NodeRecord {
    pub fn from_node(node: &Node) -> Self {
        let capacity = node
            .status
            .as_ref()
            .map(|status| {
                let mut entries: Vec<String> = status
                    .capacity
                    .iter()
                    .map(|(resource, quantity)| format!("{resource}={quantity}"))
                    .collect();
                entries.sort();
                entries.join(",")
            })
            .unwrap_or_default();

        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            status: node.ready_status().to_string(),
            version: node
                .status
                .as_ref()
                .and_then(|status| status.node_info.as_ref())
                .and_then(|info| info.kubelet_version.clone())
                .unwrap_or_default(),
            internal_ip: node.internal_ip().to_string(),
            capacity,
        }
    }
}
