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

use chrono::DateTime;
use serde::Serialize;

use crate::podwatch::k8s::pod::Pod;

const CLASSIFICATION: &str = "k8s_online";

/// Flat pod observation forwarded to the sink.
#[derive(Debug, Clone, Serialize)]
pub struct PodRecord {
    pub pod_name: String,
    pub namespace: String,
    pub deploy_name: String,
    pub phase: String,
    pub pod_ip: String,
    pub node_name: String,
    pub host_ip: String,
    pub create_time: String,
    pub cls_name: String,
}

impl PodRecord {
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let name = pod.metadata.name.clone().unwrap_or_default();
        Self {
            pod_name: name.clone(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            deploy_name: name,
            phase: status
                .and_then(|s| s.phase.clone())
                .unwrap_or_default(),
            pod_ip: status
                .and_then(|s| s.pod_ip.clone())
                .unwrap_or_default(),
            node_name: pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
            host_ip: status
                .and_then(|s| s.host_ip.clone())
                .unwrap_or_default(),
            create_time: format_create_time(pod.metadata.creation_timestamp.as_deref()),
            cls_name: CLASSIFICATION.to_string(),
        }
    }
}

/// Renders the API server's RFC3339 creation timestamp the way the sink
/// expects it; timestamps that fail to parse pass through untouched.
fn format_create_time(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return String::new();
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => parsed.format("%Y-%m-%d %H:%M:%S").to_string(),
        Err(_) => raw.to_string(),
    }
}
