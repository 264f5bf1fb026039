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

use crate::podwatch::logger::log_warn;

pub mod node;
pub mod pod;

pub use node::NodeRecord;
pub use pod::PodRecord;

/// Flat record emitted for every reconciled observation.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SyncRecord {
    Pod(PodRecord),
    Node(NodeRecord),
    Deleted(DeletedRecord),
}

/// Emitted when an object disappears from the cluster.
#[derive(Debug, Clone, Serialize)]
pub struct DeletedRecord {
    pub namespace: String,
    pub name: String,
    pub cls_name: String,
}

impl DeletedRecord {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.unwrap_or_default().to_string(),
            name: name.to_string(),
            cls_name: "k8s_offline".to_string(),
        }
    }
}

/// Downstream sink for reconcile output. Delivery is fire-and-forget:
/// failures are the sink's concern and are never threaded back into the
/// retry policy.
pub trait Notifier: Send + Sync {
    fn notify(&self, record: &SyncRecord);
}

/// Default sink: pretty-printed JSON on stdout.
#[derive(Debug, Default)]
pub struct StdoutNotifier;

impl Notifier for StdoutNotifier {
    fn notify(&self, record: &SyncRecord) {
        match serde_json::to_string_pretty(record) {
            Ok(payload) => println!("{payload}"),
            Err(err) => log_warn(
                "models.sink",
                "record failed to serialize",
                &[("error", &err.to_string())],
            ),
        }
    }
}
