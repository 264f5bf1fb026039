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

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::podwatch::k8s::meta::GroupVersionResource;
use crate::podwatch::logger::LogFormat;

/// Parse a resource descriptor: `version/resource` for the core group or
/// `group/version/resource` otherwise.
pub fn parse_gvr(s: &str) -> Result<GroupVersionResource, String> {
    let parts: Vec<&str> = s.split('/').collect();
    match parts.as_slice() {
        [version, resource] if !version.is_empty() && !resource.is_empty() => {
            Ok(GroupVersionResource::new("", version, resource))
        }
        [group, version, resource]
            if !group.is_empty() && !version.is_empty() && !resource.is_empty() =>
        {
            Ok(GroupVersionResource::new(group, version, resource))
        }
        _ => Err(format!(
            "Invalid resource '{}'. Use version/resource or group/version/resource.",
            s
        )),
    }
}

/// Watch cluster resources and mirror every change to a sink.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct WatchArgs {
    /// API server base URL (falls back to PODWATCH_SERVER)
    #[arg(long)]
    pub server: Option<String>,

    /// File containing a bearer token (falls back to PODWATCH_TOKEN)
    #[arg(long)]
    pub token_file: Option<PathBuf>,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// Full relist interval, e.g. 5m or 90s
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    pub resync: Duration,

    /// Reconcile workers per watched resource
    #[arg(long, default_value_t = crate::podwatch::config::DEFAULT_WORKERS)]
    pub workers: usize,

    /// Consecutive failures before a key is dropped from the retry cycle
    #[arg(long, default_value_t = crate::podwatch::config::DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Resource collections to watch
    #[arg(long = "resource", value_parser = parse_gvr, default_values = ["v1/pods", "v1/nodes"])]
    pub resources: Vec<GroupVersionResource>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}
