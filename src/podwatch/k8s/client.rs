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

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;

use crate::podwatch::config::Settings;
use crate::podwatch::controller::informer::{
    ChangeSource, EventStream, ListFuture, ResourceEvent, ResourceList, SourceError, WatchFuture,
};
use crate::podwatch::k8s::meta::{
    GroupVersionResource, KubeObject, ListMeta, ObjectDecodeError,
};
use crate::podwatch::logger::log_warn;

const COMPONENT: &str = "k8s.client";
const RETRY_ATTEMPTS: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum ClientError {
    Url(String),
    Build(reqwest::Error),
    Transport(reqwest::Error),
    Http { status: StatusCode, message: String },
    Decode(serde_json::Error),
    Object(ObjectDecodeError),
    WatchStatus(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Url(url) => write!(f, "invalid server url: {url}"),
            ClientError::Build(err) => write!(f, "client build failed: {err}"),
            ClientError::Transport(err) => write!(f, "request failed: {err}"),
            ClientError::Http { status, message } => {
                write!(f, "server returned {status}: {message}")
            }
            ClientError::Decode(err) => write!(f, "response decode failed: {err}"),
            ClientError::Object(err) => write!(f, "{err}"),
            ClientError::WatchStatus(message) => write!(f, "watch error event: {message}"),
        }
    }
}

impl Error for ClientError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientError::Build(err) | ClientError::Transport(err) => Some(err),
            ClientError::Decode(err) => Some(err),
            ClientError::Object(err) => Some(err),
            _ => None,
        }
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn next_backoff(current: Duration) -> Duration {
    current.checked_mul(2).unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF)
}

#[derive(Deserialize)]
struct RawList {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: Value,
}

/// Thin API-server client: list a collection, watch it from a resource
/// version. Credentials and endpoint come from the resolved settings.
pub struct ApiClient {
    http: Client,
    base: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(settings: &Settings) -> Result<Arc<Self>, ClientError> {
        let base = Url::parse(&settings.server)
            .map_err(|_| ClientError::Url(settings.server.clone()))?;
        let http = Client::builder()
            .danger_accept_invalid_certs(settings.insecure)
            .build()
            .map_err(ClientError::Build)?;
        Ok(Arc::new(Self {
            http,
            base,
            token: settings.token.clone(),
        }))
    }

    fn collection_url(&self, gvr: &GroupVersionResource) -> Result<Url, ClientError> {
        self.base
            .join(&gvr.collection_path())
            .map_err(|_| ClientError::Url(gvr.collection_path()))
    }

    fn request(&self, url: Url) -> reqwest::RequestBuilder {
        let mut builder = self.http.get(url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Full list of the collection, retried a few times on transport
    /// errors and retryable statuses.
    pub async fn list(&self, gvr: &GroupVersionResource) -> Result<ResourceList, ClientError> {
        let url = self.collection_url(gvr)?;
        let mut backoff = RETRY_BACKOFF;
        let mut attempt = 0;

        let body = loop {
            attempt += 1;
            let response = match self.request(url.clone()).send().await {
                Ok(response) => response,
                Err(err) => {
                    if attempt < RETRY_ATTEMPTS && is_retryable_transport(&err) {
                        sleep(backoff).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }
                    return Err(ClientError::Transport(err));
                }
            };

            let status = response.status();
            if status.is_success() {
                break response.text().await.map_err(ClientError::Transport)?;
            }
            let message = response.text().await.unwrap_or_default();
            if attempt < RETRY_ATTEMPTS && should_retry_status(status) {
                sleep(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
            return Err(ClientError::Http { status, message });
        };

        let raw: RawList = serde_json::from_str(&body).map_err(ClientError::Decode)?;
        let mut items = Vec::with_capacity(raw.items.len());
        for item in raw.items {
            items.push(KubeObject::from_value(gvr, item).map_err(ClientError::Object)?);
        }
        Ok(ResourceList {
            resource_version: raw.metadata.resource_version,
            items,
        })
    }

    /// Opens a watch on the collection and yields decoded events from the
    /// newline-delimited response stream. Connection errors surface as
    /// stream items; the informer reconnects.
    pub async fn watch(
        &self,
        gvr: &GroupVersionResource,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<ResourceEvent, ClientError>>, ClientError> {
        let mut url = self.collection_url(gvr)?;
        url.query_pairs_mut()
            .append_pair("watch", "true")
            .append_pair("resourceVersion", resource_version)
            .append_pair("allowWatchBookmarks", "true");

        let response = self
            .request(url)
            .send()
            .await
            .map_err(ClientError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Http { status, message });
        }

        let gvr = gvr.clone();
        let state = WatchState {
            chunks: response.bytes_stream().boxed(),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            gvr,
            finished: false,
        };

        Ok(futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.finished {
                    return None;
                }
                match state.chunks.next().await {
                    None => {
                        state.finished = true;
                        state.flush_remainder();
                    }
                    Some(Err(err)) => {
                        state.finished = true;
                        state.pending.push_back(Err(ClientError::Transport(err)));
                    }
                    Some(Ok(chunk)) => {
                        state.buffer.extend_from_slice(&chunk);
                        state.drain_lines();
                    }
                }
            }
        })
        .boxed())
    }
}

struct WatchState {
    chunks: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<ResourceEvent, ClientError>>,
    gvr: GroupVersionResource,
    finished: bool,
}

impl WatchState {
    fn drain_lines(&mut self) {
        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=position).collect();
            self.decode_line(&line[..line.len() - 1]);
        }
    }

    fn flush_remainder(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.buffer);
        self.decode_line(&line);
    }

    fn decode_line(&mut self, line: &[u8]) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        let raw: RawEvent = match serde_json::from_slice(line) {
            Ok(raw) => raw,
            Err(err) => {
                self.pending.push_back(Err(ClientError::Decode(err)));
                return;
            }
        };
        match raw.event_type.as_str() {
            "ADDED" => self.push_object(raw.object, ResourceEvent::Added),
            "MODIFIED" => self.push_object(raw.object, ResourceEvent::Modified),
            "DELETED" => self.push_object(raw.object, ResourceEvent::Deleted),
            "BOOKMARK" => self.pending.push_back(Ok(ResourceEvent::Bookmark)),
            "ERROR" => {
                self.pending
                    .push_back(Err(ClientError::WatchStatus(raw.object.to_string())));
            }
            other => {
                log_warn(
                    COMPONENT,
                    "unknown watch event type, skipping",
                    &[("type", other)],
                );
            }
        }
    }

    fn push_object(&mut self, value: Value, variant: fn(KubeObject) -> ResourceEvent) {
        match KubeObject::from_value(&self.gvr, value) {
            Ok(object) => self.pending.push_back(Ok(variant(object))),
            Err(err) => self.pending.push_back(Err(ClientError::Object(err))),
        }
    }
}

/// Binds an `ApiClient` to one resource collection behind the engine's
/// change-source seam.
pub struct ResourceClient {
    api: Arc<ApiClient>,
    gvr: GroupVersionResource,
}

impl ResourceClient {
    pub fn new(api: Arc<ApiClient>, gvr: GroupVersionResource) -> Self {
        Self { api, gvr }
    }
}

impl ChangeSource for ResourceClient {
    fn list(&self) -> ListFuture<'_> {
        Box::pin(async move {
            self.api
                .list(&self.gvr)
                .await
                .map_err(|err| Box::new(err) as SourceError)
        })
    }

    fn watch(&self, resource_version: &str) -> WatchFuture<'_> {
        let resource_version = resource_version.to_string();
        Box::pin(async move {
            let stream = self
                .api
                .watch(&self.gvr, &resource_version)
                .await
                .map_err(|err| Box::new(err) as SourceError)?;
            let stream: EventStream = stream
                .map(|item| item.map_err(|err| Box::new(err) as SourceError))
                .boxed();
            Ok(stream)
        })
    }
}
