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

use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use podwatch::podwatch::cli::WatchArgs;
use podwatch::podwatch::config::Settings;
use podwatch::podwatch::controller::runner::{ControllerRunner, SyncToSink};
use podwatch::podwatch::k8s::client::{ApiClient, ResourceClient};
use podwatch::podwatch::logger::{log_error, log_info, set_log_format};
use podwatch::podwatch::models::{Notifier, StdoutNotifier};

const COMPONENT: &str = "main";

#[tokio::main]
async fn main() {
    let args = WatchArgs::parse();
    set_log_format(args.log_format.into());

    let settings = match Settings::resolve(
        args.server.clone(),
        args.token_file.clone(),
        args.insecure,
        args.resync,
        args.workers,
        args.max_retries,
    ) {
        Ok(settings) => settings,
        Err(err) => {
            log_error(COMPONENT, "invalid configuration", &[("error", &err.to_string())]);
            process::exit(1);
        }
    };

    let client = match ApiClient::new(&settings) {
        Ok(client) => client,
        Err(err) => {
            log_error(COMPONENT, "client setup failed", &[("error", &err.to_string())]);
            process::exit(1);
        }
    };

    // One probing list per watched kind. An unreachable server or bad
    // credentials is unrecoverable at startup.
    for gvr in &args.resources {
        if let Err(err) = client.list(gvr).await {
            log_error(
                COMPONENT,
                "cannot reach the cluster, exiting",
                &[
                    ("server", &settings.server),
                    ("resource", &gvr.to_string()),
                    ("error", &err.to_string()),
                ],
            );
            process::exit(1);
        }
    }

    log_info(
        COMPONENT,
        "starting podwatch",
        &[
            ("server", &settings.server),
            ("workers", &settings.workers.to_string()),
            (
                "resync",
                &humantime::format_duration(settings.resync_interval).to_string(),
            ),
        ],
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            log_info(COMPONENT, "shutdown signal received, draining", &[]);
            cancel.cancel();
        });
    }

    let notifier: Arc<dyn Notifier> = Arc::new(StdoutNotifier);
    let mut runner_tasks = Vec::with_capacity(args.resources.len());
    for gvr in args.resources.clone() {
        let source = Arc::new(ResourceClient::new(Arc::clone(&client), gvr.clone()));
        let reconciler = Arc::new(SyncToSink::new(Arc::clone(&notifier)));
        let runner = ControllerRunner::new(
            gvr,
            source,
            reconciler,
            settings.workers,
            settings.max_retries,
            settings.resync_interval,
        );
        runner_tasks.push(tokio::spawn(runner.run(cancel.clone())));
    }

    let mut failed = false;
    for task in runner_tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log_error(COMPONENT, "controller failed", &[("error", &err.to_string())]);
                failed = true;
            }
            Err(err) => {
                log_error(COMPONENT, "controller task aborted", &[("error", &err.to_string())]);
                failed = true;
            }
        }
    }

    if failed {
        process::exit(1);
    }
    log_info(COMPONENT, "podwatch stopped", &[]);
}

async fn wait_for_shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            log_error(
                COMPONENT,
                "failed to install SIGTERM handler",
                &[("error", &err.to_string())],
            );
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
