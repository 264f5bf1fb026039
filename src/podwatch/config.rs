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

use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

pub const SERVER_ENV: &str = "PODWATCH_SERVER";
pub const TOKEN_ENV: &str = "PODWATCH_TOKEN";
pub const DEFAULT_SERVER: &str = "https://127.0.0.1:6443";
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Resolved operator configuration: flag values with env fallbacks.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: String,
    pub token: Option<String>,
    pub insecure: bool,
    pub resync_interval: Duration,
    pub workers: usize,
    pub max_retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            token: None,
            insecure: false,
            resync_interval: DEFAULT_RESYNC,
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl Settings {
    /// Combines explicit values with env fallbacks. A token file wins
    /// over the token env var.
    pub fn resolve(
        server: Option<String>,
        token_file: Option<PathBuf>,
        insecure: bool,
        resync_interval: Duration,
        workers: usize,
        max_retries: u32,
    ) -> Result<Self, ConfigError> {
        let server = server
            .or_else(|| env::var(SERVER_ENV).ok())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());

        let token = match token_file {
            Some(path) => {
                let contents = fs::read_to_string(&path)
                    .map_err(|err| ConfigError::TokenFile { path, err })?;
                let token = contents.trim().to_string();
                if token.is_empty() {
                    return Err(ConfigError::EmptyToken);
                }
                Some(token)
            }
            None => env::var(TOKEN_ENV).ok().filter(|token| !token.is_empty()),
        };

        Ok(Self {
            server,
            token,
            insecure,
            resync_interval,
            workers,
            max_retries,
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    TokenFile { path: PathBuf, err: io::Error },
    EmptyToken,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::TokenFile { path, err } => {
                write!(f, "failed to read token file {}: {err}", path.display())
            }
            ConfigError::EmptyToken => write!(f, "token file is empty"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::TokenFile { err, .. } => Some(err),
            ConfigError::EmptyToken => None,
        }
    }
}
