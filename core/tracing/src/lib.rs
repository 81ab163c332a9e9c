// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Error, Debug)]
pub enum TracingError {
    #[error("invalid log level {0}")]
    InvalidLevel(String),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TracingConfiguration {
    #[serde(default = "default_log_level")]
    log_level: String,

    #[serde(default = "default_display_thread_names")]
    display_thread_names: bool,

    #[serde(default = "default_display_thread_ids")]
    display_thread_ids: bool,

    /// EnvFilter directives, e.g. "info,beerpc_rpc=debug"
    #[serde(default = "default_filter")]
    filter: String,
}

impl Default for TracingConfiguration {
    fn default() -> Self {
        TracingConfiguration {
            log_level: default_log_level(),
            display_thread_names: default_display_thread_names(),
            display_thread_ids: default_display_thread_ids(),
            filter: default_filter(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_display_thread_names() -> bool {
    true
}

fn default_display_thread_ids() -> bool {
    false
}

fn default_filter() -> String {
    "info".to_string()
}

fn resolve_level(level: &str) -> Option<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

impl TracingConfiguration {
    pub fn with_log_level(self, log_level: String) -> Self {
        TracingConfiguration { log_level, ..self }
    }

    pub fn with_display_thread_names(self, display_thread_names: bool) -> Self {
        TracingConfiguration {
            display_thread_names,
            ..self
        }
    }

    pub fn with_display_thread_ids(self, display_thread_ids: bool) -> Self {
        TracingConfiguration {
            display_thread_ids,
            ..self
        }
    }

    pub fn with_filter(self, filter: String) -> Self {
        TracingConfiguration { filter, ..self }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn display_thread_names(&self) -> bool {
        self.display_thread_names
    }

    pub fn display_thread_ids(&self) -> bool {
        self.display_thread_ids
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Check the level and filter without installing anything.
    pub fn validate(&self) -> Result<(), TracingError> {
        resolve_level(&self.log_level)
            .ok_or_else(|| TracingError::InvalidLevel(self.log_level.clone()))?;
        EnvFilter::try_new(&self.filter).map_err(|e| TracingError::InvalidFilter(e.to_string()))?;
        Ok(())
    }

    /// Install a subscriber that logs to stdout. Fails if one is already
    /// installed for the process.
    pub fn setup_tracing_subscriber(&self) -> Result<(), TracingError> {
        let level = resolve_level(&self.log_level)
            .ok_or_else(|| TracingError::InvalidLevel(self.log_level.clone()))?;
        let filter = EnvFilter::try_new(&self.filter)
            .map_err(|e| TracingError::InvalidFilter(e.to_string()))?;

        tracing_subscriber::registry()
            .with(filter)
            .with(LevelFilter::from_level(level))
            .with(
                fmt::layer()
                    .with_thread_names(self.display_thread_names)
                    .with_thread_ids(self.display_thread_ids),
            )
            .try_init()
            .map_err(|e| TracingError::AlreadyInstalled(e.to_string()))
    }
}
