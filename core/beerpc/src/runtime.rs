// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::time;

use duration_str::deserialize_duration;
use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};

use crate::config::ConfigError;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfiguration {
    /// the number of cores to use, 0 means all of them
    #[serde(default)]
    n_cores: usize,

    #[serde(default = "default_thread_name")]
    thread_name: String,

    /// how long running connections get to finish after a shutdown signal
    #[serde(
        default = "default_drain_timeout",
        deserialize_with = "deserialize_duration"
    )]
    drain_timeout: time::Duration,
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        RuntimeConfiguration {
            n_cores: 0,
            thread_name: default_thread_name(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_thread_name() -> String {
    "beerpc".to_string()
}

fn default_drain_timeout() -> time::Duration {
    time::Duration::from_secs(10)
}

impl RuntimeConfiguration {
    pub fn with_cores(self, n_cores: usize) -> Self {
        RuntimeConfiguration { n_cores, ..self }
    }

    pub fn with_drain_timeout(self, drain_timeout: time::Duration) -> Self {
        RuntimeConfiguration {
            drain_timeout,
            ..self
        }
    }

    pub fn n_cores(&self) -> usize {
        self.n_cores
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn drain_timeout(&self) -> time::Duration {
        self.drain_timeout
    }
}

pub struct NodeRuntime {
    pub config: RuntimeConfiguration,
    pub runtime: Runtime,
}

#[cfg(feature = "multicore")]
fn available_cores() -> usize {
    num_cpus::get()
}

#[cfg(not(feature = "multicore"))]
fn available_cores() -> usize {
    1
}

pub fn build(config: &RuntimeConfiguration) -> Result<NodeRuntime, ConfigError> {
    let n_cpu = available_cores();

    let cores = if config.n_cores > n_cpu {
        warn!(
            "Requested number of cores ({}) is greater than available cores ({}). Using all available cores",
            config.n_cores, n_cpu
        );
        n_cpu
    } else if config.n_cores == 0 {
        info!(%n_cpu, "Using all available cores");
        n_cpu
    } else {
        config.n_cores
    };

    let runtime = match cores {
        1 => {
            info!("Using single-threaded runtime");
            Builder::new_current_thread()
                .enable_all()
                .thread_name(config.thread_name.as_str())
                .build()?
        }
        _ => {
            info!(%cores, "Using multi-threaded runtime");
            build_multi_thread(config, cores)?
        }
    };

    Ok(NodeRuntime {
        config: config.clone(),
        runtime,
    })
}

#[cfg(feature = "multicore")]
fn build_multi_thread(config: &RuntimeConfiguration, cores: usize) -> std::io::Result<Runtime> {
    Builder::new_multi_thread()
        .enable_all()
        .thread_name(config.thread_name.as_str())
        .worker_threads(cores)
        .max_blocking_threads(cores)
        .build()
}

#[cfg(not(feature = "multicore"))]
fn build_multi_thread(config: &RuntimeConfiguration, _cores: usize) -> std::io::Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .thread_name(config.thread_name.as_str())
        .build()
}
