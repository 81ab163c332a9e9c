// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use beerpc_registry::SERVERS_HEADER;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::discovery::{Discovery, MultiServersDiscovery, SelectMode};
use crate::error::{DiscoveryError, Result};

/// How long a fetched server list is used before asking the registry again.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery backed by a heartbeat registry.
///
/// The list fetched from the registry is cached and re-fetched on demand
/// once it is older than the update timeout.
#[derive(Debug)]
pub struct RegistryDiscovery {
    servers: MultiServersDiscovery,
    registry_url: String,
    timeout: Duration,
    // time of the last successful update, serializes refreshes
    last_update: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// A zero `timeout` selects [`DEFAULT_UPDATE_TIMEOUT`].
    pub fn new(registry_url: impl Into<String>, timeout: Duration) -> Self {
        RegistryDiscovery {
            servers: MultiServersDiscovery::new(Vec::new()),
            registry_url: registry_url.into(),
            timeout: if timeout.is_zero() {
                DEFAULT_UPDATE_TIMEOUT
            } else {
                timeout
            },
            last_update: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    async fn fetch(&self) -> Result<Vec<String>> {
        let res = self.http.get(&self.registry_url).send().await?;
        if !res.status().is_success() {
            return Err(DiscoveryError::RefreshStatus(res.status().as_u16()));
        }

        let servers = res
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(servers)
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        let mut last_update = self.last_update.lock().await;
        if matches!(*last_update, Some(t) if t.elapsed() < self.timeout) {
            return Ok(());
        }

        debug!(registry = %self.registry_url, "rpc registry: refresh servers from registry");
        match self.fetch().await {
            Ok(servers) => {
                self.servers.set_servers(servers);
                *last_update = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                warn!(registry = %self.registry_url, "{}", e);
                Err(e)
            }
        }
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        let mut last_update = self.last_update.lock().await;
        self.servers.set_servers(servers);
        *last_update = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.servers.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        Ok(self.servers.servers())
    }
}
