// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::error::{DiscoveryError, Result};

/// How a single server is picked out of the discovered set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectMode {
    #[default]
    Random,
    RoundRobin,
}

impl fmt::Display for SelectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectMode::Random => f.write_str("random"),
            SelectMode::RoundRobin => f.write_str("round_robin"),
        }
    }
}

impl FromStr for SelectMode {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random" => Ok(SelectMode::Random),
            "round_robin" | "roundrobin" => Ok(SelectMode::RoundRobin),
            other => Err(DiscoveryError::UnsupportedSelectMode(other.to_string())),
        }
    }
}

/// Source of candidate server addresses, in "protocol@addr" form.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Pull the address set from its authority, if there is one.
    async fn refresh(&self) -> Result<()>;

    /// Replace the address set.
    async fn update(&self, servers: Vec<String>) -> Result<()>;

    /// Pick one address.
    async fn get(&self, mode: SelectMode) -> Result<String>;

    /// All known addresses.
    async fn get_all(&self) -> Result<Vec<String>>;
}

#[derive(Debug)]
struct ServerList {
    servers: Vec<String>,
    // round robin cursor
    index: usize,
}

/// Discovery over a list of addresses maintained by hand.
#[derive(Debug)]
pub struct MultiServersDiscovery {
    state: Mutex<ServerList>,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        // random start so that fresh processes do not all hit the same server first
        let index = rand::rng().random_range(0..u32::MAX as usize);
        MultiServersDiscovery {
            state: Mutex::new(ServerList { servers, index }),
        }
    }

    pub fn set_servers(&self, servers: Vec<String>) {
        debug!(?servers, "rpc discovery: update servers");
        self.state.lock().servers = servers;
    }

    pub fn select(&self, mode: SelectMode) -> Result<String> {
        let mut state = self.state.lock();
        let n = state.servers.len();
        if n == 0 {
            return Err(DiscoveryError::NoAvailableServers);
        }

        match mode {
            SelectMode::Random => {
                let i = rand::rng().random_range(0..n);
                Ok(state.servers[i].clone())
            }
            SelectMode::RoundRobin => {
                // the list may have shrunk since the last pick
                let i = state.index % n;
                state.index = (i + 1) % n;
                Ok(state.servers[i].clone())
            }
        }
    }

    pub fn servers(&self) -> Vec<String> {
        self.state.lock().servers.clone()
    }
}

#[async_trait]
impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.set_servers(servers);
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.servers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn servers() -> Vec<String> {
        vec![
            "tcp@127.0.0.1:9000".to_string(),
            "tcp@127.0.0.1:9001".to_string(),
            "tcp@127.0.0.1:9002".to_string(),
        ]
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_once() {
        let discovery = MultiServersDiscovery::new(servers());

        let mut previous = None;
        for _ in 0..4 {
            let mut seen = HashSet::new();
            let mut order = Vec::new();
            for _ in 0..3 {
                let server = discovery.get(SelectMode::RoundRobin).await.unwrap();
                seen.insert(server.clone());
                order.push(server);
            }
            assert_eq!(seen.len(), 3);

            // the cycle keeps the same order
            if let Some(previous) = previous.replace(order.clone()) {
                assert_eq!(previous, order);
            }
        }
    }

    #[tokio::test]
    async fn test_random_stays_in_set() {
        let discovery = MultiServersDiscovery::new(servers());
        for _ in 0..20 {
            let server = discovery.get(SelectMode::Random).await.unwrap();
            assert!(servers().contains(&server));
        }
    }

    #[tokio::test]
    async fn test_empty_list() {
        let discovery = MultiServersDiscovery::new(vec![]);
        for mode in [SelectMode::Random, SelectMode::RoundRobin] {
            let err = discovery.get(mode).await.unwrap_err();
            assert_eq!(err.to_string(), "rpc discovery: no available servers");
        }
        assert!(discovery.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_shrinks_list() {
        let discovery = MultiServersDiscovery::new(servers());
        discovery.get(SelectMode::RoundRobin).await.unwrap();

        discovery
            .update(vec!["tcp@127.0.0.1:9005".to_string()])
            .await
            .unwrap();
        for _ in 0..3 {
            assert_eq!(
                discovery.get(SelectMode::RoundRobin).await.unwrap(),
                "tcp@127.0.0.1:9005"
            );
        }
        assert_eq!(discovery.get_all().await.unwrap().len(), 1);
    }

    #[test]
    fn test_select_mode_parse() {
        assert_eq!("random".parse::<SelectMode>().unwrap(), SelectMode::Random);
        assert_eq!(
            "round_robin".parse::<SelectMode>().unwrap(),
            SelectMode::RoundRobin
        );

        let err = "least_loaded".parse::<SelectMode>().unwrap_err();
        assert_eq!(err.to_string(), "rpc discovery: not supported select mode");
    }
}
