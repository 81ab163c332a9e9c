// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0
//
// ConfigLoader reads the node file once. Tracing and runtime fall back to
// defaults when missing or broken; the server and registry sections are
// optional but validated when present.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use beerpc_registry::{DEFAULT_PATH, DEFAULT_TIMEOUT};
use beerpc_tracing::TracingConfiguration;
use duration_str::deserialize_duration;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_yaml::{Value, from_str};
use thiserror::Error;
use tracing::{debug, warn};

use crate::runtime::RuntimeConfiguration;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration - impossible to parse yaml")]
    InvalidYaml,
    #[error("invalid configuration - key {0} not valid")]
    InvalidKey(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("yaml parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("invalid configuration - nothing to run, add a server or a registry")]
    NothingToRun,

    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

lazy_static! {
    static ref CONFIG_KEYS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("tracing");
        s.insert("runtime");
        s.insert("server");
        s.insert("registry");
        s
    };
}

/// Checked once a section has been decoded.
pub trait Configuration {
    fn validate(&self) -> Result<(), ConfigError>;
}

/// How the RPC server is reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Http,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Http => f.write_str("http"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// listen address, host:port
    endpoint: String,

    #[serde(default)]
    transport: Transport,

    /// address announced to the registry, "protocol@host:port"
    #[serde(default)]
    advertise: Option<String>,

    /// registry URL, heartbeats are sent only when set
    #[serde(default)]
    registry: Option<String>,

    #[serde(default, deserialize_with = "deserialize_duration")]
    heartbeat_interval: Duration,
}

impl ServerConfig {
    pub fn new(endpoint: &str) -> Self {
        ServerConfig {
            endpoint: endpoint.to_string(),
            transport: Transport::default(),
            advertise: None,
            registry: None,
            heartbeat_interval: Duration::ZERO,
        }
    }

    pub fn with_transport(self, transport: Transport) -> Self {
        ServerConfig { transport, ..self }
    }

    pub fn with_registry(self, registry: &str, heartbeat_interval: Duration) -> Self {
        ServerConfig {
            registry: Some(registry.to_string()),
            heartbeat_interval,
            ..self
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// The address to announce for a server bound on `local`.
    pub fn advertised_addr(&self, local: SocketAddr) -> String {
        match &self.advertise {
            Some(addr) => addr.clone(),
            None => format!("{}@{}", self.transport, local),
        }
    }
}

impl Configuration for ServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint(&self.endpoint)?;

        if let Some(advertise) = &self.advertise {
            match advertise.split_once('@') {
                Some((protocol, addr)) if !protocol.is_empty() && !addr.is_empty() => {}
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "advertise address {} must be protocol@addr",
                        advertise
                    )));
                }
            }
        }

        if let Some(registry) = &self.registry {
            if !registry.starts_with("http://") && !registry.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "registry {} must be an http url",
                    registry
                )));
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    endpoint: String,

    #[serde(default = "default_registry_path")]
    path: String,

    /// servers silent for longer are dropped, 0 keeps them forever
    #[serde(
        default = "default_registry_timeout",
        deserialize_with = "deserialize_duration"
    )]
    timeout: Duration,
}

fn default_registry_path() -> String {
    DEFAULT_PATH.to_string()
}

fn default_registry_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

impl RegistryConfig {
    pub fn new(endpoint: &str) -> Self {
        RegistryConfig {
            endpoint: endpoint.to_string(),
            path: default_registry_path(),
            timeout: default_registry_timeout(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Configuration for RegistryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint(&self.endpoint)?;
        if !self.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "registry path {} must start with /",
                self.path
            )));
        }
        Ok(())
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    endpoint
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|e| ConfigError::Invalid(format!("endpoint {}: {}", endpoint, e)))
}

fn parse_section<T>(root: &Value, key: &str) -> Result<Option<T>, ConfigError>
where
    T: Configuration + fmt::Debug + for<'de> Deserialize<'de>,
{
    let Some(value) = root.get(key) else {
        return Ok(None);
    };

    let cfg: T = serde_yaml::from_value(value.clone())?;
    cfg.validate().inspect_err(|e| {
        debug!(section = key, error = %e, "configuration validation failed");
    })?;
    debug!(?cfg, "{} configuration loaded", key);
    Ok(Some(cfg))
}

pub struct ConfigLoader {
    root: Value,
    tracing: Option<TracingConfiguration>,
    runtime: Option<RuntimeConfiguration>,
    server: Option<ServerConfig>,
    registry: Option<RegistryConfig>,
}

impl fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root_keys = self
            .root
            .as_mapping()
            .map(|m| {
                m.keys()
                    .filter_map(|k| k.as_str())
                    .map(|s| s.to_string())
                    .collect::<Vec<String>>()
            })
            .unwrap_or_default();

        f.debug_struct("ConfigLoader")
            .field("root_keys", &root_keys)
            .field("tracing_loaded", &self.tracing.is_some())
            .field("runtime_loaded", &self.runtime.is_some())
            .finish()
    }
}

impl ConfigLoader {
    pub fn new(file_path: &str) -> Result<Self, ConfigError> {
        let config_str =
            std::fs::read_to_string(file_path).map_err(|e| ConfigError::NotFound(e.to_string()))?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        let root: Value = from_str(config_str).map_err(|_| ConfigError::InvalidYaml)?;

        let mapping = root.as_mapping().ok_or(ConfigError::InvalidYaml)?;
        for key in mapping.keys() {
            let k = key.as_str().ok_or(ConfigError::InvalidYaml)?;
            if !CONFIG_KEYS.contains(k) {
                return Err(ConfigError::InvalidKey(k.to_string()));
            }
        }

        Ok(Self {
            root,
            tracing: None,
            runtime: None,
            server: None,
            registry: None,
        })
    }

    pub fn tracing(&mut self) -> &TracingConfiguration {
        let root = &self.root;
        self.tracing.get_or_insert_with(|| {
            let cfg = root
                .get("tracing")
                .cloned()
                .map(|v| {
                    serde_yaml::from_value(v).unwrap_or_else(|e| {
                        warn!(error = ?e, "invalid tracing config, falling back to default");
                        TracingConfiguration::default()
                    })
                })
                .unwrap_or_default();
            debug!(?cfg, "Tracing configuration loaded");
            cfg
        })
    }

    pub fn runtime(&mut self) -> &RuntimeConfiguration {
        let root = &self.root;
        self.runtime.get_or_insert_with(|| {
            let cfg = root
                .get("runtime")
                .cloned()
                .map(|v| {
                    serde_yaml::from_value(v).unwrap_or_else(|e| {
                        warn!(error = ?e, "invalid runtime config, falling back to default");
                        RuntimeConfiguration::default()
                    })
                })
                .unwrap_or_default();
            debug!(?cfg, "Runtime configuration loaded");
            cfg
        })
    }

    /// The RPC server section, `None` when the node runs no server.
    pub fn server(&mut self) -> Result<Option<&ServerConfig>, ConfigError> {
        if self.server.is_none() {
            self.server = parse_section(&self.root, "server")?;
        }
        Ok(self.server.as_ref())
    }

    /// The registry section, `None` when the node hosts no registry.
    pub fn registry(&mut self) -> Result<Option<&RegistryConfig>, ConfigError> {
        if self.registry.is_none() {
            self.registry = parse_section(&self.root, "registry")?;
        }
        Ok(self.registry.as_ref())
    }
}
