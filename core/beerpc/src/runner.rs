// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use beerpc_registry::{Registry, RegistryError, heartbeat};
use beerpc_rpc::{RpcError, Server};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::build_info;
use crate::config::{ConfigError, ConfigLoader, RegistryConfig, ServerConfig, Transport};
use crate::runtime;
use crate::service;
use crate::signal;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot listen on {endpoint}: {source}")]
    Listen {
        endpoint: String,
        source: std::io::Error,
    },
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("shutdown timed out after {0:?}")]
    DrainTimeout(Duration),
}

async fn bind(endpoint: &str) -> Result<TcpListener, RunnerError> {
    TcpListener::bind(endpoint)
        .await
        .map_err(|source| RunnerError::Listen {
            endpoint: endpoint.to_string(),
            source,
        })
}

async fn start_registry(
    config: &RegistryConfig,
    tracker: &TaskTracker,
    token: &CancellationToken,
) -> Result<(), RunnerError> {
    let listener = bind(config.endpoint()).await?;
    let registry = Arc::new(Registry::new(config.timeout()));
    let path = config.path().to_string();
    let token = token.clone();

    tracker.spawn(async move {
        if let Err(e) = registry.serve(listener, &path, token).await {
            error!("registry stopped: {}", e);
        }
    });

    Ok(())
}

async fn start_server(
    config: &ServerConfig,
    tracker: &TaskTracker,
    token: &CancellationToken,
) -> Result<(), RunnerError> {
    let server = Server::new();
    server.register(service::foo_service()?)?;

    let listener = bind(config.endpoint()).await?;
    let local = listener.local_addr().map_err(|source| RunnerError::Listen {
        endpoint: config.endpoint().to_string(),
        source,
    })?;

    let serve_token = token.clone();
    match config.transport() {
        Transport::Tcp => tracker.spawn(async move {
            if let Err(e) = server.accept(listener, serve_token).await {
                error!("rpc server stopped: {}", e);
            }
        }),
        Transport::Http => tracker.spawn(async move {
            if let Err(e) = server.serve_http(listener, serve_token).await {
                error!("rpc server stopped: {}", e);
            }
        }),
    };

    if let Some(registry_url) = config.registry() {
        let addr = config.advertised_addr(local);
        let handle = heartbeat(
            registry_url,
            &addr,
            config.heartbeat_interval(),
            token.clone(),
        )
        .await?;
        info!(%addr, registry = %registry_url, "announced to registry");

        tracker.spawn(async move {
            if let Err(e) = handle.await {
                warn!("heartbeat task failed: {}", e);
            }
        });
    }

    Ok(())
}

/// Start what the configuration asks for, run until `shutdown` resolves,
/// then give running tasks the drain timeout to finish.
pub async fn run_services<F>(mut config: ConfigLoader, shutdown: F) -> Result<(), RunnerError>
where
    F: Future<Output = ()>,
{
    let tracing_conf = config.tracing().clone();
    if let Err(e) = tracing_conf.setup_tracing_subscriber() {
        debug!("keeping the installed subscriber: {}", e);
    }
    debug!(?tracing_conf);

    run_node(config, shutdown)
        .instrument(info_span!("node_lifecycle"))
        .await
}

async fn run_node<F>(mut config: ConfigLoader, shutdown: F) -> Result<(), RunnerError>
where
    F: Future<Output = ()>,
{
    info!(build_info = %build_info::BUILD_INFO);

    let drain_timeout = config.runtime().drain_timeout();
    let registry_conf = config.registry()?.cloned();
    let server_conf = config.server()?.cloned();
    if registry_conf.is_none() && server_conf.is_none() {
        return Err(ConfigError::NothingToRun.into());
    }

    let token = CancellationToken::new();
    let tracker = TaskTracker::new();

    // the registry comes first, a local server may announce itself to it
    let started = async {
        if let Some(conf) = &registry_conf {
            start_registry(conf, &tracker, &token).await?;
        }
        if let Some(conf) = &server_conf {
            start_server(conf, &tracker, &token).await?;
        }
        Ok::<(), RunnerError>(())
    }
    .await;

    if let Err(e) = started {
        error!("node failed to start: {}", e);
        token.cancel();
        tracker.close();
        tracker.wait().await;
        return Err(e);
    }

    shutdown.await;
    debug!("received shutdown signal");

    token.cancel();
    tracker.close();

    match tokio::time::timeout(drain_timeout, tracker.wait()).await {
        Ok(()) => {
            info!("node stopped");
            Ok(())
        }
        Err(_) => {
            warn!(timeout = ?drain_timeout, "node shutdown timed out");
            Err(RunnerError::DrainTimeout(drain_timeout))
        }
    }
}

/// Load `config_file`, build the runtime it describes and block until a
/// shutdown signal has been handled.
pub fn run(config_file: &str) -> Result<(), RunnerError> {
    let mut config = ConfigLoader::new(config_file)?;
    let node_runtime = runtime::build(config.runtime())?;
    node_runtime
        .runtime
        .block_on(run_services(config, signal::shutdown()))
}
