// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use beerpc_rpc::{Client, HandshakeOption, x_dial};
use futures::future::join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::discovery::{Discovery, SelectMode};
use crate::error::{DiscoveryError, Result};

struct BroadcastState<R> {
    error: Option<DiscoveryError>,
    reply: Option<R>,
}

/// Client that spreads calls over the servers a [`Discovery`] knows about.
///
/// One connection per server address is kept and reused. A connection
/// found unusable is replaced on the next call to that address.
pub struct XClient {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    option: HandshakeOption,
    clients: Mutex<HashMap<String, Client>>,
}

impl XClient {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        mode: SelectMode,
        option: Option<HandshakeOption>,
    ) -> Self {
        XClient {
            discovery,
            mode,
            option: option.unwrap_or_default(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn discovery(&self) -> &Arc<dyn Discovery> {
        &self.discovery
    }

    /// Close every cached connection.
    pub async fn close(&self) -> Result<()> {
        let clients: Vec<_> = self.clients.lock().await.drain().collect();
        for (addr, client) in clients {
            if let Err(e) = client.close().await {
                debug!(%addr, error = %e, "rpc xclient: close error");
            }
        }
        Ok(())
    }

    async fn dial(&self, rpc_addr: &str) -> Result<Client> {
        let stale = {
            let mut clients = self.clients.lock().await;
            if let Some(client) = clients.get(rpc_addr).filter(|c| c.is_available()) {
                return Ok(client.clone());
            }
            clients.remove(rpc_addr)
        };

        if let Some(client) = stale {
            debug!(addr = %rpc_addr, "rpc xclient: dropping unavailable client");
            // a failed connection is usually shut down already
            if let Err(e) = client.close().await {
                debug!(addr = %rpc_addr, error = %e, "rpc xclient: close error");
            }
        }

        let client = x_dial(rpc_addr, Some(self.option.clone())).await?;

        let mut clients = self.clients.lock().await;
        let existing = clients
            .get(rpc_addr)
            .filter(|c| c.is_available())
            .cloned();
        if let Some(existing) = existing {
            // another call connected first, keep that one
            drop(clients);
            if let Err(e) = client.close().await {
                debug!(addr = %rpc_addr, error = %e, "rpc xclient: close error");
            }
            return Ok(existing);
        }
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_addr<A, R>(
        &self,
        rpc_addr: &str,
        service_method: &str,
        args: &A,
        token: Option<&CancellationToken>,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let client = self.dial(rpc_addr).await?;
        let reply = match token {
            Some(token) => {
                client
                    .call_with_cancellation(service_method, args, token)
                    .await?
            }
            None => client.call(service_method, args).await?,
        };
        Ok(reply)
    }

    /// Call one server picked by the select mode.
    pub async fn call<A, R>(
        &self,
        service_method: &str,
        args: &A,
        token: Option<&CancellationToken>,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        self.call_addr(&rpc_addr, service_method, args, token).await
    }

    /// Call every known server concurrently.
    ///
    /// The first error cancels every call still in flight and is returned.
    /// When `reply` is given it receives the first successful reply; the
    /// replies of the other servers are decoded as `R` and dropped, they are
    /// never merged. If no call succeeds, for instance because the first
    /// error cancelled the rest before any reply arrived, `reply` keeps the
    /// value the caller put there.
    pub async fn broadcast<A, R>(
        &self,
        service_method: &str,
        args: &A,
        reply: Option<&mut R>,
        token: Option<&CancellationToken>,
    ) -> Result<()>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Send,
    {
        let servers = self.discovery.get_all().await?;

        let token = match token {
            Some(token) => token.child_token(),
            None => CancellationToken::new(),
        };
        let keep_reply = reply.is_some();
        let state = parking_lot::Mutex::new(BroadcastState::<R> {
            error: None,
            reply: None,
        });

        let calls = servers.iter().map(|rpc_addr| {
            let token = &token;
            let state = &state;
            async move {
                let res = self
                    .call_addr::<A, R>(rpc_addr, service_method, args, Some(token))
                    .await;

                let mut state = state.lock();
                match res {
                    Ok(value) => {
                        if keep_reply && state.reply.is_none() {
                            state.reply = Some(value);
                        }
                    }
                    Err(e) => {
                        if state.error.is_none() {
                            debug!(addr = %rpc_addr, error = %e, "rpc xclient: broadcast failed");
                            state.error = Some(e);
                            token.cancel();
                        }
                    }
                }
            }
        });
        join_all(calls).await;

        let state = state.into_inner();
        if let (Some(slot), Some(value)) = (reply, state.reply) {
            *slot = value;
        }

        match state.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
