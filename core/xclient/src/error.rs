// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use beerpc_rpc::RpcError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("rpc discovery: no available servers")]
    NoAvailableServers,
    #[error("rpc discovery: not supported select mode")]
    UnsupportedSelectMode(String),
    #[error("rpc registry refresh err: {0}")]
    Refresh(#[from] reqwest::Error),
    #[error("rpc registry refresh err: unexpected status {0}")]
    RefreshStatus(u16),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
