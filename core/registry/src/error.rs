// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rpc server: heart beat err: {0}")]
    Heartbeat(#[from] reqwest::Error),
    #[error("rpc server: heart beat rejected with status {0}")]
    Rejected(u16),
    #[error("rpc registry: invalid heartbeat address {0:?}")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
