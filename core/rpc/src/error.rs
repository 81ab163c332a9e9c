// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use thiserror::Error;

/// Prefix of the error text a server writes when a call exceeds its handle timeout.
pub const HANDLE_TIMEOUT_PREFIX: &str = "rpc server: request handle timeout";

#[derive(Error, Debug)]
pub enum RpcError {
    // Protocol errors, fatal for the connection
    #[error("rpc server: invalid magic number {0:#x}")]
    InvalidMagicNumber(u32),
    #[error("invalid codec type {0}")]
    InvalidCodec(String),
    #[error("handshake error: {0}")]
    Handshake(String),

    // Lookup and registration errors
    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormedServiceMethod(String),
    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),
    #[error("rpc: service already defined: {0}")]
    ServiceAlreadyDefined(String),
    #[error("rpc server: {0} is not a valid service name")]
    InvalidServiceName(String),

    // Transport errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection is shut down")]
    Shutdown,
    #[error("connection closed by peer")]
    ConnectionClosed,

    // Errors reported by the remote method
    #[error("{0}")]
    Remote(String),
    #[error("{0}")]
    RemoteHandleTimeout(String),

    // Timeouts
    #[error("rpc server: request handle timeout: expect within {0:?}")]
    HandleTimeout(Duration),
    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("rpc client: call failed: {0}")]
    Cancelled(String),

    // Codec errors
    #[error("encoding error: {0}")]
    Encode(String),
    #[error("reading body {0}")]
    Decode(String),

    // Dialing errors
    #[error("rpc client err: wrong format '{0}', expect protocol@addr")]
    InvalidAddress(String),
    #[error("rpc client: unsupported protocol {0}")]
    UnsupportedProtocol(String),
    #[error("unexpected HTTP response: {0}")]
    Http(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RpcError {
    /// Rebuild the error carried in a response header.
    pub fn from_remote(text: &str) -> Self {
        if text.starts_with(HANDLE_TIMEOUT_PREFIX) {
            RpcError::RemoteHandleTimeout(text.to_string())
        } else {
            RpcError::Remote(text.to_string())
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RpcError::HandleTimeout(_)
                | RpcError::RemoteHandleTimeout(_)
                | RpcError::ConnectTimeout(_)
        )
    }

    /// True for failures that leave the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::Io(_)
                | RpcError::Shutdown
                | RpcError::ConnectionClosed
                | RpcError::InvalidMagicNumber(_)
                | RpcError::InvalidCodec(_)
                | RpcError::Handshake(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
