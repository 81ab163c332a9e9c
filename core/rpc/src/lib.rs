// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod client;
pub mod codec;
pub mod error;
pub mod http;
pub mod protocol;
pub mod server;
pub mod service;

pub use client::{Call, Client, dial, x_dial};
#[cfg(unix)]
pub use client::dial_unix;
pub use codec::CodecType;
pub use error::{Result, RpcError};
pub use http::{DEFAULT_RPC_PATH, dial_http};
pub use protocol::{Header, HandshakeOption, MAGIC_NUMBER};
pub use server::Server;
pub use service::{MethodDescriptor, Service, ServiceBuilder, ServiceRegistry};
