// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod discovery;
pub mod error;
pub mod registry_discovery;
pub mod xclient;

pub use discovery::{Discovery, MultiServersDiscovery, SelectMode};
pub use error::{DiscoveryError, Result};
pub use registry_discovery::{DEFAULT_UPDATE_TIMEOUT, RegistryDiscovery};
pub use xclient::XClient;
