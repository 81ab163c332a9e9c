// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod error;
pub mod heartbeat;
pub mod registry;

pub use error::{RegistryError, Result};
pub use heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, heartbeat, send_heartbeat};
pub use registry::{
    DEFAULT_PATH, DEFAULT_TIMEOUT, Registry, SERVER_HEADER, SERVERS_HEADER,
};
