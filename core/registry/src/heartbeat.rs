// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RegistryError, Result};
use crate::registry::{DEFAULT_TIMEOUT, SERVER_HEADER};

/// Interval used when none is given, a minute below the default expiry.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4 * 60);

/// POST one heartbeat for `addr` to the registry at `registry_url`.
pub async fn send_heartbeat(client: &reqwest::Client, registry_url: &str, addr: &str) -> Result<()> {
    debug!(%addr, registry = %registry_url, "send heart beat to registry");

    let res = client
        .post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await?;

    if !res.status().is_success() {
        return Err(RegistryError::Rejected(res.status().as_u16()));
    }

    Ok(())
}

/// Announce `addr` to the registry now, then keep announcing it every
/// `interval` until the token is cancelled.
///
/// Only the first heartbeat can fail this call. Later failures are logged
/// and retried at the next tick, so a server cut off from the registry
/// simply expires there. A zero interval selects
/// [`DEFAULT_HEARTBEAT_INTERVAL`].
pub async fn heartbeat(
    registry_url: &str,
    addr: &str,
    interval: Duration,
    token: CancellationToken,
) -> Result<JoinHandle<()>> {
    if addr.is_empty() {
        return Err(RegistryError::InvalidAddress(addr.to_string()));
    }

    let interval = if interval.is_zero() {
        DEFAULT_HEARTBEAT_INTERVAL
    } else {
        interval
    };

    if interval >= DEFAULT_TIMEOUT {
        warn!(
            ?interval,
            "heartbeat interval is not shorter than the default registry timeout"
        );
    }

    let client = reqwest::Client::new();
    send_heartbeat(&client, registry_url, addr).await?;

    let registry_url = registry_url.to_string();
    let addr = addr.to_string();

    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(%addr, "heartbeat stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = send_heartbeat(&client, &registry_url, &addr).await {
                        warn!(%addr, registry = %registry_url, "{}", e);
                    }
                }
            }
        }
    }))
}
