// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

/// Resolves once the process is asked to stop.
pub async fn shutdown() {
    imp::shutdown().await
}

#[cfg(unix)]
mod imp {
    use tokio::signal::unix::{SignalKind, signal};
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        tokio::select! {
            _ = sig(SignalKind::interrupt(), "SIGINT") => {}
            // sent by process supervisors
            _ = sig(SignalKind::terminate(), "SIGTERM") => {}
        };
    }

    async fn sig(kind: SignalKind, name: &str) {
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
                info!(
                    target: "beerpc::signal",
                    "received signal {}, starting shutdown",
                    name,
                );
            }
            Err(e) => {
                error!(target: "beerpc::signal", "cannot listen for {}: {}", name, e);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(
                target: "beerpc::signal",
                "received signal Ctrl-C, starting shutdown",
            ),
            Err(e) => {
                error!(target: "beerpc::signal", "cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}
