// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Liveness directory fed by server heartbeats
//!
//! Servers POST their address periodically. Clients GET the list of
//! addresses whose last heartbeat is younger than the registry timeout.
//! Expired entries are removed lazily, when the list is queried.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;

pub const DEFAULT_PATH: &str = "/_beerpc_/registry";

/// Expiry applied when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Response header listing the alive servers, comma separated.
pub const SERVERS_HEADER: &str = "x-beerpc-servers";

/// Request header carrying the address of the server sending a heartbeat.
pub const SERVER_HEADER: &str = "x-beerpc-server";

#[derive(Debug)]
pub struct Registry {
    // zero means entries never expire
    timeout: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new(DEFAULT_TIMEOUT)
    }
}

impl Registry {
    pub fn new(timeout: Duration) -> Self {
        Registry {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a heartbeat from `addr`, adding it if unknown.
    pub fn put_server(&self, addr: &str) {
        let now = Instant::now();
        let mut servers = self.servers.lock();
        if servers.insert(addr.to_string(), now).is_none() {
            info!(%addr, "rpc registry: new server");
        } else {
            debug!(%addr, "rpc registry: heartbeat");
        }
    }

    /// Addresses still alive, sorted. Expired entries are dropped for good.
    pub fn alive_servers(&self) -> Vec<String> {
        let now = Instant::now();
        let mut servers = self.servers.lock();

        servers.retain(|addr, last| {
            let alive = self.timeout.is_zero() || now.duration_since(*last) < self.timeout;
            if !alive {
                info!(%addr, "rpc registry: server expired");
            }
            alive
        });

        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort_unstable();
        alive
    }

    fn route<B>(&self, path: &str, req: &Request<B>) -> Response<Empty<Bytes>> {
        if req.uri().path() != path {
            return status_response(StatusCode::NOT_FOUND);
        }

        match *req.method() {
            Method::GET => {
                let servers = self.alive_servers().join(",");
                match HeaderValue::from_str(&servers) {
                    Ok(value) => {
                        let mut res = status_response(StatusCode::OK);
                        res.headers_mut()
                            .insert(HeaderName::from_static(SERVERS_HEADER), value);
                        res
                    }
                    Err(e) => {
                        error!("rpc registry: cannot encode server list: {}", e);
                        status_response(StatusCode::INTERNAL_SERVER_ERROR)
                    }
                }
            }
            Method::POST => {
                let addr = req
                    .headers()
                    .get(SERVER_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::trim)
                    .unwrap_or_default();

                if addr.is_empty() {
                    return status_response(StatusCode::INTERNAL_SERVER_ERROR);
                }

                self.put_server(addr);
                status_response(StatusCode::OK)
            }
            _ => status_response(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    /// Serve the registry over HTTP/1.1 on `path` until the token is
    /// cancelled.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        path: &str,
        token: CancellationToken,
    ) -> Result<()> {
        let path: Arc<str> = Arc::from(path);
        if let Ok(addr) = listener.local_addr() {
            info!("rpc registry: serving on {}{}", addr, path);
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("rpc registry: stopped");
                    return Ok(());
                }
                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("rpc registry: accept error: {}", e);
                            return Err(e.into());
                        }
                    };

                    let registry = self.clone();
                    let path = path.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let res = registry.route(&path, &req);
                            async move { Ok::<_, Infallible>(res) }
                        });

                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(%peer, "rpc registry: connection error: {}", e);
                        }
                    });
                }
            }
        }
    }
}

fn status_response(status: StatusCode) -> Response<Empty<Bytes>> {
    let mut res = Response::new(Empty::new());
    *res.status_mut() = status;
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, path: &str, server: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(server) = server {
            builder = builder.header(SERVER_HEADER, server);
        }
        builder.body(()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_servers_are_removed() {
        let registry = Registry::new(Duration::from_secs(60));
        registry.put_server("tcp@127.0.0.1:9001");
        registry.put_server("tcp@127.0.0.1:9000");

        assert_eq!(
            registry.alive_servers(),
            vec!["tcp@127.0.0.1:9000", "tcp@127.0.0.1:9001"]
        );

        tokio::time::advance(Duration::from_secs(30)).await;
        registry.put_server("tcp@127.0.0.1:9001");

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(registry.alive_servers(), vec!["tcp@127.0.0.1:9001"]);

        // a late heartbeat brings an evicted server back
        registry.put_server("tcp@127.0.0.1:9000");
        assert_eq!(registry.alive_servers().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_never_expires() {
        let registry = Registry::new(Duration::ZERO);
        registry.put_server("tcp@127.0.0.1:9000");

        tokio::time::advance(Duration::from_secs(24 * 3600)).await;
        assert_eq!(registry.alive_servers(), vec!["tcp@127.0.0.1:9000"]);
    }

    #[test]
    fn test_route() {
        let registry = Registry::default();

        let res = registry.route(DEFAULT_PATH, &request(Method::POST, DEFAULT_PATH, None));
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let res = registry.route(
            DEFAULT_PATH,
            &request(Method::POST, DEFAULT_PATH, Some("tcp@127.0.0.1:9000")),
        );
        assert_eq!(res.status(), StatusCode::OK);

        registry.put_server("tcp@127.0.0.1:9001");
        let res = registry.route(DEFAULT_PATH, &request(Method::GET, DEFAULT_PATH, None));
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get(SERVERS_HEADER).unwrap(),
            "tcp@127.0.0.1:9000,tcp@127.0.0.1:9001"
        );

        let res = registry.route(DEFAULT_PATH, &request(Method::DELETE, DEFAULT_PATH, None));
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);

        let res = registry.route(DEFAULT_PATH, &request(Method::GET, "/other", None));
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
