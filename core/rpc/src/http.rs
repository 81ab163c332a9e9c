// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Carrying the protocol over HTTP/1.1
//!
//! The client sends `GET /_beerpc_` with `Connection: upgrade` and
//! `Upgrade: beerpc`. The server answers `101 Switching Protocols` and from
//! then on the stream speaks the plain protocol, handshake first.

use std::convert::Infallible;

use bytes::Bytes;
use http::header::{CONNECTION, HOST, UPGRADE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{Client, connect_with_timeout, parse_option};
use crate::error::{Result, RpcError};
use crate::protocol::HandshakeOption;
use crate::server::Server;

/// Path the server accepts upgrade requests on.
pub const DEFAULT_RPC_PATH: &str = "/_beerpc_";

/// Protocol token used in the `Upgrade` header.
pub const UPGRADE_PROTOCOL: &str = "beerpc";

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("upgrade"));

    let upgrade_beerpc = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(UPGRADE_PROTOCOL));

    req.method() == Method::GET && connection_upgrade && upgrade_beerpc
}

fn empty_response(status: StatusCode) -> Response<Empty<Bytes>> {
    let mut res = Response::new(Empty::new());
    *res.status_mut() = status;
    res
}

impl Server {
    /// Accept HTTP connections until the token is cancelled, handing every
    /// upgraded stream to [`Server::serve_conn`].
    pub async fn serve_http(&self, listener: TcpListener, token: CancellationToken) -> Result<()> {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, path = DEFAULT_RPC_PATH, "rpc server: serving http"),
            Err(e) => debug!(error = %e, "rpc server: unknown local address"),
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("rpc server: stop accepting http connections");
                    return Ok(());
                }
                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "rpc server: accept error");
                            return Err(e.into());
                        }
                    };

                    let server = self.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let server = server.clone();
                            async move { Ok::<_, Infallible>(server.handle_upgrade(req)) }
                        });

                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades()
                            .await
                        {
                            debug!(%peer, error = %e, "rpc server: http connection error");
                        }
                    });
                }
            }
        }
    }

    fn handle_upgrade(&self, req: Request<Incoming>) -> Response<Empty<Bytes>> {
        if req.uri().path() != DEFAULT_RPC_PATH {
            return empty_response(StatusCode::NOT_FOUND);
        }

        if !is_upgrade_request(&req) {
            let mut res = empty_response(StatusCode::METHOD_NOT_ALLOWED);
            res.headers_mut()
                .insert(http::header::ALLOW, HeaderValue::from_static("GET"));
            return res;
        }

        let server = self.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => server.serve_conn(TokioIo::new(upgraded)).await,
                Err(e) => warn!(error = %e, "rpc server: upgrade error"),
            }
        });

        let mut res = empty_response(StatusCode::SWITCHING_PROTOCOLS);
        res.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("upgrade"));
        res.headers_mut()
            .insert(UPGRADE, HeaderValue::from_static(UPGRADE_PROTOCOL));
        res
    }
}

async fn upgrade_stream(stream: TcpStream, host: &str) -> Result<Upgraded> {
    let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
        .await
        .map_err(|e| RpcError::Http(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "rpc client: http connection error");
        }
    });

    let req = Request::builder()
        .method(Method::GET)
        .uri(DEFAULT_RPC_PATH)
        .header(HOST, host)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, UPGRADE_PROTOCOL)
        .body(Empty::<Bytes>::new())
        .map_err(|e| RpcError::Http(e.to_string()))?;

    let res = sender
        .send_request(req)
        .await
        .map_err(|e| RpcError::Http(e.to_string()))?;

    if res.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(RpcError::Http(res.status().to_string()));
    }

    hyper::upgrade::on(res)
        .await
        .map_err(|e| RpcError::Http(e.to_string()))
}

/// Connect to a server through its HTTP endpoint.
pub async fn dial_http(addr: &str, option: Option<HandshakeOption>) -> Result<Client> {
    let option = parse_option(option)?;
    connect_with_timeout(option.connect_timeout, async {
        let stream = TcpStream::connect(addr).await?;
        let upgraded = upgrade_stream(stream, addr).await?;
        Client::new(TokioIo::new(upgraded), option.clone()).await
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .method(Method::GET)
            .uri(DEFAULT_RPC_PATH)
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "beerpc")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder()
            .method(Method::POST)
            .uri(DEFAULT_RPC_PATH)
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, "beerpc")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));

        let req = Request::builder()
            .method(Method::GET)
            .uri(DEFAULT_RPC_PATH)
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));
    }
}
