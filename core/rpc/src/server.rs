// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::codec::{self, CodecReader, CodecType, CodecWriter};
use crate::error::{Result, RpcError};
use crate::protocol::{self, Header, MAGIC_NUMBER};
use crate::service::{Argument, MethodDescriptor, Service, ServiceRegistry};

type SharedWriter = Arc<Mutex<CodecWriter>>;

/// A fully read request, ready to be invoked.
struct Request {
    header: Header,
    argv: Argument,
    method: Arc<MethodDescriptor>,
}

/// Failure while reading a request. Without a header nothing can be
/// answered and the connection is done.
struct ReadError {
    header: Option<Header>,
    error: RpcError,
}

impl ReadError {
    fn fatal(error: RpcError) -> Self {
        ReadError {
            header: None,
            error,
        }
    }

    fn call(header: Header, error: RpcError) -> Self {
        ReadError {
            header: Some(header),
            error,
        }
    }
}

/// RPC server. Cloning is cheap and clones share the service registry.
#[derive(Clone, Debug, Default)]
pub struct Server {
    registry: Arc<ServiceRegistry>,
}

impl Server {
    pub fn new() -> Self {
        Server::default()
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn register(&self, service: Service) -> Result<()> {
        self.registry.register(service)
    }

    /// Names of the registered services.
    pub fn services(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Accept connections until the token is cancelled, serving each one on
    /// its own task. Connections already accepted are not interrupted.
    pub async fn accept(&self, listener: TcpListener, token: CancellationToken) -> Result<()> {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, "rpc server: listening"),
            Err(e) => debug!(error = %e, "rpc server: unknown local address"),
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("rpc server: stop accepting connections");
                    return Ok(());
                }
                res = listener.accept() => {
                    match res {
                        Ok((stream, peer)) => {
                            debug!(%peer, "rpc server: new connection");
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.serve_conn(stream).await;
                                debug!(%peer, "rpc server: connection closed");
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "rpc server: accept error");
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    /// Serve a single connection until the client stops sending requests.
    ///
    /// The connection starts with the handshake frame. A bad handshake closes
    /// the connection without any response.
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut frames_in, frames_out) = codec::split_stream(stream);

        let option = match protocol::read_handshake(&mut frames_in).await {
            Ok(option) => option,
            Err(e) => {
                warn!(error = %e, "rpc server: options error");
                return;
            }
        };

        if option.magic_number != MAGIC_NUMBER {
            warn!(
                error = %RpcError::InvalidMagicNumber(option.magic_number),
                "rpc server: handshake rejected"
            );
            return;
        }

        let codec = match option.codec() {
            Ok(codec) => codec,
            Err(e) => {
                warn!(error = %e, "rpc server: handshake rejected");
                return;
            }
        };

        debug!(%codec, handle_timeout = ?option.handle_timeout, "rpc server: handshake done");

        let reader = CodecReader::new(frames_in, codec);
        let writer = Arc::new(Mutex::new(CodecWriter::new(frames_out, codec)));
        self.serve_codec(reader, writer, option.handle_timeout).await;
    }

    async fn serve_codec(
        &self,
        mut reader: CodecReader,
        writer: SharedWriter,
        handle_timeout: Duration,
    ) {
        let tracker = TaskTracker::new();
        let codec = reader.codec();

        loop {
            match self.read_request(&mut reader).await {
                Ok(request) => {
                    let writer = writer.clone();
                    tracker.spawn(handle_request(request, writer, codec, handle_timeout));
                }
                Err(ReadError {
                    header: Some(mut header),
                    error,
                }) => {
                    header.error = error.to_string();
                    send_response(&writer, &header, None).await;
                }
                Err(ReadError {
                    header: None,
                    error,
                }) => {
                    if !matches!(error, RpcError::ConnectionClosed) {
                        warn!(%error, "rpc server: read header error");
                    }
                    break;
                }
            }
        }

        // every in-flight call gets its response before the stream is closed
        tracker.close();
        tracker.wait().await;

        if let Err(e) = writer.lock().await.close().await {
            debug!(error = %e, "rpc server: close error");
        }
    }

    async fn read_request(&self, reader: &mut CodecReader) -> std::result::Result<Request, ReadError> {
        let header = reader.read_header().await.map_err(ReadError::fatal)?;

        let method = match self.registry.lookup(&header.service_method) {
            Ok((_, method)) => method,
            Err(e) => {
                // keep the stream aligned on message boundaries
                if let Err(body_err) = reader.discard_body().await {
                    debug!(seq = header.seq, service_method = %header.service_method, error = %body_err, "rpc server: discard body error");
                }
                return Err(ReadError::call(header, e));
            }
        };

        let body = match reader.read_body().await {
            Ok(body) => body,
            Err(e) => return Err(ReadError::call(header, e)),
        };

        match method.new_argv(reader.codec(), &body) {
            Ok(argv) => Ok(Request {
                header,
                argv,
                method,
            }),
            Err(e) => {
                warn!(seq = header.seq, service_method = %header.service_method, error = %e, "rpc server: read body error");
                Err(ReadError::call(header, e))
            }
        }
    }
}

async fn handle_request(
    request: Request,
    writer: SharedWriter,
    codec: CodecType,
    handle_timeout: Duration,
) {
    let Request {
        mut header,
        argv,
        method,
    } = request;

    // The invocation runs on its own task so that a timed out call keeps
    // running to completion. Its late result is dropped.
    let mut invocation = tokio::spawn(method.call(argv, codec));

    let outcome = if handle_timeout.is_zero() {
        invocation.await
    } else {
        tokio::select! {
            res = &mut invocation => res,
            _ = tokio::time::sleep(handle_timeout) => {
                header.error = RpcError::HandleTimeout(handle_timeout).to_string();
                send_response(&writer, &header, None).await;
                debug!(seq = header.seq, service_method = %header.service_method, "rpc server: late result will be discarded");
                return;
            }
        }
    };

    match outcome {
        Ok(Ok(reply)) => send_response(&writer, &header, Some(reply)).await,
        Ok(Err(e)) => {
            header.error = e;
            send_response(&writer, &header, None).await;
        }
        Err(e) => {
            error!(seq = header.seq, service_method = %header.service_method, error = %e, "rpc server: invocation failed");
            header.error = format!("rpc server: invocation failed: {}", e);
            send_response(&writer, &header, None).await;
        }
    }
}

/// Write one response. Error responses carry an empty body.
async fn send_response(writer: &SharedWriter, header: &Header, body: Option<Bytes>) {
    let mut writer = writer.lock().await;
    let res = match body {
        Some(body) => writer.write_raw(header, body).await,
        None => writer.write(header, &()).await,
    };

    if let Err(e) = res {
        error!(seq = header.seq, service_method = %header.service_method, error = %e, "rpc server: write response error");
    }
}
