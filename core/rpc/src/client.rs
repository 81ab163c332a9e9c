// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::codec::{self, CodecReader, CodecType, CodecWriter};
use crate::error::{Result, RpcError};
use crate::protocol::{self, Header, HandshakeOption};

type CallResult = Result<Bytes>;

/// An outstanding call, waiting for its response.
struct PendingCall {
    service_method: String,
    done: oneshot::Sender<CallResult>,
}

impl PendingCall {
    fn complete(self, result: CallResult) {
        // the caller may have stopped waiting
        if self.done.send(result).is_err() {
            debug!(service_method = %self.service_method, "rpc client: call abandoned by caller");
        }
    }
}

#[derive(Default)]
struct ClientState {
    seq: u64,
    pending: HashMap<u64, PendingCall>,
    // close was requested by the user
    closing: bool,
    // the connection failed or the receive loop stopped
    shutdown: bool,
}

struct ClientInner {
    option: HandshakeOption,
    codec: CodecType,
    sending: tokio::sync::Mutex<CodecWriter>,
    state: Mutex<ClientState>,
    token: CancellationToken,
}

impl ClientInner {
    fn register_call(&self, call: PendingCall) -> std::result::Result<u64, PendingCall> {
        let mut state = self.state.lock();
        if state.closing || state.shutdown {
            return Err(call);
        }

        let seq = state.seq;
        state.seq += 1;
        state.pending.insert(seq, call);
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<PendingCall> {
        self.state.lock().pending.remove(&seq)
    }

    /// Fail every pending call and refuse new ones.
    fn terminate_calls(&self, error: &RpcError) {
        let pending = {
            let mut state = self.state.lock();
            state.shutdown = true;
            std::mem::take(&mut state.pending)
        };

        if !pending.is_empty() {
            debug!(
                count = pending.len(),
                %error,
                "rpc client: terminating pending calls"
            );
        }

        for (_, call) in pending {
            call.complete(Err(RpcError::Shutdown));
        }
    }
}

/// Shuts the connection down if a request write is interrupted halfway,
/// since the peer can no longer find the next message boundary.
struct WriteGuard<'a> {
    inner: &'a ClientInner,
    armed: bool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("rpc client: request write interrupted, closing connection");
            self.inner.token.cancel();
        }
    }
}

/// A submitted call. Await it to get the decoded reply.
///
/// The reply is decoded when the call completes, so a body that does not
/// match `R` fails only this call.
pub struct Call<R> {
    seq: u64,
    service_method: String,
    codec: CodecType,
    done: oneshot::Receiver<CallResult>,
    _reply: PhantomData<fn() -> R>,
}

impl<R> Call<R> {
    /// Sequence number of the call, 0 if it was never sent.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }
}

impl<R: DeserializeOwned> Future for Call<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.done).poll(cx) {
            Poll::Ready(Ok(Ok(body))) => Poll::Ready(this.codec.decode(&body)),
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::Shutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A connection to one server, able to carry many concurrent calls.
///
/// Clones share the connection. The connection is closed by [`Client::close`]
/// or when the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    _guard: Arc<DropGuard>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("codec", &self.inner.codec)
            .field("available", &self.is_available())
            .finish()
    }
}

impl Client {
    /// Run the handshake over an established stream and start receiving
    /// responses.
    pub async fn new<S>(stream: S, option: HandshakeOption) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = option.codec()?;
        let (frames_in, mut frames_out) = codec::split_stream(stream);

        protocol::write_handshake(&mut frames_out, &option)
            .await
            .map_err(|e| RpcError::Handshake(e.to_string()))?;

        let token = CancellationToken::new();
        let inner = Arc::new(ClientInner {
            option,
            codec,
            sending: tokio::sync::Mutex::new(CodecWriter::new(frames_out, codec)),
            state: Mutex::new(ClientState {
                seq: 1,
                ..Default::default()
            }),
            token: token.clone(),
        });

        tokio::spawn(receive(inner.clone(), CodecReader::new(frames_in, codec)));

        Ok(Client {
            inner,
            _guard: Arc::new(token.drop_guard()),
        })
    }

    pub fn option(&self) -> &HandshakeOption {
        &self.inner.option
    }

    /// False once the client is closing or the connection has failed.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock();
        !state.closing && !state.shutdown
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Close the connection. Pending calls fail with [`RpcError::Shutdown`].
    /// Closing twice is an error.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }

        self.inner.token.cancel();
        self.inner.sending.lock().await.close().await
    }

    /// Submit a call without waiting for its response.
    ///
    /// The returned [`Call`] completes with the reply or with the error that
    /// prevented it. Submission itself must not be cancelled halfway: a
    /// dropped submission closes the connection.
    pub async fn go<A, R>(&self, service_method: &str, args: &A) -> Call<R>
    where
        A: Serialize + ?Sized,
    {
        let (tx, rx) = oneshot::channel();
        let seq = self.send(service_method, args, tx).await;

        Call {
            seq,
            service_method: service_method.to_string(),
            codec: self.inner.codec,
            done: rx,
            _reply: PhantomData,
        }
    }

    /// Submit a call and wait for its reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await.await
    }

    /// Like [`Client::call`], giving up when `token` is cancelled. A call
    /// given up on is forgotten and its late response ignored.
    pub async fn call_with_cancellation<A, R>(
        &self,
        service_method: &str,
        args: &A,
        token: &CancellationToken,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if token.is_cancelled() {
            return Err(RpcError::Cancelled("context canceled".to_string()));
        }

        let call = self.go(service_method, args).await;
        let seq = call.seq();

        tokio::select! {
            res = call => res,
            _ = token.cancelled() => {
                self.inner.remove_call(seq);
                Err(RpcError::Cancelled("context canceled".to_string()))
            }
        }
    }

    /// Like [`Client::call`] with a deadline.
    pub async fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let call = self.go(service_method, args).await;
        let seq = call.seq();

        match tokio::time::timeout(timeout, call).await {
            Ok(res) => res,
            Err(_) => {
                self.inner.remove_call(seq);
                Err(RpcError::Cancelled("context deadline exceeded".to_string()))
            }
        }
    }

    async fn send<A>(&self, service_method: &str, args: &A, done: oneshot::Sender<CallResult>) -> u64
    where
        A: Serialize + ?Sized,
    {
        let mut writer = self.inner.sending.lock().await;

        let call = PendingCall {
            service_method: service_method.to_string(),
            done,
        };
        let seq = match self.inner.register_call(call) {
            Ok(seq) => seq,
            Err(call) => {
                call.complete(Err(RpcError::Shutdown));
                return 0;
            }
        };

        let header = Header::new(service_method, seq);
        let mut guard = WriteGuard {
            inner: &self.inner,
            armed: true,
        };
        let res = writer.write(&header, args).await;
        guard.armed = false;

        if let Err(e) = res {
            // the call may already have been completed by the receive loop
            if let Some(call) = self.inner.remove_call(seq) {
                call.complete(Err(e));
            }
        }

        seq
    }
}

/// Receive loop: route each response to its pending call until the
/// connection fails or the client is closed.
async fn receive(inner: Arc<ClientInner>, mut reader: CodecReader) {
    let error = loop {
        let header = tokio::select! {
            _ = inner.token.cancelled() => break RpcError::Shutdown,
            res = reader.read_header() => match res {
                Ok(header) => header,
                Err(e) => break e,
            },
        };

        let res = match inner.remove_call(header.seq) {
            // usually a call that was given up on, or whose send failed
            None => reader.discard_body().await,
            Some(call) if header.is_error() => {
                call.complete(Err(RpcError::from_remote(&header.error)));
                reader.discard_body().await
            }
            Some(call) => match reader.read_body().await {
                Ok(body) => {
                    call.complete(Ok(body));
                    Ok(())
                }
                Err(e) => {
                    call.complete(Err(RpcError::Decode(e.to_string())));
                    Err(e)
                }
            },
        };

        if let Err(e) = res {
            break e;
        }
    };

    debug!(%error, "rpc client: receive loop stopped");
    inner.terminate_calls(&error);
}

pub(crate) fn parse_option(option: Option<HandshakeOption>) -> Result<HandshakeOption> {
    option.unwrap_or_default().normalize()
}

/// Bound connection setup by the option's connect timeout, zero meaning
/// no bound. A connection that times out is dropped.
pub(crate) async fn connect_with_timeout<F>(connect_timeout: Duration, connect: F) -> Result<Client>
where
    F: Future<Output = Result<Client>>,
{
    if connect_timeout.is_zero() {
        return connect.await;
    }

    match tokio::time::timeout(connect_timeout, connect).await {
        Ok(res) => res,
        Err(_) => Err(RpcError::ConnectTimeout(connect_timeout)),
    }
}

/// Connect to a server over TCP.
pub async fn dial(addr: &str, option: Option<HandshakeOption>) -> Result<Client> {
    let option = parse_option(option)?;
    connect_with_timeout(option.connect_timeout, async {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Client::new(stream, option.clone()).await
    })
    .await
}

/// Connect to a server over a unix domain socket.
#[cfg(unix)]
pub async fn dial_unix(path: &str, option: Option<HandshakeOption>) -> Result<Client> {
    let option = parse_option(option)?;
    connect_with_timeout(option.connect_timeout, async {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Client::new(stream, option.clone()).await
    })
    .await
}

/// Connect using an address of the form "protocol@addr", where protocol is
/// one of tcp, tcp4, tcp6, unix or http.
pub async fn x_dial(rpc_addr: &str, option: Option<HandshakeOption>) -> Result<Client> {
    let Some((protocol, addr)) = rpc_addr.split_once('@') else {
        return Err(RpcError::InvalidAddress(rpc_addr.to_string()));
    };

    if addr.is_empty() || addr.contains('@') {
        return Err(RpcError::InvalidAddress(rpc_addr.to_string()));
    }

    match protocol {
        "tcp" | "tcp4" | "tcp6" => dial(addr, option).await,
        "http" => crate::http::dial_http(addr, option).await,
        #[cfg(unix)]
        "unix" => dial_unix(addr, option).await,
        other => Err(RpcError::UnsupportedProtocol(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_x_dial_wrong_format() {
        let err = x_dial("localhost:9999", None).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "rpc client err: wrong format 'localhost:9999', expect protocol@addr"
        );

        let err = x_dial("tcp@a@b", None).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidAddress(_)));

        let err = x_dial("quic@localhost:9999", None).await.unwrap_err();
        assert!(matches!(err, RpcError::UnsupportedProtocol(_)));
    }

    #[tokio::test]
    async fn test_dial_invalid_codec() {
        let option = HandshakeOption {
            codec_type: "application/gob".to_string(),
            ..HandshakeOption::default()
        };
        let err = dial("127.0.0.1:1", Some(option)).await.unwrap_err();
        assert!(matches!(err, RpcError::Config(_)));
    }

    #[tokio::test]
    async fn test_sequence_starts_at_one() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = Client::new(client_io, HandshakeOption::default())
            .await
            .unwrap();

        let first: Call<i64> = client.go("Foo.Sum", &(1, 2)).await;
        let second: Call<i64> = client.go("Foo.Sum", &(3, 4)).await;
        assert_eq!(first.seq(), 1);
        assert_eq!(second.seq(), 2);
        assert_eq!(client.pending_calls(), 2);

        // the peer goes away before answering
        drop(server_io);
        assert!(matches!(first.await, Err(RpcError::Shutdown)));
        assert!(matches!(second.await, Err(RpcError::Shutdown)));
        assert!(!client.is_available());

        let late: Call<i64> = client.go("Foo.Sum", &(5, 6)).await;
        assert_eq!(late.seq(), 0);
        assert!(matches!(late.await, Err(RpcError::Shutdown)));
    }

    #[tokio::test]
    async fn test_close_twice() {
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let client = Client::new(client_io, HandshakeOption::default())
            .await
            .unwrap();

        client.close().await.unwrap();
        assert!(!client.is_available());
        assert!(matches!(client.close().await, Err(RpcError::Shutdown)));
    }
}
