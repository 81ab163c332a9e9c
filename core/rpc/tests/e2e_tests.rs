// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use beerpc_rpc::{
    Call, CodecType, HandshakeOption, RpcError, Server, Service, dial, dial_http, x_dial,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

struct Foo;

fn foo_service() -> Service {
    Service::builder("Foo", Foo)
        .method("Sum", |_foo: Arc<Foo>, args: Args| async move {
            Ok::<_, String>(args.num1 + args.num2)
        })
        .method("Sleep", |_foo: Arc<Foo>, args: Args| async move {
            tokio::time::sleep(Duration::from_millis(args.num1 as u64)).await;
            Ok::<_, String>(args.num1 + args.num2)
        })
        .method("Fail", |_foo: Arc<Foo>, _args: Args| async move {
            Err::<i64, _>("something went wrong")
        })
        .build()
        .unwrap()
}

async fn start_server() -> (Server, SocketAddr, CancellationToken) {
    let server = Server::new();
    server.register(foo_service()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = CancellationToken::new();

    let accept_server = server.clone();
    let accept_token = token.clone();
    tokio::spawn(async move { accept_server.accept(listener, accept_token).await });

    (server, addr, token)
}

#[tokio::test]
#[traced_test]
async fn test_sum() {
    let (server, addr, token) = start_server().await;
    assert_eq!(server.services(), vec!["Foo".to_string()]);

    for codec in [CodecType::Bincode, CodecType::Json] {
        let option = HandshakeOption::default().with_codec(codec);
        let client = dial(&addr.to_string(), Some(option)).await.unwrap();

        let reply: i64 = client
            .call("Foo.Sum", &Args { num1: 3, num2: 4 })
            .await
            .unwrap();
        assert_eq!(reply, 7);

        client.close().await.unwrap();
    }

    let (_, method) = server.registry().lookup("Foo.Sum").unwrap();
    assert_eq!(method.num_calls(), 2);

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_are_routed_by_seq() {
    let (_server, addr, token) = start_server().await;
    let client = dial(&addr.to_string(), None).await.unwrap();

    // later submissions finish first
    let mut calls: Vec<Call<i64>> = Vec::new();
    for i in 0..5i64 {
        let args = Args {
            num1: (5 - i) * 20,
            num2: i,
        };
        calls.push(client.go("Foo.Sleep", &args).await);
    }
    assert_eq!(client.pending_calls(), 5);

    for (i, call) in calls.into_iter().enumerate() {
        let i = i as i64;
        assert_eq!(call.seq(), i as u64 + 1);
        assert_eq!(call.await.unwrap(), (5 - i) * 20 + i);
    }

    // the same connection carries calls from many tasks
    let mut handles = Vec::new();
    for i in 0..10i64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let reply: i64 = client
                .call("Foo.Sum", &Args { num1: i, num2: i * i })
                .await
                .unwrap();
            assert_eq!(reply, i + i * i);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(client.pending_calls(), 0);
    token.cancel();
}

#[tokio::test]
async fn test_call_errors() {
    let (_server, addr, token) = start_server().await;
    let option = HandshakeOption::default().with_codec(CodecType::Json);
    let client = x_dial(&format!("tcp@{}", addr), Some(option))
        .await
        .unwrap();

    let err = client
        .call::<_, i64>("Foo.Fail", &Args { num1: 1, num2: 2 })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(_)));
    assert_eq!(err.to_string(), "something went wrong");

    let err = client
        .call::<_, i64>("Bar.Sum", &Args { num1: 1, num2: 2 })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "rpc server: can't find service Bar");

    let err = client
        .call::<_, i64>("FooSum", &Args { num1: 1, num2: 2 })
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "rpc server: service/method request ill-formed: FooSum"
    );

    // an argument the method cannot decode
    let err = client
        .call::<_, i64>("Foo.Sum", "not the arguments")
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(_)));

    // a reply that does not fit the expected type
    let err = client
        .call::<_, String>("Foo.Sum", &Args { num1: 1, num2: 2 })
        .await;
    assert!(err.is_err());

    // the connection survives all of the above
    let reply: i64 = client
        .call("Foo.Sum", &Args { num1: 1, num2: 2 })
        .await
        .unwrap();
    assert_eq!(reply, 3);
    assert!(client.is_available());

    token.cancel();
}

#[tokio::test]
async fn test_handle_timeout() {
    let (_server, addr, token) = start_server().await;
    let option = HandshakeOption::default().with_handle_timeout(Duration::from_millis(100));
    let client = dial(&addr.to_string(), Some(option)).await.unwrap();

    let start = Instant::now();
    let err = client
        .call::<_, i64>("Foo.Sleep", &Args { num1: 500, num2: 0 })
        .await
        .unwrap_err();
    assert!(start.elapsed() < Duration::from_millis(300));
    assert!(err.is_timeout());
    assert_eq!(
        err.to_string(),
        "rpc server: request handle timeout: expect within 100ms"
    );

    // the late result of the slow call is never delivered
    tokio::time::sleep(Duration::from_millis(600)).await;
    let reply: i64 = client
        .call("Foo.Sleep", &Args { num1: 10, num2: 1 })
        .await
        .unwrap();
    assert_eq!(reply, 11);

    token.cancel();
}

#[tokio::test]
async fn test_call_cancellation() {
    let (_server, addr, token) = start_server().await;
    let client = dial(&addr.to_string(), None).await.unwrap();

    let call_token = CancellationToken::new();
    let cancel = call_token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let err = client
        .call_with_cancellation::<_, i64>("Foo.Sleep", &Args { num1: 500, num2: 0 }, &call_token)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "rpc client: call failed: context canceled");
    assert_eq!(client.pending_calls(), 0);

    let err = client
        .call_timeout::<_, i64>(
            "Foo.Sleep",
            &Args { num1: 500, num2: 0 },
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Cancelled(_)));

    // the abandoned responses are discarded when they arrive
    tokio::time::sleep(Duration::from_millis(600)).await;
    let reply: i64 = client
        .call("Foo.Sum", &Args { num1: 2, num2: 2 })
        .await
        .unwrap();
    assert_eq!(reply, 4);

    token.cancel();
}

#[tokio::test]
async fn test_server_goes_away() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // accept the connection, read the handshake, then hang up
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(stream);
    });

    let client = dial(&addr.to_string(), None).await.unwrap();
    let err = client
        .call::<_, i64>("Foo.Sum", &Args { num1: 1, num2: 2 })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Shutdown));
    assert!(!client.is_available());
}

#[tokio::test]
async fn test_connect_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // an HTTP endpoint that never answers the upgrade
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let option = HandshakeOption::default().with_connect_timeout(Duration::from_millis(100));
    let err = dial_http(&addr.to_string(), Some(option)).await.unwrap_err();
    assert!(matches!(err, RpcError::ConnectTimeout(_)));
    assert!(err.to_string().starts_with("rpc client: connect timeout"));
}

#[tokio::test]
#[traced_test]
async fn test_http_upgrade() {
    let server = Server::new();
    server.register(foo_service()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = CancellationToken::new();

    let http_token = token.clone();
    tokio::spawn(async move { server.serve_http(listener, http_token).await });

    let client = x_dial(&format!("http@{}", addr), None).await.unwrap();
    let reply: i64 = client
        .call("Foo.Sum", &Args { num1: 20, num2: 22 })
        .await
        .unwrap();
    assert_eq!(reply, 42);

    client.close().await.unwrap();
    token.cancel();
}
