// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing_test::traced_test;

use beerpc::config::{ConfigError, ConfigLoader};
use beerpc::runner::{RunnerError, run_services};
use beerpc::service::Args;
use beerpc_rpc::dial_http;
use beerpc_xclient::{Discovery, RegistryDiscovery, SelectMode, XClient};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_node_serves_and_announces() {
    let registry_port = free_port();
    let server_port = free_port();
    let registry_url = format!("http://127.0.0.1:{}/_beerpc_/registry", registry_port);

    let yaml = format!(
        r#"
runtime:
  drain_timeout: 2s
registry:
  endpoint: "127.0.0.1:{registry_port}"
  timeout: 1m
server:
  endpoint: "127.0.0.1:{server_port}"
  registry: "{registry_url}"
  heartbeat_interval: 10s
"#
    );
    let config = ConfigLoader::from_yaml(&yaml).unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let node = tokio::spawn(run_services(config, async move {
        let _ = stop_rx.await;
    }));

    let discovery = Arc::new(RegistryDiscovery::new(
        &registry_url,
        Duration::from_millis(1),
    ));
    let mut servers = Vec::new();
    for _ in 0..50 {
        match discovery.get_all().await {
            Ok(found) if !found.is_empty() => {
                servers = found;
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    assert_eq!(servers, vec![format!("tcp@127.0.0.1:{}", server_port)]);

    let xclient = XClient::new(discovery, SelectMode::Random, None);
    let sum: i64 = xclient
        .call("Foo.Sum", &Args { num1: 2, num2: 3 }, None)
        .await
        .unwrap();
    assert_eq!(sum, 5);
    xclient.close().await.unwrap();

    stop_tx.send(()).unwrap();
    node.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_node_over_http() {
    let server_port = free_port();
    let yaml = format!(
        "server:\n  endpoint: \"127.0.0.1:{}\"\n  transport: http\n",
        server_port
    );
    let config = ConfigLoader::from_yaml(&yaml).unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let node = tokio::spawn(run_services(config, async move {
        let _ = stop_rx.await;
    }));

    let addr = format!("127.0.0.1:{}", server_port);
    let mut client = None;
    for _ in 0..50 {
        match dial_http(&addr, None).await {
            Ok(c) => {
                client = Some(c);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    let client = client.expect("node never came up");

    let sum: i64 = client
        .call("Foo.Sum", &Args { num1: 40, num2: 2 })
        .await
        .unwrap();
    assert_eq!(sum, 42);
    client.close().await.unwrap();

    stop_tx.send(()).unwrap();
    node.await.unwrap().unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_nothing_to_run() {
    let config = ConfigLoader::from_yaml("tracing:\n  log_level: debug\n").unwrap();
    let err = run_services(config, async {}).await.unwrap_err();
    assert!(matches!(
        err,
        RunnerError::Config(ConfigError::NothingToRun)
    ));
}

#[tokio::test]
#[traced_test]
async fn test_endpoint_in_use() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let yaml = format!("server:\n  endpoint: \"127.0.0.1:{}\"\n", port);
    let config = ConfigLoader::from_yaml(&yaml).unwrap();
    let err = run_services(config, async {}).await.unwrap_err();
    assert!(matches!(err, RunnerError::Listen { .. }));
}

#[tokio::test]
#[traced_test]
async fn test_registry_unreachable_at_start() {
    let server_port = free_port();
    let registry_port = free_port();
    let yaml = format!(
        "server:\n  endpoint: \"127.0.0.1:{}\"\n  registry: \"http://127.0.0.1:{}/_beerpc_/registry\"\n",
        server_port, registry_port
    );
    let config = ConfigLoader::from_yaml(&yaml).unwrap();
    let err = run_services(config, async {}).await.unwrap_err();
    assert!(matches!(err, RunnerError::Registry(_)));
}
