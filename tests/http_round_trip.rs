use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rendezvous::connection::connection_factory::ConnectionFactory;
use rendezvous::dispatcher::dispatcher::{Dispatcher, DISPATCHER_ID_HEADER};
use rendezvous::dispatcher::dispatcher_config::DispatcherConfig;
use rendezvous::http::probe_client::HttpProbeClient;
use rendezvous::http::server::serve;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::Level;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

async fn start_http_dispatchers(prefixes: &[&str]) -> (Uri, Vec<Arc<Dispatcher>>, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address: Uri = format!("http://{}/api/dispatch", listener.local_addr().unwrap()).parse().unwrap();

    let dispatchers = prefixes.iter()
        .map(|prefix| {
            let mut config = DispatcherConfig::new(address.clone(), *prefix);
            config.min_broadcast_spacing = Duration::from_millis(50);
            config.initial_broadcast_max_delay = Duration::from_millis(200);
            let probe_client = Arc::new(HttpProbeClient::new(address.clone()));
            Arc::new(Dispatcher::new(config, probe_client).unwrap())
        })
        .collect::<Vec<_>>();

    let shutdown = CancellationToken::new();
    tokio::spawn(serve(listener, dispatchers.clone(), shutdown.clone()));
    for d in &dispatchers {
        d.start();
    }
    (address, dispatchers, shutdown)
}

#[tokio::test]
async fn test_http_round_trip() {
    let (_address, dispatchers, shutdown) = start_http_dispatchers(&["a", "b"]).await;
    let client_factory = ConnectionFactory::new(&dispatchers[0]);
    let server_factory = ConnectionFactory::new(&dispatchers[1]);

    let connecting = tokio::spawn(async move {
        client_factory.connect("b", false).await
    });
    let server = timeout(TEST_TIMEOUT, server_factory.accept()).await.unwrap().unwrap();
    let client = timeout(TEST_TIMEOUT, connecting).await.unwrap().unwrap().unwrap().unwrap();

    let (mut client_in, mut client_out) = client.into_streams();
    let (mut server_in, mut server_out) = server.into_streams();

    client_out.write_all(&[0, 1, 2, 3]).await.unwrap();
    client_out.flush().await.unwrap();
    let mut buf = [0u8; 4];
    timeout(TEST_TIMEOUT, server_in.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(buf, [0, 1, 2, 3]);

    server_out.write_all(b"back").await.unwrap();
    server_out.flush().await.unwrap();
    timeout(TEST_TIMEOUT, client_in.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"back");

    for d in &dispatchers {
        d.stop().await;
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_status_request() {
    let (address, dispatchers, shutdown) = start_http_dispatchers(&["a"]).await;

    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let response = client.request(Request::get(address.to_string()).body(Empty::new()).unwrap()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(DISPATCHER_ID_HEADER).unwrap().to_str().unwrap(), dispatchers[0].full_id());
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.starts_with("Dispatcher a"));
    assert!(text.contains("OutConn="));

    dispatchers[0].stop().await;
    shutdown.cancel();
}
