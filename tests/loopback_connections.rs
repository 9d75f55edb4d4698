use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rendezvous::connection::connection::Connection;
use rendezvous::connection::connection_factory::{ConnectionError, ConnectionFactory};
use rendezvous::dispatcher::dispatcher::Dispatcher;
use rendezvous::test_util::loopback::start_loopback_dispatchers;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Instant};
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

fn fast_broadcasts(config: &mut rendezvous::dispatcher::dispatcher_config::DispatcherConfig) {
    config.min_broadcast_spacing = Duration::from_millis(50);
    config.initial_broadcast_max_delay = Duration::from_millis(200);
}

async fn stop_all(dispatchers: &[Arc<Dispatcher>]) {
    for d in dispatchers {
        d.stop().await;
    }
}

async fn connect_pair(client: &Dispatcher, server: &Dispatcher, to_machine: &str) -> (Connection, Connection) {
    let client_factory = ConnectionFactory::new(client);
    let server_factory = ConnectionFactory::new(server);

    let to_machine = to_machine.to_string();
    let connecting = tokio::spawn(async move {
        client_factory.connect(&to_machine, false).await
    });
    let accepted = timeout(TEST_TIMEOUT, server_factory.accept()).await.unwrap().unwrap();
    let connected = timeout(TEST_TIMEOUT, connecting).await.unwrap().unwrap().unwrap().unwrap();
    (connected, accepted)
}

#[tokio::test]
async fn test_round_trip() {
    let (_balancer, dispatchers) = start_loopback_dispatchers(&["a", "b"], fast_broadcasts).unwrap();
    let (client, server) = connect_pair(&dispatchers[0], &dispatchers[1], "b").await;

    assert_eq!(client.connection_id(), server.connection_id());
    assert!(!client.is_server_side());
    assert!(server.is_server_side());

    let mut client_out = client.out_stream();
    client_out.write_all(&[0, 1, 2, 3]).await.unwrap();
    client_out.flush().await.unwrap();

    let mut server_in = server.in_stream();
    let mut buf = [0u8; 4];
    timeout(TEST_TIMEOUT, server_in.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(buf, [0, 1, 2, 3]);

    let mut server_out = server.out_stream();
    server_out.write_all(b"pong").await.unwrap();
    server_out.flush().await.unwrap();

    let mut client_in = client.in_stream();
    let mut buf = [0u8; 4];
    timeout(TEST_TIMEOUT, client_in.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"pong");

    stop_all(&dispatchers).await;
}

#[tokio::test]
async fn test_concurrent_connects() {
    const NUM_CONNECTIONS: usize = 10;

    let (_balancer, dispatchers) = start_loopback_dispatchers(&["a", "b", "c"], fast_broadcasts).unwrap();
    let client_factory = ConnectionFactory::new(&dispatchers[0]);
    let server_factory = ConnectionFactory::new(&dispatchers[1]);

    let server = tokio::spawn(async move {
        let mut handles = Vec::new();
        for _ in 0..NUM_CONNECTIONS {
            let connection = server_factory.accept().await.unwrap();
            handles.push(tokio::spawn(async move {
                let connection_id = connection.connection_id();
                let (mut input, mut output) = connection.into_streams();
                let mut buf = [0u8; 8];
                input.read_exact(&mut buf).await.unwrap();
                output.write_all(&buf).await.unwrap();
                output.flush().await.unwrap();
                connection_id
            }));
        }
        let mut connection_ids = Vec::new();
        for handle in handles {
            connection_ids.push(handle.await.unwrap());
        }
        connection_ids
    });

    let mut clients = Vec::new();
    for i in 0..NUM_CONNECTIONS {
        let client_factory = client_factory.clone();
        clients.push(tokio::spawn(async move {
            let connection = client_factory.connect("b", false).await.unwrap().unwrap();
            let connection_id = connection.connection_id();
            let (mut input, mut output) = connection.into_streams();
            let message = (i as u64).to_be_bytes();
            output.write_all(&message).await.unwrap();
            output.flush().await.unwrap();

            let mut buf = [0u8; 8];
            input.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, message);
            connection_id
        }));
    }

    let mut client_ids = HashSet::new();
    for client in clients {
        client_ids.insert(timeout(TEST_TIMEOUT, client).await.unwrap().unwrap());
    }
    let server_ids = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap()
        .into_iter()
        .collect::<HashSet<_>>();

    assert_eq!(client_ids.len(), NUM_CONNECTIONS);
    assert_eq!(client_ids, server_ids);

    stop_all(&dispatchers).await;
}

#[tokio::test]
async fn test_close_tears_down_both_ends() {
    let (_balancer, dispatchers) = start_loopback_dispatchers(&["a", "b"], fast_broadcasts).unwrap();
    let (client, server) = connect_pair(&dispatchers[0], &dispatchers[1], "b").await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    server.on_failure(move || {
        let _ = tx.send(());
    });

    client.close().await.unwrap();

    // the server sees the end of its in-stream first, and then the notification
    let mut server_in = server.in_stream();
    let mut buf = Vec::new();
    let _ = timeout(TEST_TIMEOUT, server_in.read_to_end(&mut buf)).await.unwrap();
    timeout(TEST_TIMEOUT, server.failed()).await.unwrap();
    timeout(TEST_TIMEOUT, rx).await.unwrap().unwrap();
    assert!(client.is_failed());

    stop_all(&dispatchers).await;
}

#[tokio::test]
async fn test_connect_without_queueing_to_unknown_machine() {
    let (_balancer, dispatchers) = start_loopback_dispatchers(&["a", "b"], fast_broadcasts).unwrap();
    let factory = ConnectionFactory::new(&dispatchers[0]);

    assert!(factory.connect("nobody", true).await.unwrap().is_none());

    stop_all(&dispatchers).await;
}

#[tokio::test(start_paused = true)]
async fn test_waiting_connect_times_out() {
    let (_balancer, dispatchers) = start_loopback_dispatchers(&["a"], |_| {}).unwrap();
    let factory = ConnectionFactory::new(&dispatchers[0]);

    let start = Instant::now();
    let err = factory.connect("nobody", false).await.unwrap_err();

    assert!(matches!(err.downcast_ref::<ConnectionError>(), Some(ConnectionError::Timeout { .. })));
    assert!(Instant::now() - start > Duration::from_secs(30));
    assert!(!dispatchers[0].status().await.unwrap().contains("nobody"));

    stop_all(&dispatchers).await;
}

#[tokio::test]
async fn test_stop_resolves_pending_calls() {
    let (_balancer, dispatchers) = start_loopback_dispatchers(&["a"], |_| {}).unwrap();
    let factory = ConnectionFactory::new(&dispatchers[0]);

    let accepting = tokio::spawn({
        let factory = factory.clone();
        async move { factory.accept().await }
    });
    let connecting = tokio::spawn({
        let factory = factory.clone();
        async move { factory.connect("nobody", false).await }
    });

    // give both calls time to reach the processor
    tokio::time::sleep(Duration::from_millis(100)).await;
    dispatchers[0].stop().await;

    let err = timeout(TEST_TIMEOUT, accepting).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.downcast_ref::<ConnectionError>(), Some(&ConnectionError::DispatcherStopped));
    let err = timeout(TEST_TIMEOUT, connecting).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.downcast_ref::<ConnectionError>(), Some(&ConnectionError::DispatcherStopped));
}
