use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use clap_derive::Parser;
use hyper::Uri;
use rendezvous::connection::connection_factory::ConnectionFactory;
use rendezvous::dispatcher::dispatcher::Dispatcher;
use rendezvous::dispatcher::dispatcher_config::DispatcherConfig;
use rendezvous::http::probe_client::HttpProbeClient;
use rendezvous::http::server::serve;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

/// Runs several dispatchers behind one local HTTP listener, then connects the first one to the
///  second one and echoes a message through the connection
#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:8080")]
    http_address: String,

    #[clap(short, long, default_value_t = 3)]
    num_dispatchers: usize,

    #[clap(short, long, default_value = "hello through the rendezvous")]
    message: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.num_dispatchers < 2 {
        return Err(anyhow!("at least two dispatchers are needed for a connection"));
    }

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let http_addr: SocketAddr = args.http_address.parse()?;
    let listener = TcpListener::bind(http_addr).await?;
    let function_address: Uri = format!("http://{}/api/dispatch", listener.local_addr()?).parse()?;

    let mut dispatchers = Vec::new();
    for i in 0..args.num_dispatchers {
        let config = DispatcherConfig::new(function_address.clone(), format!("worker{}", i));
        let probe_client = Arc::new(HttpProbeClient::new(function_address.clone()));
        dispatchers.push(Arc::new(Dispatcher::new(config, probe_client)?));
    }

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve(listener, dispatchers.clone(), shutdown.clone()));
    for d in &dispatchers {
        d.start();
    }

    let client_factory = ConnectionFactory::new(&dispatchers[0]);
    let server_factory = ConnectionFactory::new(&dispatchers[1]);

    let echo = tokio::spawn(async move {
        let connection = server_factory.accept().await?;
        info!("accepted {:?}", connection);
        let (mut input, mut output) = connection.into_streams();

        let mut buf = vec![0u8; 4096];
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                return anyhow::Ok(());
            }
            output.write_all(&buf[..n]).await?;
            output.flush().await?;
        }
    });

    // the trailing space keeps 'worker1' from matching 'worker10'
    let destination = format!("{} ", dispatchers[1].id().prefix());
    let connection = timeout(Duration::from_secs(60), client_factory.connect(&destination, false)).await??
        .ok_or_else(|| anyhow!("{} is not available", destination))?;
    info!("connected {:?}", connection);

    let mut out_stream = connection.out_stream();
    out_stream.write_all(args.message.as_bytes()).await?;
    out_stream.flush().await?;

    let mut in_stream = connection.in_stream();
    let mut buf = vec![0u8; args.message.len()];
    in_stream.read_exact(&mut buf).await?;
    info!("echoed: {}", String::from_utf8_lossy(&buf));

    for d in &dispatchers {
        info!("{:?}: {}", d, d.status().await?);
    }

    connection.close().await?;
    let _ = timeout(Duration::from_secs(5), echo).await;

    for d in &dispatchers {
        d.stop().await;
    }
    shutdown.cancel();
    server.await??;
    Ok(())
}
