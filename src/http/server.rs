use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::bail;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatcher::dispatcher::Dispatcher;

/// Serve HTTP requests on `listener` until `shutdown` is cancelled. Requests are spread
///  round-robin over the dispatchers, so several dispatchers can share an address the way
///  workers share a load balanced address.
pub async fn serve(listener: TcpListener, dispatchers: Vec<Arc<Dispatcher>>, shutdown: CancellationToken) -> anyhow::Result<()> {
    if dispatchers.is_empty() {
        bail!("at least one dispatcher is required");
    }

    info!("listening on http://{}", listener.local_addr()?);
    let dispatchers = Arc::new(dispatchers);
    let next = Arc::new(AtomicUsize::new(0));

    loop {
        let (stream, peer) = select! {
            _ = shutdown.cancelled() => return Ok(()),
            r = listener.accept() => r?,
        };
        let io = TokioIo::new(stream);

        let dispatchers = dispatchers.clone();
        let next = next.clone();
        let service = service_fn(move |request: Request<Incoming>| {
            let idx = next.fetch_add(1, Ordering::AcqRel) % dispatchers.len();
            let dispatcher = dispatchers[idx].clone();
            async move {
                Ok::<_, Infallible>(dispatcher.dispatch(request).await)
            }
        });

        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            select! {
                _ = shutdown.cancelled() => {}
                r = http1::Builder::new().serve_connection(io, service) => {
                    if let Err(err) = r {
                        debug!(%peer, "error serving connection: {:?}", err);
                    }
                }
            }
        });
    }
}
