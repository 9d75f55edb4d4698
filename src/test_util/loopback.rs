use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::{Request, StatusCode, Uri};
use tracing::trace;
use uuid::Uuid;

use crate::channel::stream_guard::BoxReader;
use crate::dispatcher::dispatcher::{Dispatcher, CHANNEL_ID_PARAM, DISPATCHER_ID_HEADER};
use crate::dispatcher::dispatcher_config::DispatcherConfig;
use crate::http::body::BodyReader;
use crate::http::probe_client::ProbeClient;

pub const LOOPBACK_ADDRESS: &str = "http://loopback/api/dispatch";

/// An in-process stand-in for the load balancer in front of the rendezvous address. Probes are
///  routed round-robin to the registered dispatchers, through their regular `dispatch` entry
///  point, so that the whole protocol runs without sockets.
#[derive(Default)]
pub struct LoopbackBalancer {
    dispatchers: RwLock<Vec<Weak<Dispatcher>>>,
    next: AtomicUsize,
}

impl LoopbackBalancer {
    pub fn new() -> LoopbackBalancer {
        Default::default()
    }

    pub fn register(&self, dispatcher: &Arc<Dispatcher>) {
        self.dispatchers.write().unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(dispatcher));
    }

    /// remove a dispatcher, e.g. to simulate a worker that is taken out of rotation
    pub fn unregister(&self, dispatcher: &Arc<Dispatcher>) {
        self.dispatchers.write().unwrap_or_else(PoisonError::into_inner)
            .retain(|d| d.upgrade().map(|d| !Arc::ptr_eq(&d, dispatcher)).unwrap_or(false));
    }

    fn pick(&self) -> Option<Arc<Dispatcher>> {
        let dispatchers = self.dispatchers.read().unwrap_or_else(PoisonError::into_inner);
        let live = dispatchers.iter()
            .filter_map(|d| d.upgrade())
            .collect::<Vec<_>>();
        if live.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::AcqRel) % live.len();
        live.into_iter().nth(idx)
    }
}

#[async_trait]
impl ProbeClient for LoopbackBalancer {
    async fn probe(&self, from: &str, channel_id: Uuid) -> anyhow::Result<Option<BoxReader>> {
        let Some(dispatcher) = self.pick() else {
            return Ok(None);
        };

        let request = Request::get(format!("{}?{}={}", LOOPBACK_ADDRESS, CHANNEL_ID_PARAM, channel_id))
            .header(DISPATCHER_ID_HEADER, from)
            .body(Empty::<Bytes>::new())?;
        let response = dispatcher.dispatch(request).await;
        trace!(%channel_id, status = %response.status(), to = %dispatcher.full_id(), "loopback probe");

        match response.status() {
            StatusCode::ACCEPTED => Ok(Some(Box::pin(BodyReader::new(response.into_body())))),
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(None),
            status => bail!("unexpected probe response status {}", status),
        }
    }
}

/// Create and start dispatchers with the given id prefixes, all behind one loopback balancer.
///  `adjust_config` is applied to each dispatcher's config.
pub fn start_loopback_dispatchers(prefixes: &[&str], adjust_config: impl Fn(&mut DispatcherConfig)) -> anyhow::Result<(Arc<LoopbackBalancer>, Vec<Arc<Dispatcher>>)> {
    let balancer = Arc::new(LoopbackBalancer::new());
    let mut dispatchers = Vec::new();

    for prefix in prefixes {
        let mut config = DispatcherConfig::new(Uri::from_static(LOOPBACK_ADDRESS), *prefix);
        adjust_config(&mut config);

        let dispatcher = Arc::new(Dispatcher::new(config, balancer.clone())?);
        balancer.register(&dispatcher);
        dispatchers.push(dispatcher);
    }

    for dispatcher in &dispatchers {
        dispatcher.start();
    }
    Ok((balancer, dispatchers))
}
