use std::fmt::{Debug, Formatter};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::anyhow;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::HeaderValue;
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode};
use rustc_hash::FxHashMap;
use tokio::io::{duplex, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio::{pin, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::channel::channel::OutChannel;
use crate::channel::stream_guard::{BoxWriter, CloseKind, StreamGuard};
use crate::dispatcher::dispatcher_config::DispatcherConfig;
use crate::dispatcher::dispatcher_id::DispatcherId;
use crate::dispatcher::dispatcher_state::run_processor;
use crate::dispatcher::events::{ChannelCloseOrigin, ChannelClosedEvent, DispatcherEvent, TimerEvent};
use crate::http::body::ChannelBody;
use crate::http::probe_client::ProbeClient;
use crate::wire::handshake::encode_dispatcher_id;

/// name of the HTTP header carrying the sending dispatcher's id, both on probe requests and on
///  all of the dispatcher's responses
pub const DISPATCHER_ID_HEADER: &str = "DispatcherId";

/// query parameter carrying the id of the channel a probe request establishes
pub const CHANNEL_ID_PARAM: &str = "channelId";

pub type DispatchBody = BoxBody<Bytes, io::Error>;

/// State that is shared between the dispatcher's processor and the concurrent parts: HTTP
///  handlers, probe tasks and stream guard callbacks. Everything else is owned by the processor.
pub(crate) struct DispatcherContext {
    pub id: DispatcherId,
    pub full_id: String,
    pub config: Arc<DispatcherConfig>,
    submitter: mpsc::UnboundedSender<DispatcherEvent>,

    /// remotes with a full pool, mapped to when we accept their probes again
    pub filter: RwLock<FxHashMap<String, Instant>>,
    /// in-channels that are being listened on, mapped to their remote's id once the handshake is
    ///  read
    pub in_channel_listeners: RwLock<FxHashMap<Uuid, Option<String>>>,

    broadcast_requested: AtomicBool,
    broadcast_notify: Notify,

    pub shutdown: CancellationToken,
    shutdown_imminent: AtomicBool,

    pub probe_client: Arc<dyn ProbeClient>,
}

impl Debug for DispatcherContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.id)
    }
}

impl DispatcherContext {
    pub fn short_id(&self) -> &str {
        self.id.prefix()
    }

    /// Hand an event to the processor. This is the only way to change dispatcher state, and it
    ///  can be called from anywhere.
    pub fn submit(&self, event: DispatcherEvent) {
        if let Err(e) = self.submitter.send(event) {
            debug!(dispatcher = %self.short_id(), "dispatcher is stopped, dropping event {:?}", e.0);
            e.0.cancel(crate::connection::connection_factory::ConnectionError::DispatcherStopped);
        }
    }

    pub fn do_broadcast(&self) {
        self.broadcast_requested.store(true, Ordering::Release);
        self.broadcast_notify.notify_waiters();
    }

    /// returns true and resets the flag if an out-of-band broadcast was requested
    pub fn take_broadcast_request(&self) -> bool {
        self.broadcast_requested.swap(false, Ordering::AcqRel)
    }

    /// Wait until `deadline` or until a broadcast is requested, whichever comes first. Returns
    ///  false if the dispatcher is shut down in the meantime.
    pub async fn wait_for_broadcast(&self, deadline: Instant) -> bool {
        let notified = self.broadcast_notify.notified();
        pin!(notified);
        notified.as_mut().enable();

        if self.broadcast_requested.load(Ordering::Acquire) {
            return !self.shutdown.is_cancelled();
        }

        select! {
            _ = self.shutdown.cancelled() => false,
            _ = sleep_until(deadline) => true,
            _ = notified => true,
        }
    }

    pub fn is_shutdown_imminent(&self) -> bool {
        self.shutdown_imminent.load(Ordering::Acquire)
    }

    pub fn is_filtered(&self, remote: &str, now: Instant) -> bool {
        self.filter.read().unwrap_or_else(PoisonError::into_inner)
            .get(remote)
            .map(|next_refresh| now < *next_refresh)
            .unwrap_or(false)
    }

    pub fn set_filter(&self, remote: &str, next_refresh: Instant) {
        self.filter.write().unwrap_or_else(PoisonError::into_inner)
            .insert(remote.to_string(), next_refresh);
    }

    pub fn remove_filter(&self, remote: &str) {
        self.filter.write().unwrap_or_else(PoisonError::into_inner)
            .remove(remote);
    }

    pub fn register_listener(&self, channel_id: Uuid, remote: Option<String>) {
        self.in_channel_listeners.write().unwrap_or_else(PoisonError::into_inner)
            .insert(channel_id, remote);
    }

    pub fn unregister_listener(&self, channel_id: Uuid) {
        self.in_channel_listeners.write().unwrap_or_else(PoisonError::into_inner)
            .remove(&channel_id);
    }

    /// number of in-channels being listened on, per remote dispatcher
    pub fn listeners_per_remote(&self) -> FxHashMap<String, usize> {
        let mut result = FxHashMap::default();
        for remote in self.in_channel_listeners.read().unwrap_or_else(PoisonError::into_inner).values().flatten() {
            *result.entry(remote.clone()).or_default() += 1;
        }
        result
    }

    /// The callback for a channel's stream guard: a failing or closing stream is reported to the
    ///  processor as a [ChannelClosedEvent]
    pub fn channel_close_callback(&self, channel_id: Uuid, remote: String) -> impl Fn(CloseKind) + Send + Sync + 'static {
        let submitter = self.submitter.clone();
        move |_| {
            let _ = submitter.send(DispatcherEvent::ChannelClosed(ChannelClosedEvent::new(
                channel_id,
                Some(remote.clone()),
                ChannelCloseOrigin::Local,
            )));
        }
    }
}

/// The per-process coordinator for channels and connections.
///
/// All state changes go through a single processor task that handles [DispatcherEvent]s one at a
///  time. HTTP requests from remote dispatchers enter through [Dispatcher::dispatch], and
///  connections are established through a
///  [ConnectionFactory](crate::connection::connection_factory::ConnectionFactory).
pub struct Dispatcher {
    ctx: Arc<DispatcherContext>,
    id_header: HeaderValue,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<DispatcherEvent>>>,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.ctx.id)
    }
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, probe_client: Arc<dyn ProbeClient>) -> anyhow::Result<Dispatcher> {
        let id = DispatcherId::new(&config.id_prefix);
        Self::new_with_id(config, id, probe_client)
    }

    pub fn new_with_id(config: DispatcherConfig, id: DispatcherId, probe_client: Arc<dyn ProbeClient>) -> anyhow::Result<Dispatcher> {
        config.validate()?;

        let full_id = id.full();
        let id_header = HeaderValue::from_str(&full_id)?;
        let (submitter, receiver) = mpsc::unbounded_channel();

        Ok(Dispatcher {
            ctx: Arc::new(DispatcherContext {
                id,
                full_id,
                config: Arc::new(config),
                submitter,
                filter: Default::default(),
                in_channel_listeners: Default::default(),
                broadcast_requested: AtomicBool::new(false),
                broadcast_notify: Notify::new(),
                shutdown: CancellationToken::new(),
                shutdown_imminent: AtomicBool::new(false),
                probe_client,
            }),
            id_header,
            receiver: Mutex::new(Some(receiver)),
            processor: Mutex::new(None),
        })
    }

    pub(crate) fn context(&self) -> Arc<DispatcherContext> {
        self.ctx.clone()
    }

    /// for driving the processor's state directly in tests
    #[cfg(test)]
    pub(crate) fn take_receiver_for_test(&self) -> mpsc::UnboundedReceiver<DispatcherEvent> {
        self.receiver.lock().unwrap().take().unwrap()
    }

    pub fn id(&self) -> &DispatcherId {
        &self.ctx.id
    }

    /// the full id as it is sent to remote dispatchers
    pub fn full_id(&self) -> &str {
        &self.ctx.full_id
    }

    /// Spawn the processor and start broadcasting. Calling this more than once has no effect.
    pub fn start(&self) {
        let Some(receiver) = self.receiver.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            debug!(dispatcher = %self.ctx.short_id(), "start called on a dispatcher that was started before");
            return;
        };

        info!(dispatcher = %self.ctx.short_id(), id = %self.ctx.full_id, "starting dispatcher");

        let span = span!(Level::INFO, "dispatcher", id = %self.ctx.short_id());
        let handle = tokio::spawn(run_processor(self.ctx.clone(), receiver).instrument(span));
        *self.processor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        self.ctx.submit(DispatcherEvent::Timer(TimerEvent { count: 0 }));
    }

    /// Stop initiating broadcasts, typically in preparation for shutdown. Existing channels and
    ///  connections keep working.
    pub fn prepare_shutdown(&self) {
        info!(dispatcher = %self.ctx.short_id(), "preparing shutdown");
        self.ctx.shutdown_imminent.store(true, Ordering::Release);
    }

    /// Cancel all read loops and probes, and wait for the processor to terminate. Pending callers
    ///  are resolved with
    ///  [ConnectionError::DispatcherStopped](crate::connection::connection_factory::ConnectionError::DispatcherStopped).
    pub async fn stop(&self) {
        info!(dispatcher = %self.ctx.short_id(), "dispatcher is shutting down");
        self.ctx.shutdown_imminent.store(true, Ordering::Release);
        self.ctx.shutdown.cancel();

        // if the dispatcher was never started, dropping the receiver fails pending callers
        drop(self.receiver.lock().unwrap_or_else(PoisonError::into_inner).take());

        let handle = self.processor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(dispatcher = %self.ctx.short_id(), "dispatcher failed to shut down cleanly: {}", e);
            }
        }
    }

    /// trigger a broadcast without waiting for the next regular one
    pub fn do_broadcast(&self) {
        self.ctx.do_broadcast();
    }

    /// A human-readable summary of pools, connections and pending requests
    pub async fn status(&self) -> anyhow::Result<String> {
        let (sender, receiver) = oneshot::channel();
        self.ctx.submit(DispatcherEvent::Status(sender));
        receiver.await
            .map_err(|_| anyhow!("dispatcher is not running"))
    }

    /// The single HTTP entry point, for probes from remote dispatchers and for admin requests.
    ///
    /// * Requests without a `DispatcherId` header get a status line (200 for GET, 202 otherwise).
    /// * Probes from ourselves get 204.
    /// * Probes without a valid `channelId` query parameter get 400.
    /// * Probes from a remote with a full pool get an empty 200.
    /// * All other probes get 202 with a body that stays open, becoming an out-channel.
    pub async fn dispatch<B>(&self, request: Request<B>) -> Response<DispatchBody> {
        let (parts, body) = request.into_parts();
        drop(body);

        let mut response = match self.try_dispatch(&parts).await {
            Ok(response) => response,
            Err(e) => {
                error!(dispatcher = %self.ctx.short_id(), "failed to handle request: {:#}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Dispatcher {} failed to handle request.", self.ctx.full_id))
            }
        };
        response.headers_mut().insert(DISPATCHER_ID_HEADER, self.id_header.clone());
        response
    }

    async fn try_dispatch(&self, parts: &Parts) -> anyhow::Result<Response<DispatchBody>> {
        let Some(from) = parts.headers.get(DISPATCHER_ID_HEADER) else {
            // a request from outside, to start or inquire
            let status = if parts.method == Method::GET { StatusCode::OK } else { StatusCode::ACCEPTED };
            let text = format!("{:?} {}\n", self.ctx.id, self.status().await?);
            return Ok(text_response(status, text));
        };

        let channel_id = query_param(parts.uri.query(), CHANNEL_ID_PARAM)
            .and_then(|s| Uuid::parse_str(s).ok());
        let (Ok(from), Some(channel_id)) = (from.to_str(), channel_id) else {
            error!(dispatcher = %self.ctx.short_id(), "bad request {}: cannot parse {:?}", parts.uri, query_param(parts.uri.query(), CHANNEL_ID_PARAM));
            return Ok(empty_response(StatusCode::BAD_REQUEST));
        };

        if from == self.ctx.full_id {
            // we probed ourselves through the load balancer
            return Ok(empty_response(StatusCode::NO_CONTENT));
        }
        if self.ctx.is_filtered(from, Instant::now()) {
            // our pool to this remote is full, no need to keep this one
            return Ok(empty_response(StatusCode::OK));
        }

        trace!(dispatcher = %self.ctx.short_id(), %channel_id, destination = from, "contacted");
        let is_first = !self.ctx.listeners_per_remote().contains_key(from);

        let (mut writer, reader) = duplex(self.ctx.config.channel_buffer_size);
        writer.write_all(&encode_dispatcher_id(&self.ctx.full_id)).await?;
        writer.flush().await?;

        let guard = StreamGuard::new(
            Box::pin(writer) as BoxWriter,
            channel_id,
            self.ctx.channel_close_callback(channel_id, from.to_string()),
        );
        self.ctx.submit(DispatcherEvent::NewChannel(OutChannel::new(channel_id, from.to_string(), guard)));

        if is_first {
            self.ctx.do_broadcast();
        }

        Ok(Response::builder()
            .status(StatusCode::ACCEPTED)
            .body(ChannelBody::new(reader).boxed())?)
    }
}

fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?.split('&')
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

fn empty_response(status: StatusCode) -> Response<DispatchBody> {
    let mut response = Response::new(Empty::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
}

fn text_response(status: StatusCode, text: String) -> Response<DispatchBody> {
    let mut response = Response::new(Full::new(Bytes::from(text)).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
}
