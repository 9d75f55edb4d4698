use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::channel::channel::{InChannel, OutChannel};
use crate::connection::connection::Connection;
use crate::connection::connection_factory::ConnectionError;
use crate::dispatcher::dispatcher::DispatcherContext;
use crate::dispatcher::dispatcher_id::suffix_of;
use crate::dispatcher::events::{AcceptWaiter, ConnectRequest, DispatcherEvent, ServerAcceptEvent};
use crate::util::filter::filter_queues;
use crate::wire::wire_format::{Op, PacketDisplay};

/// a connection as the dispatcher tracks it, owning both its channels
pub(crate) struct EstablishedConnection {
    pub connection: Connection,
    pub in_channel: InChannel,
    pub out_channel: OutChannel,
}

impl EstablishedConnection {
    pub fn contains_channel(&self, channel_id: Uuid) -> bool {
        self.in_channel.channel_id == channel_id || self.out_channel.channel_id == channel_id
    }

    pub fn dispose(&self) {
        self.in_channel.dispose();
        self.out_channel.dispose();
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum PoolSend {
    Sent,
    /// there is currently no pooled channel to the destination
    NoChannel,
    /// sending failed, and the failed channel was removed from the pool
    Failed,
}

/// The dispatcher's state. It is owned by the processor task, and it is changed only by
///  processing events.
pub(crate) struct DispatcherState {
    pub ctx: Arc<DispatcherContext>,

    // channels
    pub channel_pools: BTreeMap<String, VecDeque<OutChannel>>,
    pub out_channel_waiters: Vec<DispatcherEvent>,

    // client
    pub connect_requests: FxHashMap<Uuid, ConnectRequest>,
    pub out_connections: FxHashMap<Uuid, EstablishedConnection>,

    // server
    pub in_connections: FxHashMap<Uuid, EstablishedConnection>,
    pub accept_queue: VecDeque<ServerAcceptEvent>,
    pub accept_waiters: VecDeque<AcceptWaiter>,

    /// events raised while processing an event, processed before the next queued event
    followups: VecDeque<DispatcherEvent>,
}

pub(crate) async fn run_processor(ctx: Arc<DispatcherContext>, mut receiver: mpsc::UnboundedReceiver<DispatcherEvent>) {
    let max_batch_size = ctx.config.max_batch_size;
    let mut state = DispatcherState::new(ctx.clone());
    let mut batch = Vec::with_capacity(max_batch_size);

    loop {
        let num_received = select! {
            _ = ctx.shutdown.cancelled() => break,
            n = receiver.recv_many(&mut batch, max_batch_size) => n,
        };
        if num_received == 0 {
            break;
        }

        for event in batch.drain(..) {
            if ctx.shutdown.is_cancelled() {
                event.cancel(ConnectionError::DispatcherStopped);
                continue;
            }
            state.process(event).await;
        }
    }

    receiver.close();
    while let Ok(event) = receiver.try_recv() {
        event.cancel(ConnectionError::DispatcherStopped);
    }
    state.shut_down();
    info!("dispatcher stopped");
}

impl DispatcherState {
    pub fn new(ctx: Arc<DispatcherContext>) -> DispatcherState {
        DispatcherState {
            ctx,
            channel_pools: Default::default(),
            out_channel_waiters: Default::default(),
            connect_requests: Default::default(),
            out_connections: Default::default(),
            in_connections: Default::default(),
            accept_queue: Default::default(),
            accept_waiters: Default::default(),
            followups: Default::default(),
        }
    }

    pub fn short_id(&self) -> &str {
        self.ctx.short_id()
    }

    /// Process an event to completion, including all followup events it raises. An error in
    ///  one event's handler is logged, and processing continues with the next event.
    pub async fn process(&mut self, event: DispatcherEvent) {
        self.followups.push_back(event);

        while let Some(event) = self.followups.pop_front() {
            let description = format!("{:?}", event);
            trace!(dispatcher = %self.short_id(), "processing {}", description);

            if let Err(e) = self.handle(event).await {
                error!(dispatcher = %self.short_id(), "error processing {}: {:#}", description, e);
            }
        }
    }

    async fn handle(&mut self, event: DispatcherEvent) -> anyhow::Result<()> {
        match event {
            DispatcherEvent::NewChannel(out_channel) => self.on_new_channel(out_channel),
            DispatcherEvent::ClientConnect(evt) => self.on_client_connect(evt).await,
            DispatcherEvent::ServerAccept(evt) => self.on_server_accept(evt).await,
            DispatcherEvent::ServerConnect(evt) => self.on_server_connect(evt).await,
            DispatcherEvent::ClientAccept(evt) => self.on_client_accept(evt),
            DispatcherEvent::ChannelClosed(evt) => self.on_channel_closed(evt).await,
            DispatcherEvent::ConnectionClosed(evt) => self.on_connection_closed(evt).await,
            DispatcherEvent::Timer(evt) => self.on_timer(evt),
            DispatcherEvent::Status(response) => {
                let _ = response.send(self.status_line());
                Ok(())
            }
        }
    }

    pub fn push_followup(&mut self, event: DispatcherEvent) {
        self.followups.push_back(event);
    }

    /// Take the oldest pooled channel to a remote, removing the pool entry if it becomes empty.
    ///  The returned flag is true if this was the last pooled channel.
    pub fn take_pooled_channel(&mut self, remote: &str) -> Option<(OutChannel, bool)> {
        let queue = self.channel_pools.get_mut(remote)?;
        let channel = queue.pop_front()?;
        let was_last = queue.is_empty();
        if was_last {
            self.channel_pools.remove(remote);
        }
        self.ctx.remove_filter(remote);
        Some((channel, was_last))
    }

    /// the key of the most recently started remote whose id starts with the given prefix
    pub fn find_pool_key(&self, prefix: &str) -> Option<String> {
        self.channel_pools.keys()
            .rev()
            .find(|k| k.starts_with(prefix))
            .cloned()
    }

    /// Remove a pooled channel (if it is pooled), disposing it. Returns true if it was found.
    pub fn remove_pooled_channel(&mut self, channel_id: Uuid) -> bool {
        let mut found = false;
        let ctx = &self.ctx;
        filter_queues(
            &mut self.channel_pools,
            |c| c.channel_id != channel_id,
            |remote, c| {
                trace!(dispatcher = %ctx.short_id(), %channel_id, destination = %remote, "removed out-channel from pool");
                c.dispose();
                ctx.remove_filter(remote);
                found = true;
            });
        found
    }

    /// the connection a channel belongs to, if any, including connections that are still being
    ///  established
    pub fn connection_of_channel(&self, channel_id: Uuid) -> Option<Uuid> {
        self.in_connections.iter()
            .chain(self.out_connections.iter())
            .find(|(_, c)| c.contains_channel(channel_id))
            .map(|(id, _)| *id)
            .or_else(|| self.connect_requests.values()
                .find(|r| r.out_channel.channel_id == channel_id)
                .map(|r| r.connection_id))
            .or_else(|| self.accept_waiters.iter()
                .find(|w| w.in_channel.channel_id == channel_id || w.out_channel.channel_id == channel_id)
                .map(|w| w.connection_id))
            .or_else(|| self.out_channel_waiters.iter()
                .find_map(|w| match w {
                    DispatcherEvent::ServerConnect(e) if e.in_channel.channel_id == channel_id => Some(e.connection_id),
                    _ => None,
                }))
    }

    pub async fn send_packet(&self, out_channel: &OutChannel, op: Op, connection_id: Uuid) -> anyhow::Result<()> {
        timeout(self.ctx.config.send_timeout, out_channel.send(op, connection_id)).await
            .map_err(|_| anyhow!("timed out sending {:?}", PacketDisplay(op, connection_id)))?
    }

    /// Send a control packet over the oldest pooled channel to a remote dispatcher, leaving the
    ///  channel in the pool. A channel that fails is removed from the pool.
    pub async fn send_via_pool(&mut self, destination: &str, op: Op, connection_id: Uuid) -> PoolSend {
        let Some(out_channel) = self.channel_pools.get(destination).and_then(|q| q.front()) else {
            return PoolSend::NoChannel;
        };
        let channel_id = out_channel.channel_id;

        match self.send_packet(out_channel, op, connection_id).await {
            Ok(()) => PoolSend::Sent,
            Err(e) => {
                warn!(dispatcher = %self.short_id(), %channel_id, destination, "could not send {:?}: {:#}", PacketDisplay(op, connection_id), e);
                self.remove_pooled_channel(channel_id);
                PoolSend::Failed
            }
        }
    }

    /// Best-effort notification of a remote dispatcher. If there is no channel to the remote,
    ///  the event waits for one. If sending fails, the event is resubmitted.
    pub async fn notify_remote(&mut self, event: DispatcherEvent, destination: &str, op: Op, id: Uuid) {
        match self.send_via_pool(destination, op, id).await {
            PoolSend::Sent => {
                debug!(dispatcher = %self.short_id(), destination, "sent {:?}", PacketDisplay(op, id));
            }
            PoolSend::NoChannel => {
                trace!(dispatcher = %self.short_id(), destination, "no channel for sending {:?}, waiting", PacketDisplay(op, id));
                self.out_channel_waiters.push(event);
            }
            PoolSend::Failed => {
                self.ctx.submit(event);
            }
        }
    }

    /// all remote dispatchers we know of, ordered by start time
    pub fn remotes(&self) -> Vec<String> {
        let mut remotes = BTreeSet::new();
        remotes.extend(self.channel_pools.keys().cloned());
        remotes.extend(self.out_connections.values().map(|c| c.out_channel.dispatcher_id.clone()));
        remotes.extend(self.in_connections.values().map(|c| c.out_channel.dispatcher_id.clone()));
        remotes.extend(self.connect_requests.values().map(|r| r.out_channel.dispatcher_id.clone()));
        remotes.extend(self.out_channel_waiters.iter().filter_map(|w| w.waits_for_dispatcher()).map(|s| s.to_string()));
        remotes.extend(self.ctx.listeners_per_remote().into_keys());

        let mut remotes = remotes.into_iter().collect::<Vec<_>>();
        remotes.sort_by(|a, b| suffix_of(a).cmp(suffix_of(b)).then_with(|| a.cmp(b)));
        remotes
    }

    /// Pooled out-channels and listened-on in-channels per remote, followed by the sizes of
    ///  connection maps and waiting lists
    pub fn status_line(&self) -> String {
        fn blank(n: usize) -> String {
            if n == 0 { " ".to_string() } else { n.to_string() }
        }

        let remotes = self.remotes();
        let listeners = self.ctx.listeners_per_remote();

        let out_ch = remotes.iter()
            .map(|r| blank(self.channel_pools.get(r).map(|q| q.len()).unwrap_or(0)))
            .collect::<Vec<_>>()
            .join(",");
        let in_ch = remotes.iter()
            .map(|r| blank(listeners.get(r).copied().unwrap_or(0)))
            .collect::<Vec<_>>()
            .join(",");

        let machine_waiters = self.out_channel_waiters.iter()
            .filter_map(|w| w.waits_for_machine())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>()
            .join(",");

        format!("OutCh=[{}] InCh=[{}] OutConn={} InConn={} ConnReq={} AcceptQ={} AcceptW={} ChW={} {}",
                out_ch,
                in_ch,
                blank(self.out_connections.len()),
                blank(self.in_connections.len()),
                blank(self.connect_requests.len()),
                blank(self.accept_queue.len()),
                blank(self.accept_waiters.len()),
                blank(self.out_channel_waiters.len()),
                machine_waiters,
        )
    }

    /// Release everything: pending callers are resolved, all channels are disposed, and
    ///  established connections are failed
    pub fn shut_down(&mut self) {
        for evt in self.followups.drain(..) {
            evt.cancel(ConnectionError::DispatcherStopped);
        }
        for evt in self.out_channel_waiters.drain(..) {
            evt.cancel(ConnectionError::DispatcherStopped);
        }
        for (_, request) in self.connect_requests.drain() {
            request.fail(ConnectionError::DispatcherStopped);
        }
        for evt in self.accept_queue.drain(..) {
            let _ = evt.response.send(Err(ConnectionError::DispatcherStopped.into()));
        }
        for waiter in self.accept_waiters.drain(..) {
            waiter.dispose();
        }
        for (_, connection) in self.in_connections.drain().chain(self.out_connections.drain()) {
            connection.dispose();
            connection.connection.notify_failure();
        }
        for (_, queue) in std::mem::take(&mut self.channel_pools) {
            for channel in queue {
                channel.dispose();
            }
        }
    }
}
