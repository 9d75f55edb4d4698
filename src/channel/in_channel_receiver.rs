use std::sync::Arc;

use tokio::select;
use tokio::time::Instant;
use tracing::{debug, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::channel::channel::{Channel, InChannel};
use crate::channel::stream_guard::{BoxReader, StreamGuard};
use crate::dispatcher::dispatcher::DispatcherContext;
use crate::dispatcher::events::*;
use crate::wire::handshake::read_dispatcher_id;
use crate::wire::wire_format::{self, Cancelled, Op, PacketDisplay};

/// Send a probe to the rendezvous address, and listen on the response as an in-channel
pub(crate) fn spawn_probe(ctx: &Arc<DispatcherContext>) {
    let channel_id = Uuid::new_v4();
    let span = span!(Level::DEBUG, "channel", id = %channel_id.simple());
    tokio::spawn(receive_in_channel(ctx.clone(), channel_id).instrument(span));
}

/// The read loop of an in-channel: the response to our probe starts with the remote's id, followed
///  by control packets. A Connect or Accept claims the channel for a connection, ending the loop.
pub(crate) async fn receive_in_channel(ctx: Arc<DispatcherContext>, channel_id: Uuid) {
    ctx.register_listener(channel_id, None);

    let mut remote = None;
    if let Err(e) = do_receive(&ctx, channel_id, &mut remote).await {
        if e.downcast_ref::<Cancelled>().is_none() {
            warn!(dispatcher = %ctx.short_id(), %channel_id, destination = ?remote, "in-channel failed: {:#}", e);

            if let Some(remote) = remote {
                ctx.submit(DispatcherEvent::ChannelClosed(ChannelClosedEvent::new(channel_id, Some(remote), ChannelCloseOrigin::LocalUnbound)));
            }
        }
    }

    ctx.unregister_listener(channel_id);
}

async fn do_receive(ctx: &Arc<DispatcherContext>, channel_id: Uuid, remote: &mut Option<String>) -> anyhow::Result<()> {
    let response = select! {
        _ = ctx.shutdown.cancelled() => return Err(Cancelled.into()),
        r = ctx.probe_client.probe(&ctx.full_id, channel_id) => r?,
    };
    let Some(mut stream) = response else {
        trace!(dispatcher = %ctx.short_id(), %channel_id, "empty content");
        return Ok(());
    };

    let dispatcher_id = select! {
        _ = ctx.shutdown.cancelled() => return Err(Cancelled.into()),
        r = read_dispatcher_id(&mut stream) => r?,
    };
    let Some(dispatcher_id) = dispatcher_id else {
        trace!(dispatcher = %ctx.short_id(), %channel_id, "empty content");
        return Ok(());
    };

    trace!(dispatcher = %ctx.short_id(), %channel_id, destination = %dispatcher_id, "listening on in-channel");
    ctx.register_listener(channel_id, Some(dispatcher_id.clone()));
    *remote = Some(dispatcher_id.clone());

    loop {
        let (op, id) = wire_format::receive(&mut stream, &ctx.shutdown).await?;
        trace!(dispatcher = %ctx.short_id(), %channel_id, destination = %dispatcher_id, "received {:?}", PacketDisplay(op, id));

        match op {
            Op::Connect | Op::ConnectAndSolicit => {
                let in_channel = claim(ctx, channel_id, dispatcher_id, stream, id);
                ctx.submit(DispatcherEvent::ServerConnect(ServerConnectEvent {
                    connection_id: id,
                    in_channel,
                    do_server_broadcast: op == Op::ConnectAndSolicit,
                    issued: Instant::now(),
                }));
                return Ok(());
            }
            Op::Accept | Op::AcceptAndSolicit => {
                let in_channel = claim(ctx, channel_id, dispatcher_id, stream, id);
                ctx.submit(DispatcherEvent::ClientAccept(ClientAcceptEvent {
                    connection_id: id,
                    in_channel,
                    do_client_broadcast: op == Op::AcceptAndSolicit,
                }));
                return Ok(());
            }
            Op::ChannelClosed => {
                ctx.submit(DispatcherEvent::ChannelClosed(ChannelClosedEvent::new(id, Some(dispatcher_id.clone()), ChannelCloseOrigin::Remote)));
            }
            Op::ConnectionClosed => {
                ctx.submit(DispatcherEvent::ConnectionClosed(ConnectionClosedEvent::new(id, true)));
            }
            Op::Closed => {
                debug!(dispatcher = %ctx.short_id(), %channel_id, destination = %dispatcher_id, "in-channel closed by remote");
                return Ok(());
            }
        }
    }
}

/// hand the stream over to a connection, guarded from now on
fn claim(ctx: &DispatcherContext, channel_id: Uuid, dispatcher_id: String, stream: BoxReader, connection_id: Uuid) -> InChannel {
    let guard = StreamGuard::new(stream, channel_id, ctx.channel_close_callback(channel_id, dispatcher_id.clone()));
    let mut in_channel = Channel::new(channel_id, dispatcher_id, guard);
    in_channel.connection_id = Some(connection_id);
    in_channel
}
