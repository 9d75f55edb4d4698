use tracing::{debug, info, trace};

use crate::connection::connection_factory::ConnectionError;
use crate::dispatcher::dispatcher_state::DispatcherState;
use crate::dispatcher::events::{ChannelCloseOrigin, ChannelClosedEvent, ConnectionClosedEvent, DispatcherEvent};
use crate::util::filter::{filter_deque, filter_map, filter_vec};
use crate::wire::wire_format::Op;

impl DispatcherState {
    pub(crate) async fn on_channel_closed(&mut self, evt: ChannelClosedEvent) -> anyhow::Result<()> {
        let channel_id = evt.channel_id;

        match evt.origin {
            ChannelCloseOrigin::Local => {
                let pending_connect = self.connect_requests.values()
                    .find(|r| r.out_channel.channel_id == channel_id)
                    .map(|r| r.connection_id);
                if let Some(request) = pending_connect.and_then(|id| self.connect_requests.remove(&id)) {
                    debug!(dispatcher = %self.short_id(), %channel_id, connection_id = %request.connection_id, "channel of pending connect failed");
                    let mut closed = ConnectionClosedEvent::new(request.connection_id, false);
                    closed.to_send = Some(request.out_channel.dispatcher_id.clone());
                    request.fail(ConnectionError::ChannelFailed);
                    self.push_followup(DispatcherEvent::ConnectionClosed(closed));
                }
                // a failing channel takes down the connection it belongs to
                else if let Some(connection_id) = self.connection_of_channel(channel_id) {
                    debug!(dispatcher = %self.short_id(), %channel_id, %connection_id, "channel of connection closed");
                    self.push_followup(DispatcherEvent::ConnectionClosed(ConnectionClosedEvent::new(connection_id, false)));
                }
                else {
                    self.remove_pooled_channel(channel_id);
                }
            }
            ChannelCloseOrigin::Remote => {
                if self.remove_pooled_channel(channel_id) {
                    debug!(dispatcher = %self.short_id(), %channel_id, "remote closed pooled channel");
                }
            }
            ChannelCloseOrigin::LocalUnbound => {
                let Some(remote) = evt.dispatcher_id.clone() else {
                    return Ok(());
                };
                self.notify_remote(DispatcherEvent::ChannelClosed(evt), &remote, Op::ChannelClosed, channel_id).await;
            }
        }
        Ok(())
    }

    /// Tear down a connection in whatever stage it is, and tell the remote dispatcher unless it
    ///  was the remote that closed it
    pub(crate) async fn on_connection_closed(&mut self, mut evt: ConnectionClosedEvent) -> anyhow::Result<()> {
        let connection_id = evt.connection_id;
        let mut target = None;

        filter_map(
            &mut self.connect_requests,
            |r| r.connection_id != connection_id,
            |_, r| {
                target = Some(r.out_channel.dispatcher_id.clone());
                r.fail(ConnectionError::Closed);
            });

        filter_deque(
            &mut self.accept_waiters,
            |w| w.connection_id != connection_id,
            |w| {
                target = Some(w.in_channel.dispatcher_id.clone());
                w.dispose();
            });

        filter_vec(
            &mut self.out_channel_waiters,
            |w| !w.cancel_with_connection(connection_id),
            |w| {
                if let Some(remote) = w.waits_for_dispatcher() {
                    target = Some(remote.to_string());
                }
                w.cancel(ConnectionError::Closed);
            });

        let established = self.in_connections.remove(&connection_id)
            .or_else(|| self.out_connections.remove(&connection_id));
        if let Some(established) = established {
            info!(dispatcher = %self.short_id(), %connection_id, from_remote = evt.from_remote, "closing connection");
            target = Some(established.out_channel.dispatcher_id.clone());
            established.dispose();
            established.connection.notify_failure();
        }

        if evt.from_remote {
            return Ok(());
        }

        let Some(target) = target.or_else(|| evt.to_send.clone()) else {
            trace!(dispatcher = %self.short_id(), %connection_id, "closed connection is unknown, nobody to notify");
            return Ok(());
        };
        evt.to_send = Some(target.clone());
        self.notify_remote(DispatcherEvent::ConnectionClosed(evt), &target, Op::ConnectionClosed, connection_id).await;
        Ok(())
    }
}
