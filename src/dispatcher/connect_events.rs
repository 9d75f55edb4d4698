use tracing::{debug, warn};

use crate::dispatcher::dispatcher_state::DispatcherState;
use crate::dispatcher::events::{AcceptWaiter, ClientConnectEvent, ConnectRequest, DispatcherEvent, ServerConnectEvent};
use crate::wire::wire_format::Op;

impl DispatcherState {
    /// A local call to connect: claim a pooled channel to the destination and send Connect over
    ///  it, or wait for a channel to show up
    pub(crate) async fn on_client_connect(&mut self, evt: ClientConnectEvent) -> anyhow::Result<()> {
        let Some(key) = self.find_pool_key(&evt.to_machine) else {
            if evt.dont_queue {
                debug!(dispatcher = %self.short_id(), connection_id = %evt.connection_id, destination = %evt.to_machine, "connect canceled because destination was not found in pool");
                let _ = evt.response.send(Ok(None));
            }
            else {
                debug!(dispatcher = %self.short_id(), connection_id = %evt.connection_id, destination = %evt.to_machine, "connect queued");
                self.out_channel_waiters.push(DispatcherEvent::ClientConnect(evt));
            }
            return Ok(());
        };

        if evt.response.is_closed() {
            debug!(dispatcher = %self.short_id(), connection_id = %evt.connection_id, "connect caller is gone, skipping");
            return Ok(());
        }

        let Some((mut out_channel, was_last)) = self.take_pooled_channel(&key) else {
            return Ok(());
        };
        out_channel.connection_id = Some(evt.connection_id);

        // using the last channel to the destination asks it to broadcast so our pool is refilled
        let op = if was_last { Op::ConnectAndSolicit } else { Op::Connect };

        match self.send_packet(&out_channel, op, evt.connection_id).await {
            Ok(()) => {
                debug!(dispatcher = %self.short_id(), channel_id = %out_channel.channel_id, connection_id = %evt.connection_id, destination = %key, "sent Connect");
                self.connect_requests.insert(evt.connection_id, ConnectRequest {
                    connection_id: evt.connection_id,
                    to_machine: evt.to_machine,
                    issued: evt.issued,
                    response: evt.response,
                    out_channel,
                });
            }
            Err(e) => {
                warn!(dispatcher = %self.short_id(), channel_id = %out_channel.channel_id, connection_id = %evt.connection_id, "could not send Connect message: {:#}", e);
                out_channel.dispose();

                // another channel may work
                self.ctx.submit(DispatcherEvent::ClientConnect(evt));
            }
        }
        Ok(())
    }

    /// A remote's Connect arrived on one of our in-channels. The connection needs an out-channel
    ///  back to the remote, and then it waits for a local call to accept.
    pub(crate) async fn on_server_connect(&mut self, mut evt: ServerConnectEvent) -> anyhow::Result<()> {
        if self.is_known_connection(evt.connection_id) {
            warn!(dispatcher = %self.short_id(), connection_id = %evt.connection_id, "duplicate Connect, ignoring");
            evt.dispose();
            return Ok(());
        }

        if evt.do_server_broadcast {
            self.ctx.do_broadcast();
            evt.do_server_broadcast = false;
        }

        let remote = evt.in_channel.dispatcher_id.clone();
        let Some((mut out_channel, was_last)) = self.take_pooled_channel(&remote) else {
            debug!(dispatcher = %self.short_id(), connection_id = %evt.connection_id, destination = %remote, "connect from remote waits for a channel");
            self.out_channel_waiters.push(DispatcherEvent::ServerConnect(evt));
            return Ok(());
        };
        out_channel.connection_id = Some(evt.connection_id);

        debug!(dispatcher = %self.short_id(), connection_id = %evt.connection_id, destination = %remote, "connect from remote waits for accept");
        self.accept_waiters.push_back(AcceptWaiter {
            connection_id: evt.connection_id,
            in_channel: evt.in_channel,
            out_channel,
            do_client_broadcast: was_last,
            issued: evt.issued,
        });

        while let Some(accept) = self.accept_queue.pop_front() {
            if accept.response.is_closed() {
                debug!(dispatcher = %self.short_id(), "dropping queued accept, caller is gone");
                continue;
            }
            self.on_server_accept(accept).await?;
            break;
        }
        Ok(())
    }

    fn is_known_connection(&self, connection_id: uuid::Uuid) -> bool {
        self.in_connections.contains_key(&connection_id)
            || self.accept_waiters.iter().any(|w| w.connection_id == connection_id)
            || self.out_channel_waiters.iter().any(|w| matches!(w, DispatcherEvent::ServerConnect(e) if e.connection_id == connection_id))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::time::Instant;
    use uuid::Uuid;

    use crate::connection::connection_factory::ConnectionError;
    use crate::dispatcher::dispatcher_state::tests::*;
    use crate::dispatcher::events::{DispatcherEvent, ServerConnectEvent};
    use crate::wire::wire_format::Op;

    #[tokio::test]
    async fn test_connect_without_channel_and_dont_queue() {
        let (mut state, _dispatcher, _receiver) = test_state();
        let (evt, rx) = connect_event("b", true);

        state.process(DispatcherEvent::ClientConnect(evt)).await;

        assert!(rx.await.unwrap().unwrap().is_none());
        assert!(state.out_channel_waiters.is_empty());
    }

    #[tokio::test]
    async fn test_connect_sends_connect() {
        let (mut state, _dispatcher, _receiver) = test_state();
        let (c1, mut r1) = test_out_channel(&state, REMOTE);
        let (c2, _r2) = test_out_channel(&state, REMOTE);
        state.channel_pools.entry(REMOTE.to_string()).or_default().extend([c1, c2]);

        let (evt, _rx) = connect_event("b", false);
        let connection_id = evt.connection_id;
        state.process(DispatcherEvent::ClientConnect(evt)).await;

        assert_eq!(read_packet(&mut r1).await, (Op::Connect, connection_id));
        assert_eq!(state.channel_pools[REMOTE].len(), 1);
        assert_eq!(state.connect_requests[&connection_id].out_channel.connection_id, Some(connection_id));
    }

    #[tokio::test]
    async fn test_connect_failed_send_is_retried() {
        let (mut state, _dispatcher, mut receiver) = test_state();
        let (c, r) = test_out_channel(&state, REMOTE);
        state.channel_pools.entry(REMOTE.to_string()).or_default().push_back(c);
        drop(r);

        let (evt, mut rx) = connect_event("b", false);
        let connection_id = evt.connection_id;
        state.process(DispatcherEvent::ClientConnect(evt)).await;

        assert!(state.connect_requests.is_empty());
        assert!(rx.try_recv().is_err());

        // the guard reports the failed channel, and the connect is resubmitted
        let mut resubmitted = false;
        while let Ok(evt) = receiver.try_recv() {
            if let DispatcherEvent::ClientConnect(e) = &evt {
                assert_eq!(e.connection_id, connection_id);
                resubmitted = true;
            }
            state.process(evt).await;
        }
        assert!(resubmitted);
        assert_eq!(state.out_channel_waiters.len(), 1);
    }

    #[tokio::test]
    async fn test_server_connect_waits_for_channel() {
        let (mut state, _dispatcher, _receiver) = test_state();
        let connection_id = Uuid::new_v4();
        let (in_channel, _w) = test_in_channel(&state, REMOTE, connection_id);

        state.process(DispatcherEvent::ServerConnect(ServerConnectEvent {
            connection_id,
            in_channel,
            do_server_broadcast: true,
            issued: Instant::now(),
        })).await;

        assert!(state.ctx.take_broadcast_request());
        assert_eq!(state.out_channel_waiters.len(), 1);
        assert_eq!(state.out_channel_waiters[0].waits_for_dispatcher(), Some(REMOTE));

        let (c, _r) = test_out_channel(&state, REMOTE);
        state.process(DispatcherEvent::NewChannel(c)).await;

        assert!(state.out_channel_waiters.is_empty());
        assert_eq!(state.accept_waiters.len(), 1);
        assert!(state.accept_waiters[0].do_client_broadcast);
    }

    #[tokio::test]
    async fn test_duplicate_server_connect_is_ignored() {
        let (mut state, _dispatcher, _receiver) = test_state();
        let (c, _r) = test_out_channel(&state, REMOTE);
        state.channel_pools.entry(REMOTE.to_string()).or_default().push_back(c);

        let connection_id = Uuid::new_v4();
        let (in1, _w1) = test_in_channel(&state, REMOTE, connection_id);
        let (in2, mut w2) = test_in_channel(&state, REMOTE, connection_id);
        for in_channel in [in1, in2] {
            state.process(DispatcherEvent::ServerConnect(ServerConnectEvent {
                connection_id,
                in_channel,
                do_server_broadcast: false,
                issued: Instant::now(),
            })).await;
        }

        assert_eq!(state.accept_waiters.len(), 1);
        assert!(state.out_channel_waiters.is_empty());

        // the duplicate's stream was dropped
        assert!(w2.write_all(&[1]).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_connect_times_out() {
        let (mut state, _dispatcher, _receiver) = test_state();
        let (evt, rx) = connect_event("b", false);
        state.process(DispatcherEvent::ClientConnect(evt)).await;
        assert_eq!(state.out_channel_waiters.len(), 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        state.sweep_timeouts();
        assert_eq!(state.out_channel_waiters.len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        state.sweep_timeouts();
        assert!(state.out_channel_waiters.is_empty());

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err.downcast_ref::<ConnectionError>(), Some(ConnectionError::Timeout { .. })));
    }
}
