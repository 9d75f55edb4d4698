use tracing::{debug, info, warn};

use crate::connection::connection::Connection;
use crate::dispatcher::dispatcher_state::{DispatcherState, EstablishedConnection};
use crate::dispatcher::events::{ClientAcceptEvent, ConnectionClosedEvent, DispatcherEvent, ServerAcceptEvent};
use crate::wire::wire_format::Op;

impl DispatcherState {
    /// A local call to accept. It is matched with the oldest remote connect that waits for
    ///  acceptance, or it waits for one.
    pub(crate) async fn on_server_accept(&mut self, evt: ServerAcceptEvent) -> anyhow::Result<()> {
        if evt.response.is_closed() {
            debug!(dispatcher = %self.short_id(), "accept caller is gone, skipping");
            return Ok(());
        }

        let Some(waiter) = self.accept_waiters.pop_front() else {
            self.accept_queue.retain(|a| !a.response.is_closed());
            self.accept_queue.push_back(evt);
            return Ok(());
        };

        let connection_id = waiter.connection_id;
        let connection = Connection::new(connection_id, true, &waiter.in_channel, &waiter.out_channel);
        let op = if waiter.do_client_broadcast { Op::AcceptAndSolicit } else { Op::Accept };
        let send_result = self.send_packet(&waiter.out_channel, op, connection_id).await;

        self.in_connections.insert(connection_id, EstablishedConnection {
            connection: connection.clone(),
            in_channel: waiter.in_channel,
            out_channel: waiter.out_channel,
        });

        match send_result {
            Ok(()) => {
                info!(dispatcher = %self.short_id(), %connection_id, "established server side of connection");
                if evt.response.send(Ok(connection)).is_err() {
                    debug!(dispatcher = %self.short_id(), %connection_id, "accept caller is gone, closing connection");
                    self.push_followup(DispatcherEvent::ConnectionClosed(ConnectionClosedEvent::new(connection_id, false)));
                }
            }
            Err(e) => {
                warn!(dispatcher = %self.short_id(), %connection_id, "could not send Accept message: {:#}", e);
                self.push_followup(DispatcherEvent::ConnectionClosed(ConnectionClosedEvent::new(connection_id, false)));
                // the caller gets the next connection instead
                self.push_followup(DispatcherEvent::ServerAccept(evt));
            }
        }
        Ok(())
    }

    /// The remote accepted one of our connects: the connection is complete
    pub(crate) fn on_client_accept(&mut self, evt: ClientAcceptEvent) -> anyhow::Result<()> {
        let connection_id = evt.connection_id;

        if evt.do_client_broadcast {
            self.ctx.do_broadcast();
        }

        let Some(request) = self.connect_requests.remove(&connection_id) else {
            warn!(dispatcher = %self.short_id(), %connection_id, "Accept for unknown connection, closing it");
            let remote = evt.in_channel.dispatcher_id.clone();
            evt.in_channel.dispose();

            let mut closed = ConnectionClosedEvent::new(connection_id, false);
            closed.to_send = Some(remote);
            self.push_followup(DispatcherEvent::ConnectionClosed(closed));
            return Ok(());
        };

        let connection = Connection::new(connection_id, false, &evt.in_channel, &request.out_channel);
        self.out_connections.insert(connection_id, EstablishedConnection {
            connection: connection.clone(),
            in_channel: evt.in_channel,
            out_channel: request.out_channel,
        });
        info!(dispatcher = %self.short_id(), %connection_id, destination = %request.to_machine, "established client side of connection");

        if request.response.send(Ok(Some(connection))).is_err() {
            debug!(dispatcher = %self.short_id(), %connection_id, "connect caller is gone, closing connection");
            self.push_followup(DispatcherEvent::ConnectionClosed(ConnectionClosedEvent::new(connection_id, false)));
        }
        Ok(())
    }
}
