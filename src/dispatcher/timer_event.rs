use std::time::Duration;

use tokio::select;
use tokio::time::{sleep, Instant};
use tracing::{info, trace, warn, Instrument};

use crate::channel::in_channel_receiver::spawn_probe;
use crate::connection::connection_factory::ConnectionError;
use crate::dispatcher::dispatcher_config::DispatcherConfig;
use crate::dispatcher::dispatcher_state::DispatcherState;
use crate::dispatcher::events::{DispatcherEvent, TimerEvent};
use crate::util::filter::{filter_deque, filter_map, filter_vec};
use crate::util::random::{Random, RngRandom};

impl DispatcherState {
    /// The periodic tick: reap timed out waiters, log the status, broadcast and schedule the next
    ///  tick. After [prepare_shutdown](crate::dispatcher::dispatcher::Dispatcher::prepare_shutdown),
    ///  no more ticks are scheduled.
    pub(crate) fn on_timer(&mut self, mut evt: TimerEvent) -> anyhow::Result<()> {
        self.sweep_timeouts();

        info!(dispatcher = %self.short_id(), count = evt.count, "{}", self.status_line());

        if self.ctx.is_shutdown_imminent() {
            return Ok(());
        }

        if !self.ctx.take_broadcast_request() {
            evt.count += 1;
        }

        let num_probes = probe_count(&self.ctx.config, self.remotes().len());
        trace!(dispatcher = %self.short_id(), num_probes, "broadcasting");
        for _ in 0..num_probes {
            spawn_probe(&self.ctx);
        }

        let delay = broadcast_delay::<RngRandom>(&self.ctx.config, evt.count);
        let min_spacing = self.ctx.config.min_broadcast_spacing;
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            select! {
                _ = ctx.shutdown.cancelled() => return,
                _ = sleep(min_spacing) => {}
            }
            if ctx.wait_for_broadcast(start + delay).await {
                ctx.submit(DispatcherEvent::Timer(evt));
            }
        }.in_current_span());

        Ok(())
    }

    /// Remove and fail everything that waited longer than the request timeout
    pub(crate) fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let timeout = self.ctx.config.request_timeout;
        let short_id = self.ctx.short_id();

        filter_vec(
            &mut self.out_channel_waiters,
            |w| !w.timed_out(now, timeout),
            |w| w.handle_timeout(short_id, now));

        filter_deque(
            &mut self.accept_waiters,
            |w| now.saturating_duration_since(w.issued) <= timeout,
            |w| {
                warn!(dispatcher = short_id, connection_id = %w.connection_id, "connect from remote was not accepted in time");
                w.dispose();
            });

        filter_map(
            &mut self.connect_requests,
            |r| now.saturating_duration_since(r.issued) <= timeout,
            |_, r| {
                let elapsed = now.saturating_duration_since(r.issued);
                warn!(dispatcher = short_id, connection_id = %r.connection_id, destination = %r.to_machine, "Connect was not accepted after {:?}", elapsed);
                let destination = r.to_machine.clone();
                r.fail(ConnectionError::Timeout { destination, elapsed });
            });
    }
}

/// The number of probes per broadcast for `num_remotes` known remote dispatchers.
///
/// Each probe reaches a random dispatcher behind the load balancer, so reaching all of them is a
///  coupon collector problem, with an expected number of `n * ln(n)` probes.
pub(crate) fn probe_count(config: &DispatcherConfig, num_remotes: usize) -> usize {
    let n = (num_remotes + 4) as f64;
    let estimate = (config.probe_scale_factor * n * n.ln()).round() as usize;
    estimate.max(config.min_probes_per_broadcast)
}

/// The delay before the next regular broadcast: short and random while the cluster forms, then
///  a fixed interval, with a longer random delay every few ticks to break up synchronized
///  dispatchers
pub(crate) fn broadcast_delay<R: Random>(config: &DispatcherConfig, count: u32) -> Duration {
    if count < config.initial_broadcast_ticks {
        R::gen_duration_below(config.initial_broadcast_max_delay)
    }
    else if count % config.rerandomize_every == config.initial_broadcast_ticks % config.rerandomize_every {
        R::gen_duration_below(config.rerandomized_max_delay)
    }
    else {
        config.steady_broadcast_interval
    }
}
