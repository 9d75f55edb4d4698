use tracing::trace;

use crate::channel::channel::OutChannel;
use crate::dispatcher::dispatcher_state::DispatcherState;

impl DispatcherState {
    /// Add a freshly arrived out-channel to its remote's pool.
    ///
    /// The first channel to a remote may unblock waiting events, so they are all re-run. A
    ///  pool that exceeds its capacity loses its oldest channel, and a full pool installs a
    ///  filter so that further probes from the remote are answered without opening a channel.
    pub(crate) fn on_new_channel(&mut self, out_channel: OutChannel) -> anyhow::Result<()> {
        let remote = out_channel.dispatcher_id.clone();
        trace!(dispatcher = %self.ctx.short_id(), channel_id = %out_channel.channel_id, destination = %remote, "added out-channel");

        let queue = self.channel_pools.entry(remote.clone()).or_default();
        queue.push_back(out_channel);

        if queue.len() == 1 {
            for waiter in std::mem::take(&mut self.out_channel_waiters) {
                self.push_followup(waiter);
            }

            // we just discovered a new node, so we should broadcast
            self.ctx.do_broadcast();
        }

        let max_pool = self.ctx.config.max_pool;
        let Some(queue) = self.channel_pools.get_mut(&remote) else {
            return Ok(());
        };
        if queue.len() >= max_pool {
            if queue.len() > max_pool {
                if let Some(excess) = queue.pop_front() {
                    trace!(dispatcher = %self.ctx.short_id(), channel_id = %excess.channel_id, destination = %remote, "removed excess out-channel");
                    excess.dispose();
                }
            }

            if let Some(oldest) = queue.front() {
                self.ctx.set_filter(&remote, oldest.since + self.ctx.config.filter_refresh_interval);
            }
        }
        Ok(())
    }
}
