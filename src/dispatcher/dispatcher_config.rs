use std::time::Duration;

use anyhow::bail;
use hyper::Uri;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// The rendezvous address: a single well-known URI behind a load balancer. Every dispatcher
    ///  probes this address, and the load balancer routes each probe to an arbitrary instance.
    pub function_address: Uri,

    /// Short, human-readable part of the dispatcher id, typically identifying the machine or
    ///  worker. Connect requests address remote dispatchers by this prefix, so it must not
    ///  contain whitespace.
    pub id_prefix: String,

    /// maximum number of spare out-channels kept per remote dispatcher
    pub max_pool: usize,
    /// When a remote's pool is full, further probes from that remote are answered with an empty
    ///  response until the oldest pooled channel is this old.
    pub filter_refresh_interval: Duration,

    /// pending connects, accept waiters and best-effort close notifications give up after this
    pub request_timeout: Duration,
    /// upper bound for writing a single control packet
    pub send_timeout: Duration,

    pub min_broadcast_spacing: Duration,
    /// number of broadcast ticks at cluster formation, which use a short random delay
    pub initial_broadcast_ticks: u32,
    pub initial_broadcast_max_delay: Duration,
    /// after formation, every n-th tick uses a fresh random delay to avoid synchronized
    ///  broadcasts across workers
    pub rerandomize_every: u32,
    pub rerandomized_max_delay: Duration,
    pub steady_broadcast_interval: Duration,

    pub min_probes_per_broadcast: usize,
    /// factor for the number of probes per broadcast: `factor * (n+4) * ln(n+4)` for n known
    ///  remotes
    pub probe_scale_factor: f64,

    /// maximum number of events the processor takes from its queue in one go
    pub max_batch_size: usize,
    /// buffer size of the in-memory pipe behind each out-channel's response body
    pub channel_buffer_size: usize,
}

impl DispatcherConfig {
    pub fn new(function_address: Uri, id_prefix: impl Into<String>) -> DispatcherConfig {
        DispatcherConfig {
            function_address,
            id_prefix: id_prefix.into(),
            max_pool: 2,
            filter_refresh_interval: Duration::from_secs(8*60),
            request_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            min_broadcast_spacing: Duration::from_secs(2),
            initial_broadcast_ticks: 5,
            initial_broadcast_max_delay: Duration::from_secs(10),
            rerandomize_every: 10,
            rerandomized_max_delay: Duration::from_secs(30),
            steady_broadcast_interval: Duration::from_secs(60),
            min_probes_per_broadcast: 10,
            probe_scale_factor: 4.0,
            max_batch_size: 1000,
            channel_buffer_size: 64*1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id_prefix.is_empty() {
            bail!("dispatcher id prefix must not be empty");
        }
        if self.id_prefix.chars().any(char::is_whitespace) {
            bail!("dispatcher id prefix {:?} must not contain whitespace", self.id_prefix);
        }
        if self.max_pool == 0 {
            bail!("max_pool must be at least 1");
        }
        if self.rerandomize_every == 0 {
            bail!("rerandomize_every must be at least 1");
        }
        if !(self.probe_scale_factor > 0.0) {
            bail!("probe_scale_factor must be positive");
        }
        if self.max_batch_size == 0 {
            bail!("max_batch_size must be at least 1");
        }
        if self.channel_buffer_size < 1024 {
            bail!("channel_buffer_size must be at least 1024 to hold the dispatcher id handshake");
        }
        Ok(())
    }
}
