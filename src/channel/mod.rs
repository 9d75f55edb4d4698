pub mod channel;
pub(crate) mod in_channel_receiver;
pub mod stream_guard;
