mod accept_events;
mod closed_events;
mod connect_events;
pub mod dispatcher;
pub mod dispatcher_config;
pub mod dispatcher_id;
pub(crate) mod dispatcher_state;
pub(crate) mod events;
mod new_channel_event;
mod timer_event;
