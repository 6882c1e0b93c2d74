mod hook;
mod rc;

pub use hook::{spawn_switch_hook, ACTIVE_BACKEND_ENV};
pub use rc::{
    parse_net_buffer_size, parse_open_conns, parse_queued_conns, parse_switch_max_time, Command, RcContext, RemoteControl, Setting, MAX_SWITCH_TIME, NET_BUFFER_SIZE_RANGE, OPEN_CONNS_RANGE, QUEUED_CONNS_RANGE,
};
