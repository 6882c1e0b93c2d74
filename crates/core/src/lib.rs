//! Connection buffering proxy.
//!
//! Clients are accepted into a bounded queue, connected to the active backend
//! and relayed by a single readiness loop. A switch closes the relay gate,
//! waits for every relayed connection to finish, flips to the standby backend
//! and reopens the gate, so no client is refused while backends change.

mod config;
mod connector;
mod error;
mod listener;
mod metrics;
mod proxy;
mod queue;
mod relay;
mod stats;
mod switchover;
mod transporter;


pub use config::{ProxyConfig, Tunables, DEFAULT_CONNECT_TIMEOUT, DEFAULT_LISTEN_BACKLOG, DEFAULT_NET_BUFFER_SIZE, DEFAULT_POLL_TIMEOUT, DEFAULT_QUEUE_CAPACITY, DEFAULT_QUEUE_SOFT_LIMIT};
pub use connector::{Connector, ConnectorHandle, THROTTLE_STEP};
pub use error::ProxyError;
pub use listener::{Listener, ListenerHandle};
pub use self::metrics::*;
pub use proxy::{BufferingProxy, ProxySnapshot};
pub use queue::{ConnectionQueue, PendingConnection};
pub use relay::{RelaySignal, RelayStatus};
pub use stats::{Stats, StatsSnapshot};
pub use switchover::{BackendSet, SwitchEvent, Switchover, REASON_QUEUE_FULL, REASON_QUEUE_SOFT_LIMIT, REASON_STARTED, REASON_SWITCH_COMPLETE, REASON_SWITCH_REQUESTED, REASON_SWITCH_TIMEOUT};
pub use transporter::{Transporter, TransporterHandle};
