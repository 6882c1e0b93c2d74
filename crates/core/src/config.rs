use std::{
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_QUEUE_SOFT_LIMIT: usize = 1_000;
pub const DEFAULT_NET_BUFFER_SIZE: usize = 2048;
pub const DEFAULT_LISTEN_BACKLOG: i32 = 512;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub active: SocketAddr,
    pub standby: SocketAddr,
    /// Hard capacity, enqueue past it fails and aborts any drain.
    pub queue_capacity: usize,
    /// Depth at which a drain is aborted before the queue fills up.
    pub queue_soft_limit: usize,
    /// 0 disables throttling.
    pub max_open_connections: usize,
    pub net_buffer_size: usize,
    pub listen_backlog: i32,
    pub switch_delay: Duration,
    pub connect_timeout: Duration,
    pub poll_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 7000)),
            active: SocketAddr::from(([127, 0, 0, 1], 8000)),
            standby: SocketAddr::from(([127, 0, 0, 1], 8001)),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_soft_limit: DEFAULT_QUEUE_SOFT_LIMIT,
            max_open_connections: 0,
            net_buffer_size: DEFAULT_NET_BUFFER_SIZE,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            switch_delay: Duration::ZERO,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// Limits which can be changed while the proxy runs.
#[derive(Debug)]
pub struct Tunables {
    queue_soft_limit: AtomicUsize,
    max_open_connections: AtomicUsize,
    net_buffer_size: AtomicUsize,
}

impl Tunables {
    pub fn new(cfg: &ProxyConfig) -> Self {
        Self {
            queue_soft_limit: AtomicUsize::new(cfg.queue_soft_limit),
            max_open_connections: AtomicUsize::new(cfg.max_open_connections),
            net_buffer_size: AtomicUsize::new(cfg.net_buffer_size),
        }
    }

    pub fn queue_soft_limit(&self) -> usize {
        self.queue_soft_limit.load(Ordering::Relaxed)
    }

    pub fn set_queue_soft_limit(&self, value: usize) {
        log::info!("[Tunables] queue soft limit => {value}");
        self.queue_soft_limit.store(value, Ordering::Relaxed);
    }

    pub fn max_open_connections(&self) -> usize {
        self.max_open_connections.load(Ordering::Relaxed)
    }

    pub fn set_max_open_connections(&self, value: usize) {
        log::info!("[Tunables] max open connections => {value}");
        self.max_open_connections.store(value, Ordering::Relaxed);
    }

    /// Picked up by the transporter on its next loop iteration.
    pub fn net_buffer_size(&self) -> usize {
        self.net_buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_net_buffer_size(&self, value: usize) {
        log::info!("[Tunables] net buffer size => {value}");
        self.net_buffer_size.store(value, Ordering::Relaxed);
    }
}
