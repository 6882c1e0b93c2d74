use std::{
    fmt,
    net::SocketAddr,
    sync::Arc,
    thread::{self, JoinHandle},
};

use anyhow::Context;
use parking_lot::Mutex;

use crate::{
    config::{ProxyConfig, Tunables},
    connector::{Connector, ConnectorHandle},
    listener::{Listener, ListenerHandle},
    queue::ConnectionQueue,
    relay::RelayStatus,
    stats::Stats,
    switchover::{BackendSet, Switchover},
    transporter::{Transporter, TransporterHandle},
};

/// Read-only view of the proxy state for the remote control side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySnapshot {
    pub endpoints: usize,
    pub connections: usize,
    pub queued: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub queue_full: u64,
    pub dial_errors: u64,
    pub active_index: usize,
    pub active: SocketAddr,
    pub standby: SocketAddr,
    pub relay: RelayStatus,
    pub reason: String,
}

impl fmt::Display for ProxySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "relay: {} ({}), active: {} [{}], standby: {}, connections: {}, endpoints: {}, queued: {}, enqueued: {}, dequeued: {}, queue_full: {}, dial_errors: {}",
            self.relay, self.reason, self.active, self.active_index, self.standby, self.connections, self.endpoints, self.queued, self.enqueued, self.dequeued, self.queue_full, self.dial_errors
        )
    }
}

/// Listener, connector and transporter threads wired around one switchover.
pub struct BufferingProxy {
    local_addr: SocketAddr,
    switchover: Arc<Switchover>,
    stats: Arc<Stats>,
    tunables: Arc<Tunables>,
    queue: ConnectionQueue,
    listener: ListenerHandle,
    connector: ConnectorHandle,
    transporter: TransporterHandle,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl BufferingProxy {
    pub fn start(cfg: ProxyConfig) -> anyhow::Result<Self> {
        log::info!("[BufferingProxy] starting on {} with active {} standby {}", cfg.listen, cfg.active, cfg.standby);
        let stats = Arc::new(Stats::default());
        let tunables = Arc::new(Tunables::new(&cfg));
        let switchover = Arc::new(Switchover::new(BackendSet::new(cfg.active, cfg.standby), cfg.switch_delay));
        let queue = ConnectionQueue::new(cfg.queue_capacity, stats.clone());

        let listener = Listener::bind(cfg.listen, cfg.listen_backlog, queue.clone(), switchover.clone(), tunables.clone()).with_context(|| format!("bind listener {}", cfg.listen))?;
        let (transporter, transporter_handle) = Transporter::new(&cfg, stats.clone(), switchover.clone(), tunables.clone()).context("create transporter")?;
        let connector = Connector::new(queue.clone(), switchover.clone(), transporter_handle.clone(), stats.clone(), tunables.clone(), cfg.connect_timeout);

        let local_addr = listener.local_addr();
        let listener_handle = listener.handle();
        let connector_handle = connector.handle();

        let mut threads = Vec::with_capacity(3);
        threads.push(thread::Builder::new().name("transporter".into()).spawn(move || {
            if let Err(e) = transporter.run() {
                log::error!("[BufferingProxy] transporter stopped with error {e}");
            }
        })?);
        threads.push(thread::Builder::new().name("connector".into()).spawn(move || connector.run())?);
        threads.push(thread::Builder::new().name("listener".into()).spawn(move || {
            if let Err(e) = listener.run() {
                log::error!("[BufferingProxy] listener stopped, no new clients will be admitted: {e}");
            }
        })?);

        Ok(Self {
            local_addr,
            switchover,
            stats,
            tunables,
            queue,
            listener: listener_handle,
            connector: connector_handle,
            transporter: transporter_handle,
            threads: Mutex::new(threads),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn switchover(&self) -> &Arc<Switchover> {
        &self.switchover
    }

    pub fn tunables(&self) -> &Arc<Tunables> {
        &self.tunables
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    #[cfg(test)]
    pub(crate) fn listener(&self) -> &ListenerHandle {
        &self.listener
    }

    pub fn trigger_switch(&self) -> bool {
        self.switchover.trigger_switch()
    }

    pub fn snapshot(&self) -> ProxySnapshot {
        let stats = self.stats.snapshot();
        let backends = self.switchover.backends();
        let (relay, reason) = self.switchover.relay().status();
        ProxySnapshot {
            endpoints: stats.endpoints,
            connections: stats.connections(),
            queued: self.queue.len(),
            enqueued: stats.enqueued,
            dequeued: stats.dequeued,
            queue_full: stats.queue_full,
            dial_errors: stats.dial_errors,
            active_index: backends.active_index(),
            active: backends.active(),
            standby: backends.standby(),
            relay,
            reason,
        }
    }

    /// Stops admitting, drops every relayed pair and joins the threads. Later calls do nothing.
    pub fn shutdown(&self) {
        log::info!("[BufferingProxy] shutting down");
        self.listener.close();
        self.connector.close();
        self.transporter.kill_all();
        self.transporter.close();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let name = handle.thread().name().unwrap_or("unnamed").to_owned();
            if handle.join().is_err() {
                log::error!("[BufferingProxy] thread {name} panicked");
            }
        }
        log::info!("[BufferingProxy] shutdown done");
    }
}
