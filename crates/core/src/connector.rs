use std::{
    net::{Shutdown, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crate::{
    config::Tunables,
    queue::{ConnectionQueue, PendingConnection},
    stats::Stats,
    switchover::Switchover,
    transporter::TransporterHandle,
    ProxyError,
};

/// Re-check granularity while the open connection limit is reached.
pub const THROTTLE_STEP: Duration = Duration::from_millis(10);
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
pub const RELAY_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

enum Dispatch {
    Relayed,
    /// The relay closed between dequeue and dial; retried once it reopens.
    Deferred(PendingConnection),
    Failed(ProxyError),
}

/// Takes queued clients, dials the active backend and hands pairs to the transporter.
pub struct Connector {
    queue: ConnectionQueue,
    switchover: Arc<Switchover>,
    transporter: TransporterHandle,
    stats: Arc<Stats>,
    tunables: Arc<Tunables>,
    connect_timeout: Duration,
    quit: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct ConnectorHandle {
    quit: Arc<AtomicBool>,
}

impl ConnectorHandle {
    /// The loop notices within one dequeue or relay wait timeout.
    pub fn close(&self) {
        log::debug!("[Connector] closing connector");
        self.quit.store(true, Ordering::Release);
    }
}

impl Connector {
    pub fn new(
        queue: ConnectionQueue,
        switchover: Arc<Switchover>,
        transporter: TransporterHandle,
        stats: Arc<Stats>,
        tunables: Arc<Tunables>,
        connect_timeout: Duration,
    ) -> Self {
        log::debug!("[Connector] initializing connector");
        Self {
            queue,
            switchover,
            transporter,
            stats,
            tunables,
            connect_timeout,
            quit: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> ConnectorHandle {
        ConnectorHandle { quit: self.quit.clone() }
    }

    fn should_quit(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    pub fn run(self) {
        log::info!("[Connector] running connector");
        let mut deferred: Option<PendingConnection> = None;
        while !self.should_quit() {
            log::trace!("[Connector] waiting until relay is open");
            if !self.switchover.relay().wait_open(RELAY_WAIT_TIMEOUT) {
                continue;
            }
            if !self.throttle() {
                break;
            }

            let conn = match deferred.take() {
                Some(conn) => conn,
                None => match self.queue.dequeue(DEQUEUE_TIMEOUT) {
                    Some(conn) => {
                        self.stats.inc_dequeued();
                        log::debug!("[Connector] dequeue connection from {} ({} in queue)", conn.addr, self.queue.len());
                        conn
                    }
                    None => {
                        log::trace!("[Connector] connection queue empty");
                        continue;
                    }
                },
            };

            match self.dispatch(conn) {
                Dispatch::Relayed => {}
                Dispatch::Deferred(conn) => {
                    log::debug!("[Connector] relay closed before dialing for {} => hold", conn.addr);
                    deferred = Some(conn);
                }
                Dispatch::Failed(e) => log::error!("[Connector] {e}"),
            }
        }
        if let Some(conn) = deferred {
            log::warn!("[Connector] dropping held connection from {} on quit", conn.addr);
        }
        log::info!("[Connector] exiting connector loop");
    }

    /// Blocks while the open connection limit is reached. Returns false when asked to quit meanwhile.
    fn throttle(&self) -> bool {
        loop {
            let limit = self.tunables.max_open_connections();
            if limit == 0 {
                return true;
            }
            let open = self.stats.connections();
            if open < limit {
                return true;
            }
            log::trace!("[Connector] throttle: {open} connections ({limit} limit)");
            if self.should_quit() {
                return false;
            }
            thread::sleep(THROTTLE_STEP);
        }
    }

    /// Dials and hands over under the switch lock, so a flip never races a dial.
    fn dispatch(&self, conn: PendingConnection) -> Dispatch {
        self.switchover.with_active_backend(|backend| {
            if !self.switchover.relay().is_open() {
                return Dispatch::Deferred(conn);
            }

            log::debug!("[Connector] processing connection from {} => {backend}", conn.addr);
            let upstream = match TcpStream::connect_timeout(&backend, self.connect_timeout) {
                Ok(upstream) => upstream,
                Err(source) => {
                    self.stats.inc_dial_errors();
                    if let Err(e) = conn.stream.shutdown(Shutdown::Both) {
                        log::debug!("[Connector] close client {} error {e}", conn.addr);
                    }
                    return Dispatch::Failed(ProxyError::Dial { addr: backend, source });
                }
            };

            match self.transporter.register(upstream, conn.stream) {
                Ok(()) => Dispatch::Relayed,
                Err(e) => Dispatch::Failed(e),
            }
        })
    }
}
