use std::{
    io,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    config::Tunables,
    queue::{ConnectionQueue, PendingConnection},
    switchover::{Switchover, REASON_QUEUE_FULL, REASON_QUEUE_SOFT_LIMIT},
    ProxyError,
};

const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Accepts clients and buffers them in the connection queue.
pub struct Listener {
    socket: Arc<Socket>,
    local_addr: SocketAddr,
    queue: ConnectionQueue,
    switchover: Arc<Switchover>,
    tunables: Arc<Tunables>,
    quit: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct ListenerHandle {
    socket: Arc<Socket>,
    local_addr: SocketAddr,
    quit: Arc<AtomicBool>,
}

impl ListenerHandle {
    /// Shuts the listening socket down, which fails the blocked accept and ends the loop.
    pub fn close(&self) {
        log::debug!("[Listener] shutting down listener socket");
        self.quit.store(true, Ordering::Release);
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            // some platforms refuse to shut a listening socket down, unblock accept with a connection instead
            log::debug!("[Listener] shutdown listener socket error {e}");
            if let Err(e) = TcpStream::connect_timeout(&self.local_addr, WAKE_CONNECT_TIMEOUT) {
                log::debug!("[Listener] wake accept connect error {e}");
            }
        }
    }

    /// Breaks the accept loop without asking it to quit, as a failing accept would.
    #[cfg(test)]
    pub(crate) fn break_accept(&self) -> io::Result<()> {
        self.socket.shutdown(Shutdown::Both)
    }
}

impl Listener {
    pub fn bind(addr: SocketAddr, backlog: i32, queue: ConnectionQueue, switchover: Arc<Switchover>, tunables: Arc<Tunables>) -> Result<Self, ProxyError> {
        log::info!("[Listener] binding {addr} (backlog: {backlog})");
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        let local_addr = socket.local_addr()?.as_socket().ok_or_else(|| io::Error::other("listener is not an inet socket"))?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            queue,
            switchover,
            tunables,
            quit: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            socket: self.socket.clone(),
            local_addr: self.local_addr,
            quit: self.quit.clone(),
        }
    }

    /// Accept loop. Ends with `Ok` after [`ListenerHandle::close`], with `Err` when accept fails.
    pub fn run(self) -> Result<(), ProxyError> {
        log::info!("[Listener] running on {}", self.local_addr);
        loop {
            log::trace!("[Listener] awaiting new connection");
            match self.socket.accept() {
                Ok(_) if self.quit.load(Ordering::Acquire) => break,
                Ok((socket, addr)) => {
                    let Some(addr) = addr.as_socket() else {
                        log::warn!("[Listener] accepted connection without inet address => drop");
                        continue;
                    };
                    log::debug!("[Listener] new connection from {addr}");
                    self.on_accepted(PendingConnection {
                        stream: TcpStream::from(socket),
                        addr,
                    });
                }
                Err(e) if self.quit.load(Ordering::Acquire) => {
                    log::debug!("[Listener] accept ended by close: {e}");
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("[Listener] error accepting connection: {e}");
                    return Err(ProxyError::Accept(e));
                }
            }
        }
        log::info!("[Listener] exiting listener loop");
        Ok(())
    }

    fn on_accepted(&self, conn: PendingConnection) {
        let depth = self.queue.len();
        let soft_limit = self.tunables.queue_soft_limit();
        if soft_limit > 0 && depth >= soft_limit {
            log::warn!("[Listener] queued {depth} connections, limit is {soft_limit}");
            self.switchover.abort_switch(REASON_QUEUE_SOFT_LIMIT);
        }

        let addr = conn.addr;
        match self.queue.enqueue(conn) {
            Ok(()) => log::debug!("[Listener] enqueued connection from {addr}"),
            Err(e) => {
                log::error!("[Listener] {e} with {} elements, dropped {addr}", self.queue.len());
                self.switchover.abort_switch(REASON_QUEUE_FULL);
            }
        }
    }
}
