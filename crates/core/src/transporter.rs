//! Single readiness loop relaying bytes between every client/backend pair.
//!
//! The endpoint table is owned by the loop thread only. Other threads hand
//! pairs over through [`TransporterHandle`], which queues a command and wakes
//! the poll. Dead endpoints are collected while an event batch is processed
//! and removed afterwards, then the drain-completion check runs.

use std::{
    collections::{HashMap, HashSet},
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use derive_more::derive::Display;
use mio::{event::Event, net::TcpStream as MioTcpStream, Events, Interest, Poll, Token, Waker};

use crate::{
    config::{ProxyConfig, Tunables},
    stats::Stats,
    switchover::Switchover,
    ProxyError,
};

const WAKER: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

enum TransporterCmd {
    Register { backend: TcpStream, client: TcpStream },
    KillAll,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
enum Side {
    #[display("client")]
    Client,
    #[display("backend")]
    Backend,
}

struct Endpoint {
    stream: MioTcpStream,
    side: Side,
    remote: Option<SocketAddr>,
    peer: Token,
    /// Bytes read from the peer that this socket did not take yet.
    pending: Vec<u8>,
    /// Reading stopped until the peer flushes its pending bytes.
    paused: bool,
}

enum ForwardResult {
    Done,
    Blocked,
    Failed,
}

/// Cloneable control side of the transporter, usable from any thread.
#[derive(Clone)]
pub struct TransporterHandle {
    cmd_tx: Sender<TransporterCmd>,
    waker: Arc<Waker>,
    quit: Arc<AtomicBool>,
    stats: Arc<Stats>,
}

impl TransporterHandle {
    /// Hands a connected pair over to the loop.
    ///
    /// Both endpoints count as live from this call on, so a drain check that
    /// runs before the loop picks the pair up still sees them.
    pub fn register(&self, backend: TcpStream, client: TcpStream) -> Result<(), ProxyError> {
        self.stats.add_endpoints(2);
        if self.cmd_tx.send(TransporterCmd::Register { backend, client }).is_err() {
            self.stats.remove_endpoints(2);
            return Err(ProxyError::TransporterClosed);
        }
        self.wake();
        Ok(())
    }

    /// Drops every tracked pair.
    pub fn kill_all(&self) {
        if self.cmd_tx.send(TransporterCmd::KillAll).is_ok() {
            self.wake();
        }
    }

    /// Asks the loop to exit after its current wait.
    pub fn close(&self) {
        log::debug!("[Transporter] closing transporter");
        self.quit.store(true, Ordering::Release);
        self.wake();
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            log::warn!("[Transporter] wake poll error {e}");
        }
    }
}

pub struct Transporter {
    poll: Poll,
    endpoints: HashMap<Token, Endpoint>,
    dead: HashSet<Token>,
    next_token: usize,
    buf: Vec<u8>,
    poll_timeout: Duration,
    cmd_rx: Receiver<TransporterCmd>,
    quit: Arc<AtomicBool>,
    stats: Arc<Stats>,
    switchover: Arc<Switchover>,
    tunables: Arc<Tunables>,
}

impl Transporter {
    pub fn new(cfg: &ProxyConfig, stats: Arc<Stats>, switchover: Arc<Switchover>, tunables: Arc<Tunables>) -> Result<(Self, TransporterHandle), ProxyError> {
        log::debug!("[Transporter] new transporter (buffer {} bytes, poll timeout {:?})", cfg.net_buffer_size, cfg.poll_timeout);
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (cmd_tx, cmd_rx) = unbounded();
        let quit = Arc::new(AtomicBool::new(false));

        let handle = TransporterHandle {
            cmd_tx,
            waker,
            quit: quit.clone(),
            stats: stats.clone(),
        };
        let transporter = Self {
            poll,
            endpoints: HashMap::new(),
            dead: HashSet::new(),
            next_token: WAKER.0 + 1,
            buf: vec![0; cfg.net_buffer_size.max(1)],
            poll_timeout: cfg.poll_timeout,
            cmd_rx,
            quit,
            stats,
            switchover,
            tunables,
        };
        Ok((transporter, handle))
    }

    pub fn run(mut self) -> Result<(), ProxyError> {
        log::info!("[Transporter] running transporter loop");
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while !self.quit.load(Ordering::Acquire) {
            self.apply_buffer_size();
            if let Err(e) = self.poll.poll(&mut events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[Transporter] poll error {e}");
                self.kill_all();
                return Err(e.into());
            }

            for event in events.iter() {
                if event.token() != WAKER {
                    self.on_event(event);
                }
            }
            self.process_commands();
            self.remove_dead();

            // endpoints are only removed above, so this is the place to finish a switch
            self.switchover.complete_if_drained(&self.stats);
        }
        // pairs handed over after the last iteration are attached only to be dropped with the rest
        self.process_commands();
        self.kill_all();
        log::info!("[Transporter] exiting transporter loop");
        Ok(())
    }

    fn apply_buffer_size(&mut self) {
        let size = self.tunables.net_buffer_size().max(1);
        if size != self.buf.len() {
            log::info!("[Transporter] read buffer {} => {size} bytes", self.buf.len());
            self.buf.resize(size, 0);
            self.buf.shrink_to_fit();
        }
    }

    fn process_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                TransporterCmd::Register { backend, client } => {
                    if let Err(e) = self.add(backend, client) {
                        log::error!("[Transporter] register pair error {e}");
                        self.stats.remove_endpoints(2);
                    }
                }
                TransporterCmd::KillAll => self.kill_all(),
            }
        }
    }

    fn add(&mut self, backend: TcpStream, client: TcpStream) -> io::Result<()> {
        let backend_token = self.alloc_token();
        let client_token = self.alloc_token();
        log::debug!("[Transporter] adding pair backend {backend_token:?} client {client_token:?}");

        let mut backend = Self::attach(&self.poll, backend, backend_token)?;
        let client = match Self::attach(&self.poll, client, client_token) {
            Ok(client) => client,
            Err(e) => {
                let _ = self.poll.registry().deregister(&mut backend);
                return Err(e);
            }
        };
        let backend_remote = backend.peer_addr().ok();
        let client_remote = client.peer_addr().ok();
        log::info!("[Transporter] relaying {} <=> {}", fmt_remote(client_remote), fmt_remote(backend_remote));

        self.endpoints.insert(
            backend_token,
            Endpoint {
                stream: backend,
                side: Side::Backend,
                remote: backend_remote,
                peer: client_token,
                pending: Vec::new(),
                paused: false,
            },
        );
        self.endpoints.insert(
            client_token,
            Endpoint {
                stream: client,
                side: Side::Client,
                remote: client_remote,
                peer: backend_token,
                pending: Vec::new(),
                paused: false,
            },
        );
        Ok(())
    }

    fn attach(poll: &Poll, stream: TcpStream, token: Token) -> io::Result<MioTcpStream> {
        stream.set_nonblocking(true)?;
        let mut stream = MioTcpStream::from_std(stream);
        poll.registry().register(&mut stream, token, Interest::READABLE)?;
        Ok(stream)
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.wrapping_add(1).max(WAKER.0 + 1);
        token
    }

    fn on_event(&mut self, event: &Event) {
        let token = event.token();
        if !self.endpoints.contains_key(&token) {
            log::warn!("[Transporter] poll returned event for non-tracked endpoint {token:?}");
            return;
        }
        if self.dead.contains(&token) {
            return;
        }

        if event.is_error() {
            log::warn!("[Transporter] erroneous event {event:?}");
            self.mark_dead(token);
            return;
        }

        let mut handled = false;
        if event.is_writable() {
            self.flush(token);
            handled = true;
        }
        if event.is_readable() {
            self.relay(token);
            handled = true;
        }
        if handled {
            return;
        }

        if event.is_read_closed() || event.is_write_closed() {
            log::debug!("[Transporter] hangup event {event:?}");
            self.mark_dead(token);
        } else {
            log::warn!("[Transporter] unhandled event {event:?}");
        }
    }

    /// Reads from `token` and forwards to its peer until the socket would block,
    /// the peer stops taking bytes, or one side fails.
    fn relay(&mut self, token: Token) {
        loop {
            if self.dead.contains(&token) {
                return;
            }
            let Some(peer) = self.endpoints.get(&token).map(|endpoint| endpoint.peer) else {
                return;
            };
            if self.endpoints.get(&peer).is_some_and(|p| !p.pending.is_empty()) {
                if let Some(endpoint) = self.endpoints.get_mut(&token) {
                    endpoint.paused = true;
                }
                return;
            }

            let Some(endpoint) = self.endpoints.get_mut(&token) else {
                return;
            };
            match endpoint.stream.read(&mut self.buf) {
                Ok(0) => {
                    log::debug!("[Transporter] {} {} closed", endpoint.side, fmt_remote(endpoint.remote));
                    // best effort, whatever the peer cannot take right now is lost with the pair
                    self.flush(peer);
                    self.mark_dead(token);
                    return;
                }
                Ok(len) => match self.forward(peer, len) {
                    ForwardResult::Done => {}
                    ForwardResult::Blocked => {}
                    ForwardResult::Failed => {
                        self.mark_dead(token);
                        return;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("[Transporter] error while reading {} {}: {e}", endpoint.side, fmt_remote(endpoint.remote));
                    self.mark_dead(token);
                    return;
                }
            }
        }
    }

    /// Writes the first `len` bytes of the read buffer to `to`, keeping what
    /// the socket did not accept as pending output.
    fn forward(&mut self, to: Token, len: usize) -> ForwardResult {
        let Some(peer) = self.endpoints.get_mut(&to) else {
            return ForwardResult::Failed;
        };
        let mut written = 0;
        while written < len {
            match peer.stream.write(&self.buf[written..len]) {
                Ok(0) => return ForwardResult::Failed,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("[Transporter] error while transmitting to {} {}: {e}", peer.side, fmt_remote(peer.remote));
                    return ForwardResult::Failed;
                }
            }
        }
        if written == len {
            return ForwardResult::Done;
        }

        peer.pending.extend_from_slice(&self.buf[written..len]);
        if let Err(e) = self.poll.registry().reregister(&mut peer.stream, to, Interest::READABLE | Interest::WRITABLE) {
            log::warn!("[Transporter] watch writable error {e}");
            return ForwardResult::Failed;
        }
        ForwardResult::Blocked
    }

    /// Writes pending output of `token`, resuming its peer once everything is out.
    fn flush(&mut self, token: Token) {
        let Some(endpoint) = self.endpoints.get_mut(&token) else {
            return;
        };
        while !endpoint.pending.is_empty() {
            match endpoint.stream.write(&endpoint.pending) {
                Ok(0) => {
                    self.mark_dead(token);
                    return;
                }
                Ok(n) => {
                    endpoint.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("[Transporter] error while flushing to {} {}: {e}", endpoint.side, fmt_remote(endpoint.remote));
                    self.mark_dead(token);
                    return;
                }
            }
        }

        let peer = endpoint.peer;
        if let Err(e) = self.poll.registry().reregister(&mut endpoint.stream, token, Interest::READABLE) {
            log::warn!("[Transporter] unwatch writable error {e}");
            self.mark_dead(token);
            return;
        }
        let resume = match self.endpoints.get_mut(&peer) {
            Some(peer) if peer.paused => {
                peer.paused = false;
                true
            }
            _ => false,
        };
        if resume {
            self.relay(peer);
        }
    }

    /// Marks an endpoint and its peer dead. Both are removed after the current event batch.
    fn mark_dead(&mut self, token: Token) {
        self.dead.insert(token);
        if let Some(endpoint) = self.endpoints.get(&token) {
            self.dead.insert(endpoint.peer);
        }
    }

    fn remove_dead(&mut self) {
        if self.dead.is_empty() {
            return;
        }
        log::debug!("[Transporter] dead endpoints to remove: {:?}", self.dead);
        for token in std::mem::take(&mut self.dead) {
            self.remove(token);
        }
    }

    fn remove(&mut self, token: Token) {
        let Some(mut endpoint) = self.endpoints.remove(&token) else {
            return;
        };
        log::debug!("[Transporter] removing {} {} {token:?}", endpoint.side, fmt_remote(endpoint.remote));
        if let Err(e) = self.poll.registry().deregister(&mut endpoint.stream) {
            log::debug!("[Transporter] deregister {token:?} error {e}");
        }
        if let Err(e) = endpoint.stream.shutdown(Shutdown::Both) {
            log::debug!("[Transporter] shutdown {token:?} error {e}");
        }
        self.stats.remove_endpoints(1);

        // pairs always leave together
        if self.endpoints.contains_key(&endpoint.peer) {
            self.remove(endpoint.peer);
        }
    }

    fn kill_all(&mut self) {
        if self.endpoints.is_empty() {
            return;
        }
        log::info!("[Transporter] killing {} endpoints", self.endpoints.len());
        let tokens = self.endpoints.keys().copied().collect::<Vec<_>>();
        self.dead.extend(tokens);
        self.remove_dead();
    }
}

fn fmt_remote(remote: Option<SocketAddr>) -> String {
    remote.map(|addr| addr.to_string()).unwrap_or_else(|| "unknown".to_owned())
}
