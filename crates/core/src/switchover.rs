//! Backend switchover state machine.
//!
//! Two states, RELAYING (relay signal open) and DRAINING (relay signal
//! closed, flip pending). The backend set mutex is the switch lock: the
//! connector dials and hands over under it, the transporter flips under it
//! and the listener aborts a drain under it, so no dial ever observes a
//! half finished flip.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use metrics::counter;
use parking_lot::Mutex;

use crate::{
    metrics::{METRICS_SWITCH_ABORT_COUNT, METRICS_SWITCH_COUNT},
    relay::{RelaySignal, RelayStatus},
    stats::Stats,
};

pub const REASON_STARTED: &str = "started";
pub const REASON_SWITCH_REQUESTED: &str = "switch requested";
pub const REASON_SWITCH_COMPLETE: &str = "switch complete";
pub const REASON_QUEUE_SOFT_LIMIT: &str = "queue soft limit reached";
pub const REASON_QUEUE_FULL: &str = "connection queue full";
pub const REASON_SWITCH_TIMEOUT: &str = "switch timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendSet {
    backends: [SocketAddr; 2],
    active: usize,
}

impl BackendSet {
    pub fn new(active: SocketAddr, standby: SocketAddr) -> Self {
        Self { backends: [active, standby], active: 0 }
    }

    pub fn active(&self) -> SocketAddr {
        self.backends[self.active]
    }

    pub fn standby(&self) -> SocketAddr {
        self.backends[1 - self.active]
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    fn flip(&mut self) {
        self.active = 1 - self.active;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchEvent {
    Draining,
    Completed { active: SocketAddr },
    Aborted { reason: String },
}

pub struct Switchover {
    backends: Mutex<BackendSet>,
    /// Copy of the addresses and active index for readers that must not wait on the switch lock.
    addrs: [SocketAddr; 2],
    active: AtomicUsize,
    relay: RelaySignal,
    switch_delay: Duration,
    subscribers: Mutex<Vec<Sender<SwitchEvent>>>,
}

impl Switchover {
    pub fn new(backends: BackendSet, switch_delay: Duration) -> Self {
        log::info!("[Switchover] active {} standby {}", backends.active(), backends.standby());
        Self {
            addrs: backends.backends,
            active: AtomicUsize::new(backends.active),
            backends: Mutex::new(backends),
            relay: RelaySignal::new(REASON_STARTED),
            switch_delay,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn relay(&self) -> &RelaySignal {
        &self.relay
    }

    /// Best effort view, never blocks on a dial or a settle delay in progress.
    pub fn backends(&self) -> BackendSet {
        BackendSet {
            backends: self.addrs,
            active: self.active.load(Ordering::Acquire),
        }
    }

    pub fn subscribe(&self) -> Receiver<SwitchEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// RELAYING -> DRAINING. Returns false when a switch is already draining.
    pub fn trigger_switch(&self) -> bool {
        let backends = self.backends.lock();
        if self.relay.close(REASON_SWITCH_REQUESTED) {
            log::info!("[Switchover] draining connections before switching {} => {}", backends.active(), backends.standby());
            self.publish(SwitchEvent::Draining);
            true
        } else {
            log::warn!("[Switchover] switch requested while already draining");
            false
        }
    }

    /// DRAINING -> RELAYING without flipping. Returns false when not draining.
    pub fn abort_switch(&self, reason: &str) -> bool {
        let backends = self.backends.lock();
        if self.relay.open(reason) {
            log::warn!("[Switchover] switch abandoned ({reason}), staying on {}", backends.active());
            counter!(METRICS_SWITCH_ABORT_COUNT).increment(1);
            self.publish(SwitchEvent::Aborted { reason: reason.to_owned() });
            true
        } else {
            false
        }
    }

    /// Flips the backend once a drain has no endpoints left, waits the settle
    /// delay and reopens the relay. Returns true when the flip happened.
    pub fn complete_if_drained(&self, stats: &Stats) -> bool {
        let mut backends = self.backends.lock();
        if stats.endpoints() != 0 {
            return false;
        }
        let (status, _) = self.relay.status();
        if status != RelayStatus::Closed {
            return false;
        }

        log::info!("[Switchover] no more connections, switching {} => {}", backends.active(), backends.standby());
        backends.flip();
        self.active.store(backends.active, Ordering::Release);
        if !self.switch_delay.is_zero() {
            log::info!("[Switchover] sleeping {:?} before finishing switch", self.switch_delay);
            thread::sleep(self.switch_delay);
        }
        self.relay.open(REASON_SWITCH_COMPLETE);
        counter!(METRICS_SWITCH_COUNT).increment(1);
        self.publish(SwitchEvent::Completed { active: backends.active() });
        true
    }

    /// Runs `f` with the current active backend while holding the switch lock.
    pub fn with_active_backend<R>(&self, f: impl FnOnce(SocketAddr) -> R) -> R {
        let backends = self.backends.lock();
        f(backends.active())
    }

    fn publish(&self, event: SwitchEvent) {
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}
