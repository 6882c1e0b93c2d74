use std::time::{Duration, Instant};

use derive_more::derive::Display;
use metrics::gauge;
use parking_lot::{Condvar, Mutex};

use crate::metrics::METRICS_RELAY_OPEN;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// New connections are dequeued and relayed.
    Open,
    /// A switch is draining; the connector holds off.
    Closed,
}

#[derive(Debug)]
struct RelayState {
    status: RelayStatus,
    reason: String,
}

/// Broadcast gate between the switchover and the connector.
///
/// Opening wakes every waiter, closing only changes the stored state.
#[derive(Debug)]
pub struct RelaySignal {
    state: Mutex<RelayState>,
    cond: Condvar,
}

impl RelaySignal {
    pub fn new(reason: &str) -> Self {
        gauge!(METRICS_RELAY_OPEN).set(1.0);
        Self {
            state: Mutex::new(RelayState {
                status: RelayStatus::Open,
                reason: reason.to_owned(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Returns true when the signal was closed before this call.
    pub fn open(&self, reason: &str) -> bool {
        let mut state = self.state.lock();
        if state.status == RelayStatus::Open {
            return false;
        }
        log::info!("[RelaySignal] open: {reason}");
        state.status = RelayStatus::Open;
        state.reason = reason.to_owned();
        gauge!(METRICS_RELAY_OPEN).set(1.0);
        self.cond.notify_all();
        true
    }

    /// Returns true when the signal was open before this call.
    pub fn close(&self, reason: &str) -> bool {
        let mut state = self.state.lock();
        if state.status == RelayStatus::Closed {
            return false;
        }
        log::info!("[RelaySignal] close: {reason}");
        state.status = RelayStatus::Closed;
        state.reason = reason.to_owned();
        gauge!(METRICS_RELAY_OPEN).set(0.0);
        true
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().status == RelayStatus::Open
    }

    pub fn status(&self) -> (RelayStatus, String) {
        let state = self.state.lock();
        (state.status, state.reason.clone())
    }

    /// Blocks until the signal is open or `timeout` elapses. Returns whether it is open.
    pub fn wait_open(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.status != RelayStatus::Open {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.status == RelayStatus::Open;
            }
        }
        true
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread, time::Duration};

    use super::{RelaySignal, RelayStatus};

    #[test_log::test]
    fn starts_open_with_reason() {
        let signal = RelaySignal::new("started");
        assert_eq!(signal.status(), (RelayStatus::Open, "started".to_owned()));
    }

    #[test_log::test]
    fn transitions_report_change() {
        let signal = RelaySignal::new("started");
        assert!(!signal.open("again"));
        assert!(signal.close("switching"));
        assert!(!signal.close("switching twice"));
        assert_eq!(signal.status(), (RelayStatus::Closed, "switching".to_owned()));
        assert!(signal.open("switch complete"));
        assert_eq!(signal.status(), (RelayStatus::Open, "switch complete".to_owned()));
    }

    #[test_log::test]
    fn wait_times_out_while_closed() {
        let signal = RelaySignal::new("started");
        signal.close("switching");
        assert!(!signal.wait_open(Duration::from_millis(30)));
    }

    #[test_log::test]
    fn open_releases_all_waiters() {
        let signal = Arc::new(RelaySignal::new("started"));
        signal.close("switching");

        let waiters = (0..3)
            .map(|_| {
                let signal = signal.clone();
                thread::spawn(move || signal.wait_open(Duration::from_secs(5)))
            })
            .collect::<Vec<_>>();

        thread::sleep(Duration::from_millis(50));
        signal.open("switch complete");
        for waiter in waiters {
            assert!(waiter.join().expect("should join"));
        }
    }
}
