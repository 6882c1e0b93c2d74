use std::{
    net::{SocketAddr, TcpStream},
    sync::Arc,
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use metrics::gauge;

use crate::{metrics::METRICS_QUEUE_DEPTH, stats::Stats, ProxyError};

/// Accepted client waiting for a backend.
#[derive(Debug)]
pub struct PendingConnection {
    pub stream: TcpStream,
    pub addr: SocketAddr,
}

/// Bounded FIFO between the listener and the connector.
#[derive(Clone)]
pub struct ConnectionQueue {
    tx: Sender<PendingConnection>,
    rx: Receiver<PendingConnection>,
    capacity: usize,
    stats: Arc<Stats>,
}

impl ConnectionQueue {
    pub fn new(capacity: usize, stats: Arc<Stats>) -> Self {
        // a zero sized crossbeam channel is a rendezvous channel, which never accepts try_send
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity, stats }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Non-blocking insert. A rejected connection is dropped, which closes the client socket.
    pub fn enqueue(&self, conn: PendingConnection) -> Result<(), ProxyError> {
        match self.tx.try_send(conn) {
            Ok(()) => {
                self.stats.inc_enqueued();
                gauge!(METRICS_QUEUE_DEPTH).set(self.len() as f64);
                Ok(())
            }
            Err(TrySendError::Full(conn)) | Err(TrySendError::Disconnected(conn)) => {
                log::debug!("[ConnectionQueue] drop connection from {} on full queue", conn.addr);
                self.stats.inc_queue_full();
                Err(ProxyError::QueueFull)
            }
        }
    }

    /// Waits up to `timeout` for a connection, `None` when nothing arrived.
    pub fn dequeue(&self, timeout: Duration) -> Option<PendingConnection> {
        match self.rx.recv_timeout(timeout) {
            Ok(conn) => {
                gauge!(METRICS_QUEUE_DEPTH).set(self.len() as f64);
                Some(conn)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        net::{TcpListener, TcpStream},
        sync::Arc,
        time::{Duration, Instant},
    };

    use crate::{stats::Stats, ProxyError};

    use super::{ConnectionQueue, PendingConnection};

    fn pending(listener: &TcpListener) -> PendingConnection {
        let stream = TcpStream::connect(listener.local_addr().expect("should have addr")).expect("should connect");
        let addr = stream.local_addr().expect("should have addr");
        PendingConnection { stream, addr }
    }

    #[test_log::test]
    fn reject_when_full() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("should bind");
        let stats = Arc::new(Stats::default());
        let queue = ConnectionQueue::new(2, stats.clone());

        assert!(queue.enqueue(pending(&listener)).is_ok());
        assert!(queue.enqueue(pending(&listener)).is_ok());
        assert!(matches!(queue.enqueue(pending(&listener)), Err(ProxyError::QueueFull)));

        assert_eq!(queue.len(), 2);
        assert_eq!(stats.enqueued(), 2);
        assert_eq!(stats.snapshot().queue_full, 1);
    }

    #[test_log::test]
    fn fifo_order() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("should bind");
        let queue = ConnectionQueue::new(4, Arc::new(Stats::default()));
        let first = pending(&listener);
        let second = pending(&listener);
        let (first_addr, second_addr) = (first.addr, second.addr);
        queue.enqueue(first).expect("should enqueue");
        queue.enqueue(second).expect("should enqueue");

        assert_eq!(queue.dequeue(Duration::from_millis(10)).map(|c| c.addr), Some(first_addr));
        assert_eq!(queue.dequeue(Duration::from_millis(10)).map(|c| c.addr), Some(second_addr));
    }

    #[test_log::test]
    fn dequeue_times_out_on_empty() {
        let queue = ConnectionQueue::new(1, Arc::new(Stats::default()));
        let started = Instant::now();
        assert!(queue.dequeue(Duration::from_millis(50)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test_log::test]
    fn zero_capacity_still_buffers_one() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("should bind");
        let queue = ConnectionQueue::new(0, Arc::new(Stats::default()));
        assert_eq!(queue.capacity(), 1);
        assert!(queue.enqueue(pending(&listener)).is_ok());
    }
}
