//! Shared accept-loop and connection-table plumbing for socket transports.

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Upper bound on how long a blocked accept or read can outlive a stop
/// request.
pub(crate) const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Read timeout applied to every accepted socket so stop flags are
/// observed promptly.
pub(crate) const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Bound on waiting for handler threads after a stop request.
pub(crate) const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct ConnEntry {
    stream: TcpStream,
    stop: Arc<AtomicBool>,
}

/// Bounded registry of live connections.
///
/// Registration fails when `capacity` connections are live; the caller
/// closes the socket and the rejection counter increments. Handler threads
/// deregister themselves on exit, which is what `wait_empty` observes.
pub(crate) struct ConnTable {
    capacity: usize,
    conns: Mutex<HashMap<u64, ConnEntry>>,
    next_id: AtomicU64,
    rejected: AtomicU64,
}

impl ConnTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            rejected: AtomicU64::new(0),
        }
    }

    /// Claim a slot; `None` means the table is full and the connection must
    /// be dropped.
    pub(crate) fn try_register(&self, stream: &TcpStream) -> Option<(u64, Arc<AtomicBool>)> {
        let Ok(clone) = stream.try_clone() else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let mut conns = self.conns.lock();
        if conns.len() >= self.capacity {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        conns.insert(
            id,
            ConnEntry {
                stream: clone,
                stop: Arc::clone(&stop),
            },
        );
        Some((id, stop))
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.conns.lock().remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub(crate) fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Raise every stop flag and shut the sockets down so blocked reads
    /// fail immediately.
    pub(crate) fn stop_all(&self) {
        for entry in self.conns.lock().values() {
            entry.stop.store(true, Ordering::Release);
            let _ = entry.stream.shutdown(Shutdown::Both);
        }
    }

    /// Wait until every handler thread has deregistered, bounded by
    /// `timeout`. Returns whether the table drained.
    pub(crate) fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.len() > 0 {
            if Instant::now() >= deadline {
                warn!(lingering = self.len(), "connections still open after stop timeout");
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

/// Spawn the accept thread: non-blocking accept with periodic wake-ups to
/// observe the shutdown flag.
pub(crate) fn spawn_accept_loop<F>(
    thread_name: String,
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    mut on_accept: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut(TcpStream, SocketAddr) + Send + 'static,
{
    listener.set_nonblocking(true)?;
    std::thread::Builder::new().name(thread_name).spawn(move || {
        loop {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    if stream.set_nonblocking(false).is_err()
                        || stream.set_read_timeout(Some(SOCKET_READ_TIMEOUT)).is_err()
                    {
                        warn!(%peer, "failed to configure accepted socket");
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    on_accept(stream, peer);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }
        debug!("accept loop exiting");
    })
}

/// Millisecond activity clock shared between a read loop and the reply
/// path, for idle-timeout tracking.
pub(crate) struct ActivityClock {
    base: Instant,
    last: AtomicU64,
}

impl ActivityClock {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    pub(crate) fn touch(&self) {
        let elapsed = self.base.elapsed().as_millis() as u64;
        self.last.store(elapsed, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let elapsed = self.base.elapsed().as_millis() as u64;
        Duration::from_millis(elapsed.saturating_sub(self.last.load(Ordering::Relaxed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_table_capacity() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let b = TcpStream::connect(addr).unwrap();

        let table = ConnTable::new(1);
        let first = table.try_register(&a);
        assert!(first.is_some());
        assert!(table.try_register(&b).is_none());
        assert_eq!(table.rejected(), 1);

        table.deregister(first.unwrap().0);
        assert_eq!(table.len(), 0);
        assert!(table.try_register(&b).is_some());
    }

    #[test]
    fn activity_clock_tracks_idle() {
        let clock = ActivityClock::new();
        clock.touch();
        std::thread::sleep(Duration::from_millis(30));
        assert!(clock.idle_for() >= Duration::from_millis(20));
        clock.touch();
        assert!(clock.idle_for() < Duration::from_millis(20));
    }
}
