//! Length-prefixed TCP transport.
//!
//! Server side: one accept thread with bounded wake-ups, a bounded
//! connection table, and one handler thread per connection running the
//! framing read loop. Client side: a blocking connection whose `receive`
//! polls with short socket timeouts so shutdown is prompt.

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use loommcp_core::{Arena, DEFAULT_MAX_MESSAGE_SIZE};

use crate::error::{TransportError, TransportResult};
use crate::frame::{FrameOutcome, read_frame_into, write_frame};
use crate::listener::{
    ActivityClock, ConnTable, SOCKET_READ_TIMEOUT, STOP_DRAIN_TIMEOUT, spawn_accept_loop,
};
use crate::traits::{
    ConnectionContext, ServerTransport, TransportCallbacks, TransportKind,
};

/// TCP server transport configuration.
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Connection-table capacity; excess connections are closed on accept.
    pub max_clients: usize,
    /// Frame payload limit.
    pub max_message_size: usize,
    /// Close connections silent for this long; `None` disables the timer.
    pub idle_timeout: Option<Duration>,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".parse().expect("default bind address is valid"),
            max_clients: 64,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            idle_timeout: None,
        }
    }
}

/// Length-prefixed TCP server transport.
pub struct TcpServerTransport {
    config: TcpServerConfig,
    shutdown: Arc<AtomicBool>,
    conns: Arc<ConnTable>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TcpServerTransport {
    /// Create a transport; nothing binds until [`ServerTransport::start`].
    pub fn new(config: TcpServerConfig) -> Self {
        let max_clients = config.max_clients;
        Self {
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            conns: Arc::new(ConnTable::new(max_clients)),
            accept_handle: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Connections rejected because the table was full.
    pub fn rejected_connections(&self) -> u64 {
        self.conns.rejected()
    }

    /// Live connection count.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }
}

impl ServerTransport for TcpServerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn start(&self, callbacks: TransportCallbacks) -> TransportResult<()> {
        let mut handle_slot = self.accept_handle.lock();
        if handle_slot.is_some() {
            return Err(TransportError::ConfigurationError(
                "transport already started".into(),
            ));
        }

        let listener = TcpListener::bind(self.config.bind_addr).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "failed to bind TCP listener on {}: {e}",
                self.config.bind_addr
            ))
        })?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        info!(addr = %local_addr, "TCP transport listening");

        self.shutdown.store(false, Ordering::Release);
        let conns = Arc::clone(&self.conns);
        let config = self.config.clone();
        let handle = spawn_accept_loop(
            "loommcp-tcp-accept".into(),
            listener,
            Arc::clone(&self.shutdown),
            move |stream, peer| {
                let Some((conn_id, stop)) = conns.try_register(&stream) else {
                    warn!(%peer, "connection table full, rejecting");
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                };
                let callbacks = callbacks.clone();
                let conns = Arc::clone(&conns);
                let conns_err = Arc::clone(&conns);
                let config = config.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("loommcp-tcp-conn-{conn_id}"))
                    .spawn(move || {
                        connection_loop(stream, peer, &stop, &callbacks, &config);
                        conns.deregister(conn_id);
                        debug!(%peer, "connection handler finished");
                    });
                if spawned.is_err() {
                    warn!(%peer, "failed to spawn connection handler");
                    conns_err.deregister(conn_id);
                }
            },
        )
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        *handle_slot = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.conns.stop_all();
        if let Some(handle) = self.accept_handle.lock().take()
            && handle.join().is_err()
        {
            warn!("TCP accept thread panicked");
        }
        self.conns.wait_empty(STOP_DRAIN_TIMEOUT);
        *self.local_addr.lock() = None;
        info!("TCP transport stopped");
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

fn connection_loop(
    mut stream: TcpStream,
    peer: SocketAddr,
    stop: &AtomicBool,
    callbacks: &TransportCallbacks,
    config: &TcpServerConfig,
) {
    let Ok(write_half) = stream.try_clone() else {
        warn!(%peer, "failed to clone stream for writes");
        return;
    };
    let activity = Arc::new(ActivityClock::new());
    activity.touch();

    let writer = Arc::new(Mutex::new(write_half));
    let max_message_size = config.max_message_size;
    let reply_activity = Arc::clone(&activity);
    let ctx = ConnectionContext::new(
        TransportKind::Tcp,
        Some(peer),
        None,
        Arc::new(move |payload: &[u8]| {
            // The writer mutex keeps each response frame atomic on the wire.
            let mut writer = writer.lock();
            write_frame(&mut *writer, payload, max_message_size)?;
            reply_activity.touch();
            Ok(())
        }),
    );

    let mut arena = Arena::new();
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match read_frame_into(&mut stream, max_message_size, stop, &mut arena) {
            Ok(FrameOutcome::Frame(payload)) => {
                activity.touch();
                (callbacks.on_message)(payload, &ctx);
            }
            Ok(FrameOutcome::WouldBlock) => {
                if let Some(idle_timeout) = config.idle_timeout
                    && activity.idle_for() >= idle_timeout
                {
                    info!(%peer, "closing idle connection");
                    break;
                }
                continue;
            }
            Ok(FrameOutcome::Closed) => {
                debug!(%peer, "peer closed connection");
                break;
            }
            Err(TransportError::Stopped) => break,
            Err(e) => {
                warn!(%peer, error = %e, "closing connection");
                callbacks.report(&e);
                break;
            }
        }
        arena.reset();
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Blocking TCP client transport.
pub struct TcpClientTransport {
    reader: Mutex<(TcpStream, Arena)>,
    writer: Mutex<TcpStream>,
    raw: TcpStream,
    peer: SocketAddr,
    stop: Arc<AtomicBool>,
    max_message_size: usize,
}

impl TcpClientTransport {
    /// Connect to a server.
    ///
    /// # Errors
    ///
    /// Connection failures and socket configuration failures.
    pub fn connect(addr: SocketAddr, max_message_size: usize) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| TransportError::ConnectionFailed(format!("connect {addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;
        let reader = stream.try_clone()?;
        let raw = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new((reader, Arena::new())),
            writer: Mutex::new(stream),
            raw,
            peer: addr,
            stop: Arc::new(AtomicBool::new(false)),
            max_message_size,
        })
    }
}

impl crate::traits::ClientTransport for TcpClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn send(&self, payload: &[u8]) -> TransportResult<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock();
        write_frame(&mut *writer, payload, self.max_message_size)
            .map_err(|e| match e {
                TransportError::Io(detail) => TransportError::SendFailed(detail),
                other => other,
            })
    }

    fn receive(&self, timeout: Duration) -> TransportResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.reader.lock();
        let (stream, arena) = &mut *guard;
        loop {
            if self.stop.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            let outcome = read_frame_into(stream, self.max_message_size, &self.stop, arena);
            match outcome {
                Ok(FrameOutcome::Frame(payload)) => {
                    let owned = payload.to_vec();
                    arena.reset();
                    return Ok(Some(owned));
                }
                Ok(FrameOutcome::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                Ok(FrameOutcome::Closed) => return Err(TransportError::Closed),
                Err(TransportError::Stopped) => return Err(TransportError::Closed),
                Err(e) => return Err(e),
            }
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.raw.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ClientTransport;

    fn echo_server(config: TcpServerConfig) -> (Arc<TcpServerTransport>, SocketAddr) {
        let server = Arc::new(TcpServerTransport::new(config));
        let callbacks = TransportCallbacks::new(Arc::new(|payload: &[u8], ctx: &ConnectionContext| {
            ctx.send(payload).unwrap();
        }));
        server.start(callbacks).unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    fn config_on_any_port() -> TcpServerConfig {
        TcpServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..TcpServerConfig::default()
        }
    }

    #[test]
    fn echo_round_trip() {
        let (server, addr) = echo_server(config_on_any_port());
        let client = TcpClientTransport::connect(addr, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        client.send(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        let reply = client.receive(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(reply, br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        server.stop();
    }

    #[test]
    fn receive_times_out_quietly() {
        let (server, addr) = echo_server(config_on_any_port());
        let client = TcpClientTransport::connect(addr, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let got = client.receive(Duration::from_millis(150)).unwrap();
        assert!(got.is_none());
        server.stop();
    }

    #[test]
    fn max_clients_rejects_excess() {
        let config = TcpServerConfig {
            max_clients: 1,
            ..config_on_any_port()
        };
        let (server, addr) = echo_server(config);

        let first = TcpClientTransport::connect(addr, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        first.send(br#"{"ok":1}"#).unwrap();
        assert!(first.receive(Duration::from_secs(2)).unwrap().is_some());

        let second = TcpClientTransport::connect(addr, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        // The server closes the second connection without serving it.
        let outcome = second.receive(Duration::from_secs(2));
        assert!(matches!(outcome, Err(TransportError::Closed)));
        assert_eq!(server.rejected_connections(), 1);
        server.stop();
    }

    #[test]
    fn oversized_frame_closes_connection() {
        let config = TcpServerConfig {
            max_message_size: 32,
            ..config_on_any_port()
        };
        let (server, addr) = echo_server(config);
        let client = TcpClientTransport::connect(addr, 1024).unwrap();
        client.send(&vec![b'x'; 64]).unwrap();
        assert!(matches!(
            client.receive(Duration::from_secs(2)),
            Err(TransportError::Closed)
        ));
        server.stop();
    }

    #[test]
    fn idle_timeout_closes_silent_connections() {
        let config = TcpServerConfig {
            idle_timeout: Some(Duration::from_millis(200)),
            ..config_on_any_port()
        };
        let (server, addr) = echo_server(config);
        let client = TcpClientTransport::connect(addr, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let outcome = client.receive(Duration::from_secs(2));
        assert!(matches!(outcome, Err(TransportError::Closed)));
        server.stop();
    }

    #[test]
    fn stop_returns_promptly_with_live_connections() {
        let (server, addr) = echo_server(config_on_any_port());
        let _client = TcpClientTransport::connect(addr, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        server.stop();
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn start_twice_is_an_error() {
        let (server, _addr) = echo_server(config_on_any_port());
        let again = server.start(TransportCallbacks::new(Arc::new(|_, _| {})));
        assert!(matches!(again, Err(TransportError::ConfigurationError(_))));
        server.stop();
    }
}
