//! WebSocket transport.
//!
//! Standard HTTP upgrade at a configurable path; after the handshake each
//! *text* frame carries exactly one JSON-RPC message. Binary frames are
//! rejected with an unsupported-data close; close frames end the session.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use tungstenite::handshake::HandshakeError;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::protocol::WebSocket;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::frame::CloseFrame;
use tungstenite::{Message, Utf8Bytes};

use loommcp_core::DEFAULT_MAX_MESSAGE_SIZE;

use crate::error::{TransportError, TransportResult};
use crate::listener::{ActivityClock, ConnTable, STOP_DRAIN_TIMEOUT, spawn_accept_loop};
use crate::traits::{
    ClientTransport, ConnectionContext, ServerTransport, TransportCallbacks, TransportKind,
};

/// WebSocket server configuration.
#[derive(Debug, Clone)]
pub struct WsServerConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Upgrade path; requests elsewhere are refused.
    pub path: String,
    /// Optional sub-protocol echoed when the client offers it.
    pub subprotocol: Option<String>,
    /// Connection-table capacity.
    pub max_clients: usize,
    /// Text-frame payload limit.
    pub max_message_size: usize,
    /// Close connections silent for this long; `None` disables the timer.
    pub idle_timeout: Option<Duration>,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8081".parse().expect("default bind address is valid"),
            path: "/ws".into(),
            subprotocol: None,
            max_clients: 64,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            idle_timeout: None,
        }
    }
}

/// WebSocket server transport.
pub struct WsServerTransport {
    config: WsServerConfig,
    shutdown: Arc<AtomicBool>,
    conns: Arc<ConnTable>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl WsServerTransport {
    /// Create a transport; nothing binds until [`ServerTransport::start`].
    pub fn new(config: WsServerConfig) -> Self {
        let max_clients = config.max_clients;
        Self {
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            conns: Arc::new(ConnTable::new(max_clients)),
            accept_handle: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Live connection count.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }
}

impl ServerTransport for WsServerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn start(&self, callbacks: TransportCallbacks) -> TransportResult<()> {
        let mut handle_slot = self.accept_handle.lock();
        if handle_slot.is_some() {
            return Err(TransportError::ConfigurationError(
                "transport already started".into(),
            ));
        }
        let listener = std::net::TcpListener::bind(self.config.bind_addr).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "failed to bind WebSocket listener on {}: {e}",
                self.config.bind_addr
            ))
        })?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        info!(addr = %local_addr, path = %self.config.path, "WebSocket transport listening");

        self.shutdown.store(false, Ordering::Release);
        let conns = Arc::clone(&self.conns);
        let config = self.config.clone();
        let handle = spawn_accept_loop(
            "loommcp-ws-accept".into(),
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
                    .name(format!("loommcp-ws-conn-{conn_id}"))
                    .spawn(move || {
                        match accept_upgrade(stream, &config, &stop) {
                            Ok(socket) => {
                                connection_loop(socket, peer, &stop, &callbacks, &config);
                            }
                            Err(e) => debug!(%peer, error = %e, "WebSocket handshake failed"),
                        }
                        conns.deregister(conn_id);
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
            warn!("WebSocket accept thread panicked");
        }
        self.conns.wait_empty(STOP_DRAIN_TIMEOUT);
        *self.local_addr.lock() = None;
        info!("WebSocket transport stopped");
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

/// Drive the server handshake to completion over a socket with short read
/// timeouts.
fn accept_upgrade(
    stream: TcpStream,
    config: &WsServerConfig,
    stop: &AtomicBool,
) -> TransportResult<WebSocket<TcpStream>> {
    let path = config.path.clone();
    let subprotocol = config.subprotocol.clone();
    let check = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() != path {
            let reject = tungstenite::http::Response::builder()
                .status(404)
                .body(None)
                .expect("static response builds");
            return Err(reject);
        }
        if let Some(proto) = &subprotocol
            && let Some(offered) = req.headers().get("Sec-WebSocket-Protocol")
            && offered
                .to_str()
                .map(|v| v.split(',').any(|p| p.trim() == proto))
                .unwrap_or(false)
        {
            resp.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                proto.parse().expect("configured subprotocol is a valid header"),
            );
        }
        Ok(resp)
    };

    let mut pending = match tungstenite::accept_hdr(stream, check) {
        Ok(socket) => return Ok(socket),
        Err(HandshakeError::Interrupted(mid)) => mid,
        Err(HandshakeError::Failure(e)) => {
            return Err(TransportError::ProtocolError(e.to_string()));
        }
    };
    loop {
        if stop.load(Ordering::Acquire) {
            return Err(TransportError::Stopped);
        }
        match pending.handshake() {
            Ok(socket) => return Ok(socket),
            Err(HandshakeError::Interrupted(mid)) => pending = mid,
            Err(HandshakeError::Failure(e)) => {
                return Err(TransportError::ProtocolError(e.to_string()));
            }
        }
    }
}

fn connection_loop(
    socket: WebSocket<TcpStream>,
    peer: SocketAddr,
    stop: &AtomicBool,
    callbacks: &TransportCallbacks,
    config: &WsServerConfig,
) {
    let socket = Arc::new(Mutex::new(socket));
    let activity = Arc::new(ActivityClock::new());
    activity.touch();

    let reply_socket = Arc::clone(&socket);
    let reply_activity = Arc::clone(&activity);
    let ctx = ConnectionContext::new(
        TransportKind::WebSocket,
        Some(peer),
        None,
        Arc::new(move |payload: &[u8]| {
            let text = std::str::from_utf8(payload)
                .map_err(|e| TransportError::SendFailed(format!("non-UTF-8 payload: {e}")))?;
            let mut socket = reply_socket.lock();
            socket
                .send(Message::Text(Utf8Bytes::from(text)))
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
            reply_activity.touch();
            Ok(())
        }),
    );

    loop {
        if stop.load(Ordering::Acquire) {
            let _ = socket.lock().close(None);
            break;
        }
        if let Some(idle_timeout) = config.idle_timeout
            && activity.idle_for() >= idle_timeout
        {
            info!(%peer, "closing idle WebSocket connection");
            let _ = socket.lock().close(None);
            break;
        }

        let message = socket.lock().read();
        match message {
            Ok(Message::Text(text)) => {
                if text.len() > config.max_message_size {
                    let err = TransportError::MessageTooLarge {
                        size: text.len(),
                        max: config.max_message_size,
                    };
                    warn!(%peer, error = %err, "closing connection");
                    callbacks.report(&err);
                    let _ = socket.lock().close(Some(CloseFrame {
                        code: CloseCode::Size,
                        reason: Utf8Bytes::from_static("message too large"),
                    }));
                    break;
                }
                activity.touch();
                (callbacks.on_message)(text.as_bytes(), &ctx);
            }
            Ok(Message::Binary(_)) => {
                debug!(%peer, "rejecting binary frame");
                let _ = socket.lock().close(Some(CloseFrame {
                    code: CloseCode::Unsupported,
                    reason: Utf8Bytes::from_static("binary frames not supported"),
                }));
                break;
            }
            Ok(Message::Close(_)) => {
                debug!(%peer, "peer sent close frame");
                break;
            }
            // Pings are answered by the protocol layer on the next read.
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                break;
            }
            Err(e) => {
                warn!(%peer, error = %e, "WebSocket read failed");
                callbacks.report(&TransportError::ReceiveFailed(e.to_string()));
                break;
            }
        }
    }
}

/// Blocking WebSocket client transport.
pub struct WsClientTransport {
    socket: Mutex<WebSocket<TcpStream>>,
    raw: TcpStream,
    peer: SocketAddr,
    stop: Arc<AtomicBool>,
    max_message_size: usize,
}

impl WsClientTransport {
    /// Connect and upgrade.
    ///
    /// # Errors
    ///
    /// Connection and handshake failures.
    pub fn connect(addr: SocketAddr, path: &str, max_message_size: usize) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| TransportError::ConnectionFailed(format!("connect {addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        stream
            .set_read_timeout(Some(crate::listener::SOCKET_READ_TIMEOUT))?;
        let raw = stream.try_clone()?;
        let url = format!("ws://{addr}{path}");

        let mut pending = match tungstenite::client(url.as_str(), stream) {
            Ok((socket, _resp)) => {
                return Ok(Self {
                    socket: Mutex::new(socket),
                    raw,
                    peer: addr,
                    stop: Arc::new(AtomicBool::new(false)),
                    max_message_size,
                });
            }
            Err(HandshakeError::Interrupted(mid)) => mid,
            Err(HandshakeError::Failure(e)) => {
                return Err(TransportError::ConnectionFailed(e.to_string()));
            }
        };
        loop {
            match pending.handshake() {
                Ok((socket, _resp)) => {
                    return Ok(Self {
                        socket: Mutex::new(socket),
                        raw,
                        peer: addr,
                        stop: Arc::new(AtomicBool::new(false)),
                        max_message_size,
                    });
                }
                Err(HandshakeError::Interrupted(mid)) => pending = mid,
                Err(HandshakeError::Failure(e)) => {
                    return Err(TransportError::ConnectionFailed(e.to_string()));
                }
            }
        }
    }
}

impl ClientTransport for WsClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn send(&self, payload: &[u8]) -> TransportResult<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if payload.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message_size,
            });
        }
        let text = std::str::from_utf8(payload)
            .map_err(|e| TransportError::SendFailed(format!("non-UTF-8 payload: {e}")))?;
        self.socket
            .lock()
            .send(Message::Text(Utf8Bytes::from(text)))
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn receive(&self, timeout: Duration) -> TransportResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stop.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            let message = self.socket.lock().read();
            match message {
                Ok(Message::Text(text)) => return Ok(Some(text.as_bytes().to_vec())),
                Ok(Message::Close(_)) => return Err(TransportError::Closed),
                Ok(_) => {}
                Err(tungstenite::Error::Io(e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                ) => return Err(TransportError::Closed),
                Err(e) => return Err(TransportError::ReceiveFailed(e.to_string())),
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
