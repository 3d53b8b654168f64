//! Streamable HTTP transport (MCP 2025-03-26).
//!
//! One endpoint path serves four methods:
//!
//! - `POST` carries one JSON-RPC message; the reply is a single
//!   `application/json` response (`202 Accepted` for notifications).
//! - `GET` opens a Server-Sent Events stream with periodic `:heartbeat`
//!   comments; `Last-Event-Id` resumes the session's event ring.
//! - `DELETE` terminates the session named by `Mcp-Session-Id`.
//! - `OPTIONS` answers CORS preflight when CORS is enabled.
//!
//! Sessions are assigned on `initialize` and echoed in the
//! `Mcp-Session-Id` header. Legacy endpoints (`POST /call_tool`,
//! `GET /tools`, `GET /events`) map onto the equivalent MCP methods when
//! enabled.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::{Condvar, Mutex};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use loommcp_core::{BufferPool, DEFAULT_MAX_MESSAGE_SIZE, JsonRpcResponse, codes, jsonrpc};

use crate::error::{TransportError, TransportResult};
use crate::listener::{ActivityClock, ConnTable, STOP_DRAIN_TIMEOUT, spawn_accept_loop};
use crate::session::{Replay, SessionConfig, SessionStore};
use crate::traits::{
    ConnectionContext, ServerTransport, TransportCallbacks, TransportKind,
};

/// Header size cap for one request head.
const MAX_HEAD_SIZE: usize = 8 * 1024;

/// How often the SSE loop polls the session ring between heartbeats.
const SSE_POLL: Duration = Duration::from_millis(50);

/// Streamable HTTP server configuration.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// The MCP endpoint path.
    pub endpoint_path: String,
    /// Connection-table capacity.
    pub max_clients: usize,
    /// POST body limit.
    pub max_body_size: usize,
    /// How long a POST waits for its worker-produced reply.
    pub request_timeout: Duration,
    /// Assign and track sessions.
    pub enable_sessions: bool,
    /// Session store tuning.
    pub session: SessionConfig,
    /// SSE heartbeat period; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Emit `Access-Control-Allow-*` headers and answer preflight.
    pub enable_cors: bool,
    /// Origin glob allowlist; `None` disables origin validation.
    pub allowed_origins: Option<Vec<String>>,
    /// Serve the legacy `/call_tool`, `/tools`, and `/events` endpoints.
    pub enable_legacy: bool,
    /// Close keep-alive connections idle for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8082".parse().expect("default bind address is valid"),
            endpoint_path: "/mcp".into(),
            max_clients: 64,
            max_body_size: DEFAULT_MAX_MESSAGE_SIZE,
            request_timeout: Duration::from_secs(30),
            enable_sessions: false,
            session: SessionConfig::default(),
            heartbeat_interval: Some(Duration::from_secs(30)),
            enable_cors: false,
            allowed_origins: None,
            enable_legacy: false,
            idle_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Slot size for pooled body-read scratch buffers.
const BODY_CHUNK_SIZE: usize = 4096;

struct HttpShared {
    config: HttpServerConfig,
    sessions: Arc<SessionStore>,
    origin_globs: Option<GlobSet>,
    callbacks: TransportCallbacks,
    legacy_id: AtomicU64,
    buffers: BufferPool,
}

/// Streamable HTTP server transport.
pub struct HttpServerTransport {
    config: HttpServerConfig,
    sessions: Arc<SessionStore>,
    shutdown: Arc<AtomicBool>,
    conns: Arc<ConnTable>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HttpServerTransport {
    /// Create a transport; nothing binds until [`ServerTransport::start`].
    pub fn new(config: HttpServerConfig) -> Self {
        let sessions = Arc::new(SessionStore::new(config.session.clone()));
        let max_clients = config.max_clients;
        Self {
            config,
            sessions,
            shutdown: Arc::new(AtomicBool::new(false)),
            conns: Arc::new(ConnTable::new(max_clients)),
            accept_handle: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// The session store, for server-initiated pushes and housekeeping.
    pub fn sessions(&self) -> Arc<SessionStore> {
        Arc::clone(&self.sessions)
    }
}

impl ServerTransport for HttpServerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpStreamable
    }

    fn start(&self, callbacks: TransportCallbacks) -> TransportResult<()> {
        let mut handle_slot = self.accept_handle.lock();
        if handle_slot.is_some() {
            return Err(TransportError::ConfigurationError(
                "transport already started".into(),
            ));
        }

        let origin_globs = match &self.config.allowed_origins {
            Some(patterns) => Some(build_origin_globs(patterns)?),
            None => None,
        };
        let listener = TcpListener::bind(self.config.bind_addr).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "failed to bind HTTP listener on {}: {e}",
                self.config.bind_addr
            ))
        })?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        info!(addr = %local_addr, endpoint = %self.config.endpoint_path, "HTTP transport listening");

        let shared = Arc::new(HttpShared {
            config: self.config.clone(),
            sessions: Arc::clone(&self.sessions),
            origin_globs,
            callbacks,
            legacy_id: AtomicU64::new(1 << 32),
            buffers: BufferPool::new(BODY_CHUNK_SIZE, self.config.max_clients),
        });

        self.shutdown.store(false, Ordering::Release);
        let conns = Arc::clone(&self.conns);
        let handle = spawn_accept_loop(
            "loommcp-http-accept".into(),
            listener,
            Arc::clone(&self.shutdown),
            move |stream, peer| {
                let Some((conn_id, stop)) = conns.try_register(&stream) else {
                    warn!(%peer, "connection table full, rejecting");
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                };
                let shared = Arc::clone(&shared);
                let conns = Arc::clone(&conns);
                let conns_err = Arc::clone(&conns);
                let spawned = std::thread::Builder::new()
                    .name(format!("loommcp-http-conn-{conn_id}"))
                    .spawn(move || {
                        connection_loop(stream, peer, &stop, &shared);
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
            warn!("HTTP accept thread panicked");
        }
        self.conns.wait_empty(STOP_DRAIN_TIMEOUT);
        *self.local_addr.lock() = None;
        info!("HTTP transport stopped");
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

fn build_origin_globs(patterns: &[String]) -> TransportResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern.trim()).map_err(|e| {
            TransportError::ConfigurationError(format!("invalid origin pattern '{pattern}': {e}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| TransportError::ConfigurationError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

struct RequestHead {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    keep_alive: bool,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    fn session_id(&self) -> Option<Uuid> {
        self.header("mcp-session-id")
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
    }
}

enum HeadOutcome {
    Head(RequestHead, Vec<u8>),
    WouldBlock,
    Closed,
}

/// Accumulate bytes until the blank line ending the request head, then
/// parse it. Body bytes read past the head are returned as leftover.
fn read_request_head(stream: &mut TcpStream, stop: &AtomicBool) -> TransportResult<HeadOutcome> {
    let mut buf: Vec<u8> = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(TransportError::ProtocolError("request head too large".into()));
        }
        match stream.read(&mut chunk) {
            Ok(0) => {
                return if buf.is_empty() {
                    Ok(HeadOutcome::Closed)
                } else {
                    Err(TransportError::ConnectionLost("closed mid-request".into()))
                };
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if buf.is_empty() {
                    return Ok(HeadOutcome::WouldBlock);
                }
                if stop.load(Ordering::Acquire) {
                    return Err(TransportError::Stopped);
                }
            }
            Err(e) => return Err(e.into()),
        }
    };

    let head_bytes = &buf[..head_end];
    let leftover = buf[head_end..].to_vec();

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(head_bytes) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(TransportError::ProtocolError("malformed request head".into())),
    }

    let method = parsed.method.unwrap_or("").to_owned();
    let raw_path = parsed.path.unwrap_or("/");
    let path = raw_path.split('?').next().unwrap_or("/").to_owned();
    let headers: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_owned(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();
    let keep_alive = !headers
        .iter()
        .any(|(n, v)| n.eq_ignore_ascii_case("connection") && v.eq_ignore_ascii_case("close"));

    Ok(HeadOutcome::Head(
        RequestHead {
            method,
            path,
            headers,
            keep_alive,
        },
        leftover,
    ))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Read the request body given what was already buffered past the head.
///
/// The read scratch comes from the shared buffer pool; exhaustion falls
/// back to a heap buffer transparently.
fn read_body(
    stream: &mut TcpStream,
    leftover: Vec<u8>,
    content_length: usize,
    stop: &AtomicBool,
    buffers: &BufferPool,
) -> TransportResult<Vec<u8>> {
    let mut body = leftover;
    let mut chunk = buffers.acquire(BODY_CHUNK_SIZE);
    while body.len() < content_length {
        match stream.read(&mut chunk) {
            Ok(0) => {
                return Err(TransportError::ConnectionLost("closed mid-body".into()));
            }
            Ok(n) => body.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if stop.load(Ordering::Acquire) {
                    return Err(TransportError::Stopped);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    body.truncate(content_length);
    Ok(body)
}

// ---------------------------------------------------------------------------
// Response writing
// ---------------------------------------------------------------------------

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: Option<&str>,
    body: &[u8],
    extra_headers: &[(String, String)],
) -> TransportResult<()> {
    let mut response = format!("HTTP/1.1 {} {}\r\n", status, status_text(status));
    if let Some(content_type) = content_type {
        response.push_str(&format!("Content-Type: {content_type}\r\n"));
    }
    response.push_str(&format!("Content-Length: {}\r\n", body.len()));
    for (name, value) in extra_headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

fn cors_headers(shared: &HttpShared, origin: Option<&str>) -> Vec<(String, String)> {
    if !shared.config.enable_cors {
        return Vec::new();
    }
    let allow_origin = origin.unwrap_or("*").to_owned();
    vec![
        ("Access-Control-Allow-Origin".into(), allow_origin),
        (
            "Access-Control-Allow-Methods".into(),
            "GET, POST, DELETE, OPTIONS".into(),
        ),
        (
            "Access-Control-Allow-Headers".into(),
            "Content-Type, Accept, Origin, Authorization, Mcp-Session-Id, Last-Event-Id".into(),
        ),
        ("Access-Control-Max-Age".into(), "86400".into()),
    ]
}

fn error_body(id: Option<u64>, code: i32, message: &str) -> Vec<u8> {
    let response = JsonRpcResponse::error(id.unwrap_or(0), code, message);
    serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec())
}

// ---------------------------------------------------------------------------
// Reply slot: hands the worker-produced response back to the HTTP thread
// ---------------------------------------------------------------------------

struct ReplySlot {
    data: Mutex<Option<Vec<u8>>>,
    cv: Condvar,
}

impl ReplySlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    fn fill(&self, payload: &[u8]) {
        *self.data.lock() = Some(payload.to_vec());
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut data = self.data.lock();
        while data.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.cv.wait_for(&mut data, deadline - now);
        }
        data.take()
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

fn connection_loop(mut stream: TcpStream, peer: SocketAddr, stop: &AtomicBool, shared: &HttpShared) {
    let activity = ActivityClock::new();
    activity.touch();

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match read_request_head(&mut stream, stop) {
            Ok(HeadOutcome::Head(head, leftover)) => {
                activity.touch();
                match serve_request(&mut stream, peer, stop, shared, head, leftover) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        debug!(%peer, error = %e, "request handling ended");
                        break;
                    }
                }
            }
            Ok(HeadOutcome::WouldBlock) => {
                if let Some(idle_timeout) = shared.config.idle_timeout
                    && activity.idle_for() >= idle_timeout
                {
                    debug!(%peer, "closing idle HTTP connection");
                    break;
                }
            }
            Ok(HeadOutcome::Closed) => break,
            Err(TransportError::Stopped) => break,
            Err(e) => {
                debug!(%peer, error = %e, "bad request stream");
                shared.callbacks.report(&e);
                break;
            }
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Dispatch one parsed request. Returns whether the connection stays open.
fn serve_request(
    stream: &mut TcpStream,
    peer: SocketAddr,
    stop: &AtomicBool,
    shared: &HttpShared,
    head: RequestHead,
    leftover: Vec<u8>,
) -> TransportResult<bool> {
    let origin = head.header("origin").map(str::to_owned);
    let cors = cors_headers(shared, origin.as_deref());

    // Origin validation applies to every route when configured.
    if let Some(globs) = &shared.origin_globs
        && let Some(origin) = origin.as_deref()
        && !globs.is_match(origin)
    {
        warn!(%peer, origin, "origin denied");
        let body = error_body(None, codes::ORIGIN_DENIED, "Origin not allowed");
        write_response(stream, 403, Some("application/json"), &body, &cors)?;
        return Ok(head.keep_alive);
    }

    let endpoint = shared.config.endpoint_path.as_str();
    match (head.method.as_str(), head.path.as_str()) {
        ("POST", path) if path == endpoint => handle_post(stream, peer, stop, shared, &head, leftover, &cors),
        ("GET", path) if path == endpoint => {
            handle_sse(stream, stop, shared, &head, &cors).map(|()| false)
        }
        ("DELETE", path) if path == endpoint => handle_delete(stream, shared, &head, &cors),
        ("OPTIONS", _) => handle_options(stream, shared, &head, &cors),
        ("POST", "/call_tool") if shared.config.enable_legacy => {
            handle_legacy_call(stream, peer, stop, shared, &head, leftover, &cors, "call_tool")
        }
        ("GET", "/tools") if shared.config.enable_legacy => {
            handle_legacy_get(stream, peer, shared, &head, &cors, "list_tools")
        }
        ("GET", "/events") if shared.config.enable_legacy => {
            handle_sse(stream, stop, shared, &head, &cors).map(|()| false)
        }
        (_, path) if path == endpoint => {
            let body = error_body(None, codes::INVALID_REQUEST, "Method not allowed");
            write_response(stream, 405, Some("application/json"), &body, &cors)?;
            Ok(head.keep_alive)
        }
        _ => {
            let body = error_body(None, codes::INVALID_REQUEST, "Unknown endpoint");
            write_response(stream, 404, Some("application/json"), &body, &cors)?;
            Ok(head.keep_alive)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_post(
    stream: &mut TcpStream,
    peer: SocketAddr,
    stop: &AtomicBool,
    shared: &HttpShared,
    head: &RequestHead,
    leftover: Vec<u8>,
    cors: &[(String, String)],
) -> TransportResult<bool> {
    let Some(content_length) = head.content_length() else {
        let body = error_body(None, codes::INVALID_REQUEST, "Content-Length required");
        write_response(stream, 400, Some("application/json"), &body, cors)?;
        return Ok(head.keep_alive);
    };
    if content_length > shared.config.max_body_size {
        let body = error_body(None, codes::PAYLOAD_TOO_LARGE, "Request body too large");
        write_response(stream, 413, Some("application/json"), &body, cors)?;
        return Ok(false);
    }
    let body = read_body(stream, leftover, content_length, stop, &shared.buffers)?;
    let request_id = jsonrpc::peek_id(&body);

    // Session bookkeeping happens at the transport: initialize allocates,
    // everything else touches.
    let mut response_headers = cors.to_vec();
    let mut session_id = head.session_id();
    if shared.config.enable_sessions {
        let is_initialize = jsonrpc::peek_str_field(&body, "method")
            .is_some_and(|m| m == "initialize");
        if is_initialize {
            let id = shared.sessions.create();
            response_headers.push(("Mcp-Session-Id".into(), id.to_string()));
            session_id = Some(id);
        } else if let Some(id) = session_id {
            if !shared.sessions.touch(&id) {
                let body = error_body(request_id, codes::SESSION_GONE, "Unknown session");
                write_response(stream, 404, Some("application/json"), &body, cors)?;
                return Ok(head.keep_alive);
            }
        }
    }

    let slot = ReplySlot::new();
    let reply_slot = Arc::clone(&slot);
    let ctx = ConnectionContext::new(
        TransportKind::HttpStreamable,
        Some(peer),
        session_id.map(|id| id.to_string()),
        Arc::new(move |payload: &[u8]| {
            reply_slot.fill(payload);
            Ok(())
        }),
    );
    (shared.callbacks.on_message)(&body, &ctx);

    if request_id.is_none() {
        // Notification: nothing to wait for.
        write_response(stream, 202, None, b"", &response_headers)?;
        return Ok(head.keep_alive);
    }

    match slot.wait(shared.config.request_timeout) {
        Some(reply) => {
            let status = status_for_reply(&reply);
            write_response(stream, status, Some("application/json"), &reply, &response_headers)?;
        }
        None => {
            let body = error_body(request_id, codes::INTERNAL_ERROR, "Request timed out");
            write_response(stream, 500, Some("application/json"), &body, &response_headers)?;
        }
    }
    Ok(head.keep_alive)
}

/// Map a JSON-RPC reply onto the HTTP status line: successes are 200,
/// errors take the status their code implies.
fn status_for_reply(reply: &[u8]) -> u16 {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(reply) else {
        return 200;
    };
    let Some(code) = value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(serde_json::Value::as_i64)
    else {
        return 200;
    };
    match code as i32 {
        codes::RATE_LIMITED => 429,
        codes::AUTH_FAILED => 401,
        codes::ORIGIN_DENIED => 403,
        codes::SESSION_GONE => 404,
        codes::PAYLOAD_TOO_LARGE => 413,
        codes::PARSE_ERROR | codes::INVALID_REQUEST => 400,
        codes::INTERNAL_ERROR => 500,
        _ => 200,
    }
}

fn handle_delete(
    stream: &mut TcpStream,
    shared: &HttpShared,
    head: &RequestHead,
    cors: &[(String, String)],
) -> TransportResult<bool> {
    let destroyed = head
        .session_id()
        .is_some_and(|id| shared.sessions.destroy(&id));
    if destroyed {
        write_response(stream, 200, None, b"", cors)?;
    } else {
        let body = error_body(None, codes::SESSION_GONE, "Unknown session");
        write_response(stream, 404, Some("application/json"), &body, cors)?;
    }
    Ok(head.keep_alive)
}

fn handle_options(
    stream: &mut TcpStream,
    shared: &HttpShared,
    head: &RequestHead,
    cors: &[(String, String)],
) -> TransportResult<bool> {
    if shared.config.enable_cors {
        write_response(stream, 204, None, b"", cors)?;
    } else {
        write_response(stream, 405, None, b"", &[])?;
    }
    Ok(head.keep_alive)
}

/// Serve the SSE stream until the client drops, the session breaks, or the
/// transport stops. Replays from `Last-Event-Id` first.
fn handle_sse(
    stream: &mut TcpStream,
    stop: &AtomicBool,
    shared: &HttpShared,
    head: &RequestHead,
    cors: &[(String, String)],
) -> TransportResult<()> {
    let accepts_sse = head
        .header("accept")
        .is_none_or(|a| a.contains("text/event-stream") || a.contains("*/*"));
    if !accepts_sse {
        let body = error_body(None, codes::INVALID_REQUEST, "Accept must allow text/event-stream");
        write_response(stream, 400, Some("application/json"), &body, cors)?;
        return Ok(());
    }

    let session_id = if shared.config.enable_sessions {
        match head.session_id() {
            Some(id) if shared.sessions.touch(&id) => Some(id),
            _ => {
                let body = error_body(None, codes::SESSION_GONE, "Session required for SSE");
                write_response(stream, 404, Some("application/json"), &body, cors)?;
                return Ok(());
            }
        }
    } else {
        None
    };

    // Stream head: no Content-Length, connection stays open.
    let mut response = String::from(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n",
    );
    for (name, value) in cors {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes())?;
    stream.flush()?;

    let mut cursor: u64 = head
        .header("last-event-id")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    let mut last_heartbeat = Instant::now();

    loop {
        if stop.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Some(session_id) = &session_id {
            match shared.sessions.replay(session_id, cursor) {
                Some(Replay::Events(events)) => {
                    for event in events {
                        let frame = format!(
                            "id: {}\nevent: message\ndata: {}\n\n",
                            event.id, event.payload
                        );
                        stream.write_all(frame.as_bytes())?;
                        cursor = event.id;
                    }
                }
                Some(Replay::Gap) => {
                    let data = json!({
                        "code": codes::SESSION_GONE,
                        "message": "event stream broken, re-initialize",
                    });
                    let frame = format!("event: error\ndata: {data}\n\n");
                    stream.write_all(frame.as_bytes())?;
                    stream.flush()?;
                    return Ok(());
                }
                None => return Ok(()),
            }
        }

        if let Some(interval) = shared.config.heartbeat_interval
            && last_heartbeat.elapsed() >= interval
        {
            stream.write_all(b":heartbeat\n\n")?;
            last_heartbeat = Instant::now();
        }
        stream.flush()?;
        std::thread::sleep(SSE_POLL);
    }
}

/// Legacy POST endpoint: wrap the body as params of the given MCP method
/// and return the bare result in the legacy envelope.
#[allow(clippy::too_many_arguments)]
fn handle_legacy_call(
    stream: &mut TcpStream,
    peer: SocketAddr,
    stop: &AtomicBool,
    shared: &HttpShared,
    head: &RequestHead,
    leftover: Vec<u8>,
    cors: &[(String, String)],
    method: &str,
) -> TransportResult<bool> {
    let Some(content_length) = head.content_length() else {
        write_response(stream, 400, Some("application/json"), br#"{"error":"Content-Length required"}"#, cors)?;
        return Ok(head.keep_alive);
    };
    if content_length > shared.config.max_body_size {
        write_response(stream, 413, Some("application/json"), br#"{"error":"body too large"}"#, cors)?;
        return Ok(false);
    }
    let body = read_body(stream, leftover, content_length, stop, &shared.buffers)?;
    let params: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            write_response(stream, 400, Some("application/json"), br#"{"error":"invalid JSON"}"#, cors)?;
            return Ok(head.keep_alive);
        }
    };
    dispatch_legacy(stream, peer, shared, method, Some(params), cors)?;
    Ok(head.keep_alive)
}

fn handle_legacy_get(
    stream: &mut TcpStream,
    peer: SocketAddr,
    shared: &HttpShared,
    head: &RequestHead,
    cors: &[(String, String)],
    method: &str,
) -> TransportResult<bool> {
    dispatch_legacy(stream, peer, shared, method, None, cors)?;
    Ok(head.keep_alive)
}

/// Synthesize a JSON-RPC request, run it through the normal dispatch path,
/// and unwrap the response into the legacy `{"result": …} | {"error": …}`
/// envelope.
fn dispatch_legacy(
    stream: &mut TcpStream,
    peer: SocketAddr,
    shared: &HttpShared,
    method: &str,
    params: Option<serde_json::Value>,
    cors: &[(String, String)],
) -> TransportResult<()> {
    let id = shared.legacy_id.fetch_add(1, Ordering::Relaxed);
    let request = loommcp_core::JsonRpcRequest::new(id, method, params);
    let payload = serde_json::to_vec(&request)
        .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

    let slot = ReplySlot::new();
    let reply_slot = Arc::clone(&slot);
    let ctx = ConnectionContext::new(
        TransportKind::Http,
        Some(peer),
        None,
        Arc::new(move |payload: &[u8]| {
            reply_slot.fill(payload);
            Ok(())
        }),
    );
    (shared.callbacks.on_message)(&payload, &ctx);

    match slot.wait(shared.config.request_timeout) {
        Some(reply) => {
            let envelope = match serde_json::from_slice::<serde_json::Value>(&reply) {
                Ok(value) if value.get("result").is_some() => {
                    json!({"result": value["result"]})
                }
                Ok(value) if value.get("error").is_some() => {
                    json!({"error": value["error"]})
                }
                _ => json!({"error": {"code": codes::INTERNAL_ERROR, "message": "bad response"}}),
            };
            let body = envelope.to_string();
            write_response(stream, 200, Some("application/json"), body.as_bytes(), cors)?;
        }
        None => {
            write_response(
                stream,
                500,
                Some("application/json"),
                br#"{"error":{"code":-32603,"message":"request timed out"}}"#,
                cors,
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    /// Replies `{"ok":true}` to every request, echoing its id.
    fn responder() -> TransportCallbacks {
        TransportCallbacks::new(Arc::new(|payload: &[u8], ctx: &ConnectionContext| {
            if let Some(id) = jsonrpc::peek_id(payload) {
                let response = JsonRpcResponse::success(id, json!({"ok": true}));
                let bytes = serde_json::to_vec(&response).unwrap();
                ctx.send(&bytes).unwrap();
            }
        }))
    }

    fn start(config: HttpServerConfig) -> (Arc<HttpServerTransport>, SocketAddr) {
        let transport = Arc::new(HttpServerTransport::new(HttpServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..config
        }));
        transport.start(responder()).unwrap();
        let addr = transport.local_addr().unwrap();
        (transport, addr)
    }

    fn send_request(addr: SocketAddr, raw: &str) -> (u16, Vec<(String, String)>, Vec<u8>) {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(raw.as_bytes()).unwrap();
        read_response(&mut stream)
    }

    fn read_response(stream: &mut TcpStream) -> (u16, Vec<(String, String)>, Vec<u8>) {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reader = std::io::BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).unwrap();
        let status: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_owned(), value.trim().to_owned()));
            }
        }
        let content_length: usize = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.parse().unwrap())
            .unwrap_or(0);
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).unwrap();
        (status, headers, body)
    }

    fn post(path: &str, body: &str, extra_headers: &str) -> String {
        format!(
            "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n{extra_headers}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn post_request_gets_json_response() {
        let (transport, addr) = start(HttpServerConfig::default());
        let raw = post("/mcp", r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#, "");
        let (status, _, body) = send_request(addr, &raw);
        assert_eq!(status, 200);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["result"]["ok"], true);
        transport.stop();
    }

    #[test]
    fn notification_is_accepted_without_body() {
        let (transport, addr) = start(HttpServerConfig::default());
        let raw = post("/mcp", r#"{"jsonrpc":"2.0","method":"notify"}"#, "");
        let (status, _, body) = send_request(addr, &raw);
        assert_eq!(status, 202);
        assert!(body.is_empty());
        transport.stop();
    }

    #[test]
    fn initialize_assigns_a_session() {
        let config = HttpServerConfig {
            enable_sessions: true,
            ..HttpServerConfig::default()
        };
        let (transport, addr) = start(config);
        let raw = post(
            "/mcp",
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            "",
        );
        let (status, headers, _) = send_request(addr, &raw);
        assert_eq!(status, 200);
        let session = header(&headers, "mcp-session-id").unwrap();
        assert!(Uuid::parse_str(session).is_ok());
        assert_eq!(transport.sessions().len(), 1);
        transport.stop();
    }

    #[test]
    fn unknown_session_is_rejected() {
        let config = HttpServerConfig {
            enable_sessions: true,
            ..HttpServerConfig::default()
        };
        let (transport, addr) = start(config);
        let ghost = Uuid::new_v4();
        let raw = post(
            "/mcp",
            r#"{"jsonrpc":"2.0","id":2,"method":"list_tools"}"#,
            &format!("Mcp-Session-Id: {ghost}\r\n"),
        );
        let (status, _, body) = send_request(addr, &raw);
        assert_eq!(status, 404);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], codes::SESSION_GONE);
        transport.stop();
    }

    #[test]
    fn delete_terminates_the_session() {
        let config = HttpServerConfig {
            enable_sessions: true,
            ..HttpServerConfig::default()
        };
        let (transport, addr) = start(config);
        let session = transport.sessions().create();
        let raw = format!(
            "DELETE /mcp HTTP/1.1\r\nHost: localhost\r\nMcp-Session-Id: {session}\r\nConnection: close\r\n\r\n"
        );
        let (status, _, _) = send_request(addr, &raw);
        assert_eq!(status, 200);
        assert_eq!(transport.sessions().len(), 0);
        transport.stop();
    }

    #[test]
    fn unknown_endpoint_is_404_and_wrong_method_is_405() {
        let (transport, addr) = start(HttpServerConfig::default());
        let raw = post("/nope", r#"{}"#, "");
        let (status, _, _) = send_request(addr, &raw);
        assert_eq!(status, 404);

        let raw = "PUT /mcp HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let (status, _, _) = send_request(addr, raw);
        assert_eq!(status, 405);
        transport.stop();
    }

    #[test]
    fn oversized_body_is_413() {
        let config = HttpServerConfig {
            max_body_size: 64,
            ..HttpServerConfig::default()
        };
        let (transport, addr) = start(config);
        let big = "x".repeat(128);
        let raw = post("/mcp", &format!(r#"{{"pad":"{big}"}}"#), "");
        let (status, _, _) = send_request(addr, &raw);
        assert_eq!(status, 413);
        transport.stop();
    }

    #[test]
    fn origin_validation_denies_mismatches() {
        let config = HttpServerConfig {
            allowed_origins: Some(vec!["https://*.example.com".into()]),
            ..HttpServerConfig::default()
        };
        let (transport, addr) = start(config);

        let raw = post(
            "/mcp",
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "Origin: https://evil.invalid\r\n",
        );
        let (status, _, body) = send_request(addr, &raw);
        assert_eq!(status, 403);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], codes::ORIGIN_DENIED);

        let raw = post(
            "/mcp",
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "Origin: https://app.example.com\r\n",
        );
        let (status, _, _) = send_request(addr, &raw);
        assert_eq!(status, 200);
        transport.stop();
    }

    #[test]
    fn options_preflight_returns_cors_headers() {
        let config = HttpServerConfig {
            enable_cors: true,
            ..HttpServerConfig::default()
        };
        let (transport, addr) = start(config);
        let raw = "OPTIONS /mcp HTTP/1.1\r\nHost: localhost\r\nOrigin: https://a.test\r\nConnection: close\r\n\r\n";
        let (status, headers, _) = send_request(addr, raw);
        assert_eq!(status, 204);
        assert_eq!(header(&headers, "access-control-allow-origin"), Some("https://a.test"));
        assert!(header(&headers, "access-control-allow-methods").unwrap().contains("DELETE"));
        transport.stop();
    }

    #[test]
    fn sse_replays_events_after_last_event_id() {
        let config = HttpServerConfig {
            enable_sessions: true,
            heartbeat_interval: None,
            ..HttpServerConfig::default()
        };
        let (transport, addr) = start(config);
        let sessions = transport.sessions();
        let session = sessions.create();
        for payload in [r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#] {
            sessions.append_event(&session, payload);
        }

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let raw = format!(
            "GET /mcp HTTP/1.1\r\nHost: localhost\r\nAccept: text/event-stream\r\nMcp-Session-Id: {session}\r\nLast-Event-Id: 1\r\n\r\n"
        );
        stream.write_all(raw.as_bytes()).unwrap();

        let mut collected = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut chunk = [0u8; 1024];
        while Instant::now() < deadline {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) => panic!("read failed: {e}"),
            }
            let text = String::from_utf8_lossy(&collected);
            if text.contains("id: 3") {
                break;
            }
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.contains("200 OK"));
        assert!(text.contains("text/event-stream"));
        assert!(!text.contains("id: 1\n"), "event 1 must not replay: {text}");
        assert!(text.contains("id: 2\nevent: message\ndata: {\"n\":2}"));
        assert!(text.contains("id: 3\nevent: message\ndata: {\"n\":3}"));
        transport.stop();
    }

    #[test]
    fn reply_error_codes_drive_the_status_line() {
        let ok = serde_json::to_vec(&JsonRpcResponse::success(1, json!({}))).unwrap();
        assert_eq!(status_for_reply(&ok), 200);

        for (code, status) in [
            (codes::RATE_LIMITED, 429),
            (codes::AUTH_FAILED, 401),
            (codes::SESSION_GONE, 404),
            (codes::PARSE_ERROR, 400),
            (codes::INVALID_REQUEST, 400),
            (codes::INTERNAL_ERROR, 500),
            (codes::METHOD_NOT_FOUND, 200),
        ] {
            let reply = serde_json::to_vec(&JsonRpcResponse::error(1, code, "x")).unwrap();
            assert_eq!(status_for_reply(&reply), status, "code {code}");
        }
    }

    #[test]
    fn legacy_tools_endpoint_wraps_result() {
        let config = HttpServerConfig {
            enable_legacy: true,
            ..HttpServerConfig::default()
        };
        let (transport, addr) = start(config);
        let raw = "GET /tools HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        let (status, _, body) = send_request(addr, raw);
        assert_eq!(status, 200);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["result"]["ok"], true);
        transport.stop();
    }
}
