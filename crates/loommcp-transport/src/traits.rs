//! The message/callback contract shared by every transport.
//!
//! A server transport owns its sockets and threads. On `start` it receives
//! a [`TransportCallbacks`]; for every decoded frame it invokes the message
//! callback with the raw payload and a [`ConnectionContext`] describing the
//! originating connection. The callback copies what it needs and returns
//! immediately; replies flow back through [`ConnectionContext::send`],
//! which may be called later from a worker thread.
//!
//! A client transport is simpler: framed `send` plus a blocking, bounded
//! `receive` driven by the client's single receive thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{TransportError, TransportResult};

/// Transport protocol discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Newline-delimited JSON over stdin/stdout.
    Stdio,
    /// Length-prefixed frames over TCP.
    Tcp,
    /// Plain HTTP request/response (legacy endpoints).
    Http,
    /// Streamable HTTP: single endpoint with POST/GET/DELETE plus SSE.
    HttpStreamable,
    /// One JSON-RPC message per WebSocket text frame.
    WebSocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stdio => "stdio",
            Self::Tcp => "tcp",
            Self::Http => "http",
            Self::HttpStreamable => "http-streamable",
            Self::WebSocket => "websocket",
        };
        f.write_str(name)
    }
}

type ReplyFn = Arc<dyn Fn(&[u8]) -> TransportResult<()> + Send + Sync>;

/// Per-connection state handed to the message callback.
///
/// The context is cheap to clone and remains valid for as long as the
/// connection lives; sends after the connection closed fail with
/// [`TransportError::Closed`].
#[derive(Clone)]
pub struct ConnectionContext {
    kind: TransportKind,
    peer_addr: Option<SocketAddr>,
    session_id: Option<String>,
    reply: ReplyFn,
}

impl ConnectionContext {
    /// Build a context. Transports call this; dispatch only reads it.
    pub fn new(
        kind: TransportKind,
        peer_addr: Option<SocketAddr>,
        session_id: Option<String>,
        reply: ReplyFn,
    ) -> Self {
        Self {
            kind,
            peer_addr,
            session_id,
            reply,
        }
    }

    /// Which transport this connection belongs to.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// The remote socket address, when the transport has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The client IP as a string, for rate-limit keying.
    pub fn client_ip(&self) -> Option<String> {
        self.peer_addr.map(|a| a.ip().to_string())
    }

    /// The HTTP session this message belongs to, when sessions are enabled.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Send one framed message back on this connection.
    ///
    /// # Errors
    ///
    /// Fails when the connection is gone or the frame cannot be written.
    pub fn send(&self, payload: &[u8]) -> TransportResult<()> {
        (self.reply)(payload)
    }

    /// Scatter-gather variant of [`ConnectionContext::send`]: the parts are
    /// concatenated into one frame.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionContext::send`].
    pub fn send_vectored(&self, parts: &[&[u8]]) -> TransportResult<()> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let mut joined = Vec::with_capacity(total);
        for part in parts {
            joined.extend_from_slice(part);
        }
        self.send(&joined)
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("kind", &self.kind)
            .field("peer_addr", &self.peer_addr)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Invoked once per decoded frame.
pub type MessageCallback = Arc<dyn Fn(&[u8], &ConnectionContext) + Send + Sync>;

/// Invoked on transport-level failures that have no connection to answer on.
pub type ErrorCallback = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// The callback pair handed to [`ServerTransport::start`].
#[derive(Clone)]
pub struct TransportCallbacks {
    /// Frame delivery.
    pub on_message: MessageCallback,
    /// Failure notification.
    pub on_error: Option<ErrorCallback>,
}

impl TransportCallbacks {
    /// Callbacks with just a message handler.
    pub fn new(on_message: MessageCallback) -> Self {
        Self {
            on_message,
            on_error: None,
        }
    }

    /// Attach an error callback.
    #[must_use]
    pub fn with_error_handler(mut self, on_error: ErrorCallback) -> Self {
        self.on_error = Some(on_error);
        self
    }

    pub(crate) fn report(&self, err: &TransportError) {
        if let Some(on_error) = &self.on_error {
            on_error(err);
        }
    }
}

impl std::fmt::Debug for TransportCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCallbacks")
            .field("has_error_handler", &self.on_error.is_some())
            .finish()
    }
}

/// A listening transport on the server side.
pub trait ServerTransport: Send + Sync {
    /// Protocol discriminator.
    fn kind(&self) -> TransportKind;

    /// Bind, spawn the accept loop, and begin delivering frames.
    ///
    /// # Errors
    ///
    /// Fails when the listener cannot bind or the transport already runs.
    fn start(&self, callbacks: TransportCallbacks) -> TransportResult<()>;

    /// Stop accepting, signal every connection, and join handler threads
    /// within a bounded wait.
    fn stop(&self);

    /// The bound local address, once started.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// A connected transport on the client side.
pub trait ClientTransport: Send + Sync {
    /// Protocol discriminator.
    fn kind(&self) -> TransportKind;

    /// Send one framed message.
    ///
    /// # Errors
    ///
    /// Fails when the connection is closed or the write fails.
    fn send(&self, payload: &[u8]) -> TransportResult<()>;

    /// Block for up to `timeout` waiting for one framed message.
    ///
    /// Returns `Ok(None)` when the timeout elapses with nothing read; the
    /// caller's receive loop uses short timeouts so a shutdown request
    /// takes effect within that bound.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the peer disconnects.
    fn receive(&self, timeout: Duration) -> TransportResult<Option<Vec<u8>>>;

    /// The remote socket address, when the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Close the connection; a blocked `receive` observes it within its
    /// timeout bound.
    fn shutdown(&self);
}
