//! Newline-delimited stdio transport.
//!
//! One JSON-RPC message per line on stdin, replies written as single lines
//! on stdout. This is the conventional MCP process transport: the parent
//! owns the process lifetime, so `stop` only raises the flag and the read
//! loop exits on EOF or the next line boundary.

use std::io::{BufReader, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, warn};

use loommcp_core::DEFAULT_MAX_MESSAGE_SIZE;

use crate::error::{TransportError, TransportResult};
use crate::frame::{ReadOutcome, read_line_frame};
use crate::traits::{ConnectionContext, ServerTransport, TransportCallbacks, TransportKind};

/// Stdio transport configuration.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    /// Line length limit.
    pub max_message_size: usize,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Server transport over stdin/stdout.
pub struct StdioServerTransport {
    config: StdioConfig,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StdioServerTransport {
    /// Create a transport; the read loop starts on [`ServerTransport::start`].
    pub fn new(config: StdioConfig) -> Self {
        Self {
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }
}

impl ServerTransport for StdioServerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn start(&self, callbacks: TransportCallbacks) -> TransportResult<()> {
        let mut handle_slot = self.handle.lock();
        if handle_slot.is_some() {
            return Err(TransportError::ConfigurationError(
                "transport already started".into(),
            ));
        }
        self.shutdown.store(false, Ordering::Release);
        let shutdown = Arc::clone(&self.shutdown);
        let max_message_size = self.config.max_message_size;

        let handle = std::thread::Builder::new()
            .name("loommcp-stdio".into())
            .spawn(move || {
                let stdout = Arc::new(Mutex::new(std::io::stdout()));
                let ctx = ConnectionContext::new(
                    TransportKind::Stdio,
                    None,
                    None,
                    Arc::new(move |payload: &[u8]| {
                        let mut out = stdout.lock();
                        out.write_all(payload)?;
                        out.write_all(b"\n")?;
                        out.flush()?;
                        Ok(())
                    }),
                );

                let stdin = std::io::stdin();
                let mut reader = BufReader::new(stdin.lock());
                loop {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    match read_line_frame(&mut reader, max_message_size, &shutdown) {
                        Ok(ReadOutcome::Frame(payload)) => {
                            (callbacks.on_message)(&payload, &ctx);
                        }
                        Ok(ReadOutcome::WouldBlock) => continue,
                        Ok(ReadOutcome::Closed) => {
                            debug!("stdin closed");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "stdio read failed");
                            callbacks.report(&e);
                            break;
                        }
                    }
                }
            })
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        *handle_slot = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        // Stdin reads cannot be interrupted portably; the loop exits on EOF
        // or the next line. Detach rather than join so stop stays bounded.
        self.shutdown.store(true, Ordering::Release);
        drop(self.handle.lock().take());
    }

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }
}
