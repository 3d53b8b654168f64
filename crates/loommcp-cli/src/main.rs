//! loommcp-serve: an MCP server with a demo `echo` tool and a
//! `demo://greeting` resource, listening on TCP (`PORT`), Streamable HTTP
//! (`PORT + 1`), and WebSocket (`PORT + 2`).
//!
//! Exit codes: 0 on a clean stop, 1 on configuration or initialization
//! failure, 2 on a runtime fatal such as a bind failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info};

use loommcp_core::{ContentItem, McpError, Resource, Tool, ToolParam};
use loommcp_runtime::cache::CacheConfig;
use loommcp_runtime::ratelimit::RateLimitRule;
use loommcp_server::{McpServer, ServerConfig, ToolOutput};
use loommcp_transport::{
    HttpServerConfig, HttpServerTransport, ServerTransport, SessionConfig, TcpServerConfig,
    TcpServerTransport, WsServerConfig, WsServerTransport,
};

const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "loommcp-serve", version, about = "Serve MCP over TCP, Streamable HTTP, and WebSocket")]
struct Args {
    /// TCP port to listen on; HTTP uses PORT+1 and WebSocket PORT+2.
    port: u16,

    /// Interface to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Close connections idle for this many milliseconds; 0 disables.
    #[arg(long, default_value_t = 0)]
    idle_timeout_ms: u64,

    /// Incoming message size limit in bytes.
    #[arg(long, default_value_t = 1024 * 1024)]
    max_message_size: usize,

    /// Require this API key on every message.
    #[arg(long)]
    api_key: Option<String>,

    /// Worker threads; 0 picks the CPU count.
    #[arg(long, default_value_t = 0)]
    thread_pool: usize,

    /// Per-worker task-queue depth.
    #[arg(long, default_value_t = 64)]
    task_queue: usize,

    /// Resource-cache capacity in entries.
    #[arg(long, default_value_t = 128)]
    cache_capacity: usize,

    /// Resource-cache TTL in seconds.
    #[arg(long, default_value_t = 300)]
    cache_ttl: u64,

    /// Per-IP rate limit as "REQUESTS/WINDOW_SECONDS", e.g. "100/60".
    #[arg(long)]
    rate_limit: Option<String>,

    /// Log level: debug, info, warn, or error.
    #[arg(long, env = "MCP_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr.
    #[arg(long, env = "MCP_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Track HTTP sessions and assign Mcp-Session-Id on initialize.
    #[arg(long)]
    enable_sessions: bool,

    /// Remove HTTP sessions idle for this many seconds.
    #[arg(long, default_value_t = 300)]
    session_timeout: u64,

    /// Comma-separated Origin globs; requests from other origins get 403.
    #[arg(long)]
    allowed_origins: Option<String>,

    /// Emit CORS headers and answer preflight requests.
    #[arg(long)]
    enable_cors: bool,

    /// Serve the legacy /call_tool, /tools, and /events endpoints.
    #[arg(long)]
    enable_legacy: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let _log_guard = match init_logging(&args) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e:#}");
            return ExitCode::from(1);
        }
    };

    let server = match build_server(&args) {
        Ok(server) => server,
        Err(e) => {
            error!("initialization failed: {e:#}");
            return ExitCode::from(1);
        }
    };

    match serve(&args, &server) {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("fatal: {e:#}");
            server.stop();
            ExitCode::from(2)
        }
    }
}

type LogGuard = Option<tracing_appender::non_blocking::WorkerGuard>;

fn init_logging(args: &Args) -> anyhow::Result<LogGuard> {
    let filter = tracing_subscriber::EnvFilter::try_new(&args.log_level)
        .with_context(|| format!("invalid log level '{}'", args.log_level))?;

    match &args.log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow!("log file path has no file name"))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

fn parse_rate_limit(spec: &str) -> anyhow::Result<RateLimitRule> {
    let (requests, window) = spec
        .split_once('/')
        .ok_or_else(|| anyhow!("rate limit must be REQUESTS/WINDOW_SECONDS, got '{spec}'"))?;
    let requests: u32 = requests.trim().parse().context("rate-limit request count")?;
    let window: u64 = window.trim().parse().context("rate-limit window seconds")?;
    if requests == 0 || window == 0 {
        return Err(anyhow!("rate limit components must be positive"));
    }
    Ok(RateLimitRule::per_ip(requests, Duration::from_secs(window)))
}

fn build_server(args: &Args) -> anyhow::Result<Arc<McpServer>> {
    let thread_count = if args.thread_pool == 0 {
        num_cpus::get()
    } else {
        args.thread_pool
    };
    let rate_rules = match &args.rate_limit {
        Some(spec) => vec![parse_rate_limit(spec)?],
        None => Vec::new(),
    };

    let config = ServerConfig {
        name: "loommcp-serve".into(),
        max_message_size: args.max_message_size,
        api_key: args.api_key.clone(),
        thread_count,
        task_queue_size: args.task_queue,
        cache: CacheConfig {
            capacity: args.cache_capacity,
            default_ttl: Duration::from_secs(args.cache_ttl),
        },
        rate_rules,
        ..ServerConfig::default()
    };

    let server = McpServer::builder()
        .config(config)
        .tool(
            Tool::new("echo")
                .with_description("Echo the provided text back as a text content item")
                .with_param(ToolParam::required("text", "string").with_description("Text to echo")),
            Arc::new(|_name, args: &str| {
                let value: serde_json::Value = serde_json::from_str(args).unwrap_or_default();
                let text = value
                    .get("text")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("");
                Ok(ToolOutput::ok(vec![ContentItem::text(text)]))
            }),
        )
        .resource(
            Resource::new("demo://greeting", "greeting")
                .with_mime_type("text/plain")
                .with_description("A small demo resource"),
        )
        .resource_handler(Arc::new(|uri: &str| match uri {
            "demo://greeting" => Ok(vec![ContentItem::text("Hello from loommcp")]),
            other => Err(McpError::resource_not_found(other)),
        }))
        .build()
        .context("failed to build server")?;

    Ok(Arc::new(server))
}

fn idle_timeout(args: &Args) -> Option<Duration> {
    (args.idle_timeout_ms > 0).then(|| Duration::from_millis(args.idle_timeout_ms))
}

fn serve(args: &Args, server: &Arc<McpServer>) -> anyhow::Result<()> {
    let tcp = Arc::new(TcpServerTransport::new(TcpServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port)
            .parse()
            .context("invalid host/port")?,
        max_message_size: args.max_message_size,
        idle_timeout: idle_timeout(args),
        ..TcpServerConfig::default()
    }));

    let http = Arc::new(HttpServerTransport::new(HttpServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port + 1)
            .parse()
            .context("invalid host/port")?,
        max_body_size: args.max_message_size,
        enable_sessions: args.enable_sessions,
        session: SessionConfig {
            session_timeout: Duration::from_secs(args.session_timeout),
            ..SessionConfig::default()
        },
        enable_cors: args.enable_cors,
        allowed_origins: args
            .allowed_origins
            .as_ref()
            .map(|list| list.split(',').map(|s| s.trim().to_owned()).collect()),
        enable_legacy: args.enable_legacy,
        idle_timeout: idle_timeout(args).or(HttpServerConfig::default().idle_timeout),
        ..HttpServerConfig::default()
    }));

    let ws = Arc::new(WsServerTransport::new(WsServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port + 2)
            .parse()
            .context("invalid host/port")?,
        max_message_size: args.max_message_size,
        idle_timeout: idle_timeout(args),
        ..WsServerConfig::default()
    }));

    server.attach(Arc::clone(&tcp) as Arc<dyn ServerTransport>);
    server.attach(Arc::clone(&http) as Arc<dyn ServerTransport>);
    server.attach(Arc::clone(&ws) as Arc<dyn ServerTransport>);

    server.start().context("failed to start transports")?;
    info!(
        tcp = %tcp.local_addr().map_or_else(|| "-".into(), |a| a.to_string()),
        http = %http.local_addr().map_or_else(|| "-".into(), |a| a.to_string()),
        ws = %ws.local_addr().map_or_else(|| "-".into(), |a| a.to_string()),
        "serving"
    );

    spawn_housekeeping(server, &http);

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("failed to install signal handler")?;
    if let Some(signal) = signals.forever().next() {
        info!(signal, "shutdown requested");
    }
    server.stop();
    Ok(())
}

fn spawn_housekeeping(server: &Arc<McpServer>, http: &Arc<HttpServerTransport>) {
    let server = Arc::clone(server);
    let sessions = http.sessions();
    std::thread::Builder::new()
        .name("loommcp-housekeeping".into())
        .spawn(move || {
            loop {
                std::thread::sleep(HOUSEKEEPING_PERIOD);
                if !server.is_running() {
                    break;
                }
                server.housekeeping();
                let removed = sessions.cleanup_expired();
                if removed > 0 {
                    info!(removed, "expired sessions removed");
                }
            }
        })
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_spec_parses() {
        let rule = parse_rate_limit("100/60").unwrap();
        assert_eq!(rule.limit, 100);
        assert_eq!(rule.window, Duration::from_secs(60));
    }

    #[test]
    fn bad_rate_limit_specs_fail() {
        assert!(parse_rate_limit("100").is_err());
        assert!(parse_rate_limit("0/60").is_err());
        assert!(parse_rate_limit("x/y").is_err());
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::parse_from(["loommcp-serve", "9000"]);
        assert_eq!(args.port, 9000);
        assert_eq!(args.host, "127.0.0.1");
        assert_eq!(args.max_message_size, 1024 * 1024);
        assert!(!args.enable_sessions);
    }

    #[test]
    fn args_parse_full_surface() {
        let args = Args::parse_from([
            "loommcp-serve",
            "9000",
            "--host",
            "0.0.0.0",
            "--idle-timeout-ms",
            "5000",
            "--api-key",
            "k",
            "--thread-pool",
            "8",
            "--task-queue",
            "32",
            "--cache-capacity",
            "64",
            "--cache-ttl",
            "60",
            "--rate-limit",
            "10/1",
            "--enable-sessions",
            "--session-timeout",
            "120",
            "--allowed-origins",
            "https://*.example.com,https://app.test",
            "--enable-cors",
            "--enable-legacy",
        ]);
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.idle_timeout_ms, 5000);
        assert!(args.enable_cors && args.enable_legacy && args.enable_sessions);
        assert_eq!(args.rate_limit.as_deref(), Some("10/1"));
    }
}
