//! End-to-end client/server tests over real sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use loommcp_client::{Client, ClientConfig};
use loommcp_core::{ContentItem, ErrorKind, Resource, Tool, ToolParam};
use loommcp_server::{McpServer, ServerConfig, ToolOutput};
use loommcp_transport::{
    ServerTransport, TcpServerConfig, TcpServerTransport, WsServerConfig, WsServerTransport,
};

fn echo_tool() -> (Tool, loommcp_server::ToolHandler) {
    (
        Tool::new("echo")
            .with_description("Echo text back")
            .with_param(ToolParam::required("text", "string")),
        Arc::new(|_name, args: &str| {
            let value: Value = serde_json::from_str(args).unwrap_or_default();
            let text = value.get("text").and_then(Value::as_str).unwrap_or("");
            Ok(ToolOutput::ok(vec![ContentItem::text(text)]))
        }),
    )
}

fn tcp_transport() -> Arc<TcpServerTransport> {
    Arc::new(TcpServerTransport::new(TcpServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..TcpServerConfig::default()
    }))
}

#[test]
fn initialize_list_tools_call_tool_over_tcp() {
    let (tool, handler) = echo_tool();
    let server = McpServer::builder().name("e2e").tool(tool, handler).build().unwrap();
    let transport = tcp_transport();
    server.attach(Arc::clone(&transport) as Arc<dyn ServerTransport>);
    server.start().unwrap();
    let addr = transport.local_addr().unwrap();

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();

    let init = client.initialize().unwrap();
    assert_eq!(init["serverInfo"]["name"], "e2e");

    let tools = client.list_tools().unwrap();
    assert_eq!(tools[0]["name"], "echo");
    assert_eq!(tools[0]["inputSchema"]["type"], "object");

    let result = client.call_tool("echo", json!({"text": "hi"})).unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content, vec![ContentItem::text("hi")]);

    client.disconnect();
    server.stop();
}

#[test]
fn websocket_round_trip() {
    let (tool, handler) = echo_tool();
    let server = McpServer::builder().tool(tool, handler).build().unwrap();
    let transport = Arc::new(WsServerTransport::new(WsServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..WsServerConfig::default()
    }));
    server.attach(Arc::clone(&transport) as Arc<dyn ServerTransport>);
    server.start().unwrap();
    let addr = transport.local_addr().unwrap();

    let client = Client::connect_ws(addr, "/ws", ClientConfig::default()).unwrap();
    let result = client.call_tool("echo", json!({"text": "over ws"})).unwrap();
    assert_eq!(result.content[0].as_text(), Some("over ws"));

    client.disconnect();
    server.stop();
}

#[test]
fn resource_reads_hit_cache_after_first_fetch() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    let server = McpServer::builder()
        .resource(Resource::new("test://r", "r").with_mime_type("text/plain"))
        .resource_handler(Arc::new(move |uri: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ContentItem::text(format!("body of {uri}"))])
        }))
        .build()
        .unwrap();
    let transport = tcp_transport();
    server.attach(Arc::clone(&transport) as Arc<dyn ServerTransport>);
    server.start().unwrap();
    let addr = transport.local_addr().unwrap();

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let first = client.read_resource("test://r").unwrap();
    assert_eq!(first[0]["text"], "body of test://r");
    let second = client.read_resource("test://r").unwrap();
    assert_eq!(second[0]["text"], "body of test://r");
    assert_eq!(invocations.load(Ordering::SeqCst), 1, "second read must be served by the cache");

    client.disconnect();
    server.stop();
}

#[test]
fn concurrent_requests_multiplex_over_one_connection() {
    let (tool, handler) = echo_tool();
    let server = McpServer::builder().tool(tool, handler).build().unwrap();
    let transport = tcp_transport();
    server.attach(Arc::clone(&transport) as Arc<dyn ServerTransport>);
    server.start().unwrap();
    let addr = transport.local_addr().unwrap();

    let client = Arc::new(Client::connect_tcp(addr, ClientConfig::default()).unwrap());
    let mut handles = Vec::new();
    for n in 0..8 {
        let client = Arc::clone(&client);
        handles.push(std::thread::spawn(move || {
            let text = format!("msg-{n}");
            let result = client.call_tool("echo", json!({"text": text})).unwrap();
            assert_eq!(result.content[0].as_text(), Some(format!("msg-{n}").as_str()));
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(client.pending_requests(), 0);

    client.disconnect();
    server.stop();
}

#[test]
fn graceful_stop_lets_slow_handlers_finish() {
    let server = Arc::new(
        McpServer::builder()
            .resource_handler(Arc::new(|_uri: &str| {
                std::thread::sleep(Duration::from_millis(800));
                Ok(vec![ContentItem::text("slow but done")])
            }))
            .build()
            .unwrap(),
    );
    let transport = tcp_transport();
    server.attach(Arc::clone(&transport) as Arc<dyn ServerTransport>);
    server.start().unwrap();
    let addr = transport.local_addr().unwrap();

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let request = {
        let stopper = Arc::clone(&server);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            stopper.stop();
        });
        client.read_resource("test://slow")
    };

    // The in-flight request completed and its response was delivered
    // before the connections closed.
    let contents = request.unwrap();
    assert_eq!(contents[0]["text"], "slow but done");
    assert_eq!(client.pending_requests(), 0);
    client.disconnect();
}

#[test]
fn transport_death_fails_all_pending_requests() {
    let server = McpServer::builder()
        .tool(
            Tool::new("sleepy"),
            Arc::new(|_, _| {
                std::thread::sleep(Duration::from_secs(3));
                Ok(ToolOutput::ok(vec![ContentItem::text("too late")]))
            }),
        )
        .build()
        .unwrap();
    let transport = tcp_transport();
    server.attach(Arc::clone(&transport) as Arc<dyn ServerTransport>);
    server.start().unwrap();
    let addr = transport.local_addr().unwrap();

    let client = Arc::new(Client::connect_tcp(addr, ClientConfig::default()).unwrap());
    let mut handles = Vec::new();
    for _ in 0..3 {
        let client = Arc::clone(&client);
        handles.push(std::thread::spawn(move || {
            client.call_tool("sleepy", json!({}))
        }));
    }
    std::thread::sleep(Duration::from_millis(300));

    // Abrupt transport death, as if the process were killed: no drain.
    transport.stop();

    let observed_at = Instant::now();
    for handle in handles {
        let outcome = handle.join().unwrap();
        let err = outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionClosed);
    }
    assert!(observed_at.elapsed() < Duration::from_secs(2));
    assert!(!client.is_connected());
    assert_eq!(client.pending_requests(), 0);
    server.stop();
}

#[test]
fn request_timeout_is_reported() {
    let server = McpServer::builder()
        .tool(
            Tool::new("molasses"),
            Arc::new(|_, _| {
                std::thread::sleep(Duration::from_millis(800));
                Ok(ToolOutput::ok(Vec::new()))
            }),
        )
        .config(ServerConfig {
            graceful_timeout: Duration::from_millis(100),
            ..ServerConfig::default()
        })
        .build()
        .unwrap();
    let transport = tcp_transport();
    server.attach(Arc::clone(&transport) as Arc<dyn ServerTransport>);
    server.start().unwrap();
    let addr = transport.local_addr().unwrap();

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let err = client
        .request_with_timeout("call_tool", Some(json!({"name": "molasses"})), Duration::from_millis(100))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    client.disconnect();
    server.stop();
}

#[test]
fn unknown_method_error_reaches_the_caller() {
    let server = McpServer::builder().build().unwrap();
    let transport = tcp_transport();
    server.attach(Arc::clone(&transport) as Arc<dyn ServerTransport>);
    server.start().unwrap();
    let addr = transport.local_addr().unwrap();

    let client = Client::connect_tcp(addr, ClientConfig::default()).unwrap();
    let err = client.request("does_not_exist", None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::MethodNotFound);

    client.disconnect();
    server.stop();
}
