//! Integration tests for uwsgi-proxy

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use uwsgi_proxy::config::Config;
use uwsgi_proxy::module::{Registry, MODULE_ID};
use uwsgi_proxy::packet::{PacketHeader, HEADER_SIZE};
use uwsgi_proxy::params::UwsgiParams;
use uwsgi_proxy::proxy::ProxyServer;
use uwsgi_proxy::request::DialInfo;
use uwsgi_proxy::transport::UwsgiTransport;
use uwsgi_proxy::vars::BlockVars;

/// A request as seen by the fake uwsgi backend
#[derive(Debug)]
struct BackendRequest {
    vars: BlockVars,
    body: Vec<u8>,
}

/// Start a fake uwsgi server that answers every request with `response`
/// after `delay`, reporting what it received on the returned channel
async fn start_uwsgi_backend(
    response: &'static str,
    delay: Duration,
) -> (SocketAddr, mpsc::UnboundedReceiver<BackendRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut header = [0u8; HEADER_SIZE];
                if stream.read_exact(&mut header).await.is_err() {
                    return;
                }
                let header = PacketHeader::decode(&header);

                let mut block = vec![0u8; header.datasize as usize];
                stream.read_exact(&mut block).await.unwrap();
                let vars = BlockVars::decode(&block).unwrap();

                let len: usize = vars
                    .get_str("CONTENT_LENGTH")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let mut body = vec![0u8; len];
                stream.read_exact(&mut body).await.unwrap();

                let _ = tx.send(BackendRequest { vars, body });

                tokio::time::sleep(delay).await;
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, rx)
}

/// Start the proxy in front of `upstream` and return its address
async fn start_proxy(
    upstream: SocketAddr,
    params: UwsgiParams,
    timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = ProxyServer::new(
        addr,
        Arc::new(UwsgiTransport::new(params)),
        DialInfo::tcp(upstream.to_string()),
        shutdown_rx,
    )
    .with_request_timeout(timeout);

    tokio::spawn(async move {
        server.run_on(listener).await.unwrap();
    });

    addr
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn http_request(addr: SocketAddr, request: String) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn http_get(addr: SocketAddr, path: &str, host: &str) -> String {
    http_request(
        addr,
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        ),
    )
    .await
}

// ============================================================================
// Proxying
// ============================================================================

#[tokio::test]
async fn test_proxy_forwards_get() {
    let (upstream, mut received) = start_uwsgi_backend(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok",
        Duration::ZERO,
    )
    .await;

    let mut params = UwsgiParams::new();
    params.insert("SCRIPT_NAME", "/app");

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = start_proxy(upstream, params, Duration::from_secs(5), shutdown_rx).await;

    let response = http_get(proxy, "/status?x=1", "svc.local").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert!(response.ends_with("\r\n\r\nok"), "{}", response);

    let request = received.recv().await.unwrap();
    let vars = &request.vars;
    assert_eq!(vars.get_str("REQUEST_METHOD"), Some("GET"));
    assert_eq!(vars.get_str("REQUEST_URI"), Some("/status?x=1"));
    assert_eq!(vars.get_str("QUERY_STRING"), Some("x=1"));
    assert_eq!(vars.get_str("SERVER_NAME"), Some("svc.local"));
    assert_eq!(vars.get_str("SERVER_PORT"), Some("80"));
    assert_eq!(vars.get_str("HTTPS"), Some(""));
    assert_eq!(vars.get_str("SCRIPT_NAME"), Some("/app"));
    assert_eq!(vars.get_str("REMOTE_ADDR"), Some("127.0.0.1"));
    assert_eq!(vars.get_str("HTTP_CONNECTION"), Some("close"));
    assert!(vars.get_str("REMOTE_PORT").unwrap().parse::<u16>().is_ok());
    assert_eq!(
        vars.get_str("HTTP_X_REQUEST_ID").map(str::len),
        Some(36),
        "proxy should assign a UUID request id"
    );
    assert!(request.body.is_empty());
}

#[tokio::test]
async fn test_proxy_forwards_post_body() {
    let (upstream, mut received) = start_uwsgi_backend(
        "HTTP/1.1 201 Created\r\nContent-Length: 7\r\n\r\ncreated",
        Duration::ZERO,
    )
    .await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = start_proxy(upstream, UwsgiParams::new(), Duration::from_secs(5), shutdown_rx).await;

    let body = "name=widget&size=3";
    let response = http_request(
        proxy,
        format!(
            "POST /items HTTP/1.1\r\nHost: shop.local:8443\r\nX-Request-Id: req-123\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 201 Created"), "{}", response);
    assert!(response.ends_with("created"));

    let request = received.recv().await.unwrap();
    assert_eq!(request.body, body.as_bytes());
    assert_eq!(request.vars.get_str("REQUEST_METHOD"), Some("POST"));
    assert_eq!(
        request.vars.get_str("CONTENT_TYPE"),
        Some("application/x-www-form-urlencoded")
    );
    assert_eq!(request.vars.get_str("SERVER_NAME"), Some("shop.local"));
    assert_eq!(request.vars.get_str("SERVER_PORT"), Some("8443"));
    assert_eq!(request.vars.get_str("HTTP_HOST"), Some("shop.local:8443"));
    assert_eq!(request.vars.get_str("HTTP_X_REQUEST_ID"), Some("req-123"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_proxy_serves_repeated_requests_on_multi_thread_runtime() {
    let (upstream, _received) = start_uwsgi_backend(
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        Duration::ZERO,
    )
    .await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = start_proxy(upstream, UwsgiParams::new(), Duration::from_secs(5), shutdown_rx).await;

    for round in 0..200 {
        let response = http_get(proxy, "/", "svc.local").await;
        assert!(
            response.starts_with("HTTP/1.1 200 OK") && response.ends_with("ok"),
            "round {}: {}",
            round,
            response
        );
    }
}

#[tokio::test]
async fn test_proxy_relays_chunked_response() {
    let (upstream, _received) = start_uwsgi_backend(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwsgi\r\n0\r\n\r\n",
        Duration::ZERO,
    )
    .await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = start_proxy(upstream, UwsgiParams::new(), Duration::from_secs(5), shutdown_rx).await;

    let response = http_get(proxy, "/", "svc.local").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert!(response.contains("wsgi"), "{}", response);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_backend_down_returns_502() {
    let upstream = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = start_proxy(upstream, UwsgiParams::new(), Duration::from_secs(5), shutdown_rx).await;

    let response = http_get(proxy, "/", "svc.local").await;
    assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: connection_failed"));
    assert!(response.contains("\"code\":\"CONNECTION_FAILED\""));
}

#[tokio::test]
async fn test_invalid_backend_response_returns_502() {
    let (upstream, _received) =
        start_uwsgi_backend("garbage that is not http\r\n\r\n", Duration::ZERO).await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = start_proxy(upstream, UwsgiParams::new(), Duration::from_secs(5), shutdown_rx).await;

    let response = http_get(proxy, "/", "svc.local").await;
    assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
    assert!(response.contains("BAD_UPSTREAM_RESPONSE"));
}

#[tokio::test]
async fn test_slow_backend_returns_504() {
    let (upstream, _received) = start_uwsgi_backend(
        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        Duration::from_secs(3),
    )
    .await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = start_proxy(upstream, UwsgiParams::new(), Duration::from_secs(1), shutdown_rx).await;

    let response = http_get(proxy, "/slow", "svc.local").await;
    assert!(response.starts_with("HTTP/1.1 504"), "{}", response);
    assert!(response.contains("REQUEST_TIMEOUT"));
}

#[tokio::test]
async fn test_oversized_vars_return_431() {
    let (upstream, _received) =
        start_uwsgi_backend("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", Duration::ZERO).await;

    // Three 30000-byte params push the block over 65535 bytes
    let mut params = UwsgiParams::new();
    for name in ["BIG_A", "BIG_B", "BIG_C"] {
        params.insert(name, "x".repeat(30_000));
    }

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = start_proxy(upstream, params, Duration::from_secs(5), shutdown_rx).await;

    let response = http_get(proxy, "/", "svc.local").await;
    assert!(response.starts_with("HTTP/1.1 431"), "{}", response);
    assert!(response.contains("REQUEST_TOO_LARGE"));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_to_transport() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("uwsgi.conf"),
        "transport uwsgi {\n    uwsgi_param UWSGI_SCRIPT app:application\n}\n",
    )
    .unwrap();
    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        r#"
directives = "uwsgi.conf"

[server]
port = 8081

[upstream]
address = "127.0.0.1:3031"

[transport.uwsgi_params]
SCRIPT_NAME = "/app"
"#,
    )
    .unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.server.port, 8081);
    assert_eq!(config.upstream.dial_info(), DialInfo::tcp("127.0.0.1:3031"));

    let params = config.transport.params();
    assert_eq!(params.get("UWSGI_SCRIPT"), Some("app:application"));
    assert_eq!(params.get("SCRIPT_NAME"), Some("/app"));
}

#[test]
fn test_registry_builds_transport_from_directives() {
    let mut registry = Registry::new();
    registry.register(UwsgiTransport::module_info()).unwrap();

    let module = registry.get(MODULE_ID).unwrap();
    let err = (module.parse_directives)("uwsgi {\n    bogus_param A B\n}").unwrap_err();
    assert!(err.to_string().contains("bogus_param"));

    let transport = (module.parse_directives)("uwsgi {\n    uwsgi_param A B\n}").unwrap();
    assert!((module.validate)(&transport).is_ok());
}

#[tokio::test]
async fn test_proxy_stops_on_shutdown() {
    let (upstream, _received) =
        start_uwsgi_backend("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", Duration::ZERO).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(
        listener.local_addr().unwrap(),
        Arc::new(UwsgiTransport::default()),
        DialInfo::tcp(upstream.to_string()),
        shutdown_rx,
    );
    let handle = tokio::spawn(server.run_on(listener));

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("server should stop after shutdown signal")
        .unwrap();
    assert!(result.is_ok());
}
