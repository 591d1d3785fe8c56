use crate::error::{json_error_response, ProxyErrorCode};
use crate::request::{DialInfo, PeerInfo};
use crate::transport::UwsgiTransport;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Default time to wait for the backend's response
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-server state shared by every request
struct RequestContext {
    transport: Arc<UwsgiTransport>,
    upstream: DialInfo,
    request_timeout: Duration,
}

/// HTTP front end that forwards every request to one uwsgi backend
pub struct ProxyServer {
    bind_addr: SocketAddr,
    transport: Arc<UwsgiTransport>,
    upstream: DialInfo,
    request_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        transport: Arc<UwsgiTransport>,
        upstream: DialInfo,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            transport,
            upstream,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_rx,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_on(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            upstream = %self.upstream.address,
            network = %self.upstream.network,
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let ctx = Arc::new(RequestContext {
            transport: self.transport,
            upstream: self.upstream,
            request_timeout: self.request_timeout,
        });
        let mut shutdown_rx = self.shutdown_rx;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    ctx: Arc<RequestContext>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<RequestContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }

    debug!(method = %req.method(), uri = %req.uri(), client = %client_addr, request_id, "Incoming request");

    req.extensions_mut().insert(PeerInfo::new(client_addr, false));
    req.extensions_mut().insert(ctx.upstream.clone());

    let result = tokio::time::timeout(ctx.request_timeout, ctx.transport.round_trip(req)).await;

    match result {
        Ok(Ok(response)) => {
            debug!(request_id, status = %response.status(), "Backend responded");
            Ok(response.map(|body| body.boxed()))
        }
        Ok(Err(e)) => {
            let code = e.code();
            let message = match code {
                ProxyErrorCode::InvalidRequest | ProxyErrorCode::RequestTooLarge => {
                    warn!(request_id, error = %e, "Rejected request");
                    e.to_string()
                }
                _ => {
                    // Log detailed error internally, return generic message externally
                    error!(
                        request_id,
                        upstream = %ctx.upstream.address,
                        error = %e,
                        "Failed to forward request to uwsgi backend"
                    );
                    "Failed to forward request to backend".to_string()
                }
            };
            Ok(json_error_response(code, message))
        }
        Err(_) => {
            warn!(
                request_id,
                upstream = %ctx.upstream.address,
                timeout_secs = ctx.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    ctx.request_timeout.as_secs()
                ),
            ))
        }
    }
}
