//! uwsgi transport: one request, one backend connection, one response.
//!
//! # Data Flow
//! ```text
//! Request<B> + PeerInfo (+ DialInfo)
//!     → dial backend (DialInfo, else TCP to the URI authority)
//!     → vars.rs (derive block vars, apply static params, encode)
//!     → packet.rs (4-byte header)
//!     → write header, block, then the raw body
//!     → parse the HTTP response the backend writes on the same connection
//! ```
//!
//! The response side has no uwsgi framing: the backend answers with a plain
//! HTTP/1.x message. It is parsed with hyper's HTTP/1 client running over
//! [`ResponseOnly`], which swallows the placeholder request hyper writes, so
//! content-length, chunked and close-delimited bodies all work.
//!
//! No timeouts, retries or pooling happen here. Callers wrap `round_trip` in
//! their own deadline; dropping the future drops the connection.

use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Incoming};
use hyper::client::conn::http1;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{BoxError, TransportError};
use crate::packet::PacketHeader;
use crate::params::UwsgiParams;
use crate::request::{DialInfo, Network, PeerInfo, RequestDescriptor};
use crate::vars::BlockVars;

/// A byte stream to a backend
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Connection for T {}

pub type BoxConnection = Box<dyn Connection>;

/// Proxies HTTP requests to a uwsgi application server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UwsgiTransport {
    /// Static uwsgi params sent with every request, e.g. `UWSGI_SCRIPT`
    #[serde(default, skip_serializing_if = "UwsgiParams::is_empty")]
    pub uwsgi_params: UwsgiParams,
}

impl UwsgiTransport {
    pub fn new(uwsgi_params: UwsgiParams) -> Self {
        Self { uwsgi_params }
    }

    /// Bind a transport from its JSON form: `{"uwsgi_params": {...}}`
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn params(&self) -> &UwsgiParams {
        &self.uwsgi_params
    }

    pub fn validate(&self) -> Result<(), String> {
        self.uwsgi_params.validate()
    }

    /// Send one request to the backend and parse its response.
    ///
    /// The request should carry a [`PeerInfo`] extension; a missing one is
    /// treated as an empty peer address and rejected. A [`DialInfo`]
    /// extension overrides the backend address taken from the URI authority.
    ///
    /// The returned body streams from the backend connection, which stays
    /// open until the body is consumed or dropped.
    pub async fn round_trip<B>(&self, req: Request<B>) -> Result<Response<Incoming>, TransportError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();

        let dial_info = match parts.extensions.get::<DialInfo>() {
            Some(info) => info.clone(),
            None => {
                let authority = parts
                    .uri
                    .authority()
                    .ok_or(TransportError::MissingAddress)?;
                DialInfo::tcp(authority.as_str())
            }
        };
        let peer = parts
            .extensions
            .get::<PeerInfo>()
            .cloned()
            .unwrap_or_default();

        let mut conn = dial(&dial_info).await?;
        debug!(network = %dial_info.network, address = %dial_info.address, "Connected to uwsgi backend");

        let descriptor = RequestDescriptor::from_parts(&parts, &peer);
        let block = BlockVars::build(&descriptor, &self.uwsgi_params)?.encode()?;
        let header = PacketHeader::for_block(block.len())?;

        conn.write_all(&header.encode()).await?;
        conn.write_all(&block).await?;
        let body_bytes = copy_body(body, &mut conn).await?;
        conn.flush().await?;

        debug!(
            method = %parts.method,
            uri = %parts.uri,
            block_size = block.len(),
            body_bytes,
            "uwsgi request written"
        );

        let response = read_response(conn, parts.method).await?;
        debug!(status = %response.status(), "uwsgi response received");
        Ok(response)
    }
}

/// Open a connection to a backend
pub async fn dial(info: &DialInfo) -> Result<BoxConnection, TransportError> {
    let result: io::Result<BoxConnection> = match info.network {
        Network::Tcp => TcpStream::connect(&info.address).await.map(|stream| {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(address = %info.address, error = %e, "Failed to set TCP_NODELAY");
            }
            Box::new(stream) as BoxConnection
        }),
        #[cfg(unix)]
        Network::Unix => tokio::net::UnixStream::connect(&info.address)
            .await
            .map(|stream| Box::new(stream) as BoxConnection),
        #[cfg(not(unix))]
        Network::Unix => return Err(TransportError::UnsupportedNetwork(info.network.to_string())),
    };

    result.map_err(|source| TransportError::Dial {
        network: info.network.to_string(),
        address: info.address.clone(),
        source,
    })
}

/// Copy the request body to the connection verbatim. The body is consumed
/// and dropped on every path out of this function.
async fn copy_body<B>(body: B, conn: &mut BoxConnection) -> Result<u64, TransportError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let mut body = std::pin::pin!(body);
    let mut written = 0u64;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| TransportError::Body(e.into()))?;
        // trailers have no uwsgi representation
        if let Ok(data) = frame.into_data() {
            conn.write_all(&data).await?;
            written += data.len() as u64;
        }
    }

    Ok(written)
}

async fn read_response(
    conn: BoxConnection,
    method: Method,
) -> Result<Response<Incoming>, TransportError> {
    let io = TokioIo::new(ResponseOnly::new(conn));
    let (mut sender, connection) = http1::handshake(io).await?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "uwsgi connection closed with error");
        }
    });

    // Only the method matters: it tells the parser whether a body follows
    let placeholder = Request::builder()
        .method(method)
        .uri("/")
        .body(Empty::<Bytes>::new())
        .expect("valid placeholder request");

    Ok(sender.send_request(placeholder).await?)
}

/// Read side of a backend connection; writes are accepted and discarded.
///
/// The uwsgi packet is written before the HTTP parser takes over, so the
/// request hyper serializes must never reach the backend.
///
/// Reads stay pending until hyper has written its placeholder request:
/// hyper rejects bytes that arrive on a connection it still considers idle,
/// and the backend may answer before the dispatcher has sent anything.
struct ResponseOnly<S> {
    inner: S,
    request_sent: bool,
    read_waker: Option<Waker>,
}

impl<S> ResponseOnly<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            request_sent: false,
            read_waker: None,
        }
    }

    fn mark_request_sent(&mut self) {
        self.request_sent = true;
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ResponseOnly<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.request_sent {
            self.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ResponseOnly<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // hyper only writes once the request head is encoded, so from here
        // on it expects a response
        if !buf.is_empty() && !self.request_sent {
            self.mark_request_sent();
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
