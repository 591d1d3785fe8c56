//! Error types for the transport and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

use crate::vars::BlockError;

/// Boxed error produced by a request body stream
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of a single uwsgi request/response cycle
#[derive(Debug, Error)]
pub enum TransportError {
    /// The backend could not be reached
    #[error("failed to dial {network} {address}: {source}")]
    Dial {
        network: String,
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Neither a dial hint nor a URI authority names the backend
    #[error("no upstream address: request has no authority and no dial info")]
    MissingAddress,

    /// The dial hint names a network this transport cannot open
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// The request could not be turned into a uwsgi packet
    #[error("failed to encode uwsgi packet: {0}")]
    Encode(#[from] BlockError),

    /// Writing the packet or reading the response failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request body stream yielded an error
    #[error("request body error: {0}")]
    Body(#[source] BoxError),

    /// The backend did not answer with a well-formed HTTP response
    #[error("invalid response from backend: {0}")]
    Response(#[from] hyper::Error),
}

impl TransportError {
    /// Map the failure onto the proxy error code reported to clients
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            TransportError::Dial { .. } | TransportError::Io(_) | TransportError::Body(_) => {
                ProxyErrorCode::ConnectionFailed
            }
            TransportError::Encode(BlockError::BlockTooLarge(_)) => ProxyErrorCode::RequestTooLarge,
            TransportError::Encode(_) => ProxyErrorCode::InvalidRequest,
            TransportError::Response(_) => ProxyErrorCode::BadUpstreamResponse,
            TransportError::MissingAddress | TransportError::UnsupportedNetwork(_) => {
                ProxyErrorCode::InternalError
            }
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Request metadata cannot be expressed as uwsgi vars
    InvalidRequest,
    /// Request vars do not fit in one uwsgi packet
    RequestTooLarge,
    /// Failed to connect to or talk to the backend
    ConnectionFailed,
    /// Backend answered with something that is not an HTTP response
    BadUpstreamResponse,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::RequestTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BadUpstreamResponse => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::InvalidRequest => "INVALID_REQUEST",
            ProxyErrorCode::RequestTooLarge => "REQUEST_TOO_LARGE",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::BadUpstreamResponse => "BAD_UPSTREAM_RESPONSE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
