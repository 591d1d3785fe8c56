//! Request metadata consumed by the uwsgi transport.
//!
//! The host attaches two extensions to every request it hands to the
//! transport:
//! - [`PeerInfo`]: the client address and whether the request arrived over TLS
//! - [`DialInfo`] (optional): the resolved backend to dial
//!
//! [`RequestDescriptor`] is the read-only view the variable encoder works from.

use hyper::header::HOST;
use hyper::http::request::Parts;
use hyper::{HeaderMap, Uri, Version};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Client side of the connection a request arrived on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Peer address as `host:port`, IPv6 hosts in brackets
    pub remote_addr: String,
    /// Whether the request was received over TLS
    pub tls: bool,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, tls: bool) -> Self {
        Self {
            remote_addr: addr.to_string(),
            tls,
        }
    }
}

/// Network kind of a dial target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Network {
    #[default]
    Tcp,
    /// Unix domain stream socket, address is a filesystem path
    Unix,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" | "tcp4" | "tcp6" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            other => Err(other.to_string()),
        }
    }
}

impl TryFrom<String> for Network {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .parse()
            .map_err(|name| format!("unsupported network: {}", name))
    }
}

/// Backend resolved by the host for one request, overriding the URI authority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialInfo {
    pub network: Network,
    pub address: String,
}

impl DialInfo {
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
        }
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(Network::Tcp, address)
    }
}

/// Everything the variable encoder needs to know about one request
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: String,
    /// Request target as received: path plus `?query` if any
    pub request_uri: String,
    /// Raw (still percent-encoded) path
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: String,
    /// Protocol version string, e.g. `HTTP/1.1`
    pub protocol: String,
    pub scheme: String,
    pub headers: HeaderMap,
    pub tls: bool,
    /// Host the client addressed, `name` or `name:port`
    pub host: String,
    pub remote_addr: String,
}

impl RequestDescriptor {
    /// Build a descriptor from request parts and the peer the host recorded
    pub fn from_parts(parts: &Parts, peer: &PeerInfo) -> Self {
        let uri = &parts.uri;

        let host = parts
            .headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(String::from)
            .or_else(|| uri.authority().map(|a| a.as_str().to_string()))
            .unwrap_or_default();

        let scheme = uri
            .scheme_str()
            .map(String::from)
            .unwrap_or_else(|| if peer.tls { "https" } else { "http" }.to_string());

        Self {
            method: parts.method.as_str().to_string(),
            request_uri: request_target(uri),
            path: uri.path().to_string(),
            query: uri.query().unwrap_or_default().to_string(),
            protocol: protocol_string(parts.version).to_string(),
            scheme,
            headers: parts.headers.clone(),
            tls: peer.tls,
            host,
            remote_addr: peer.remote_addr.clone(),
        }
    }
}

/// The request target in the form it was received: origin-form
/// (`/p?q`), absolute-form (`http://h/p?q`), authority-form or `*`
fn request_target(uri: &Uri) -> String {
    let target = uri.to_string();
    if target.is_empty() {
        "/".to_string()
    } else {
        target
    }
}

fn protocol_string(version: Version) -> &'static str {
    if version == Version::HTTP_09 {
        "HTTP/0.9"
    } else if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else if version == Version::HTTP_2 {
        "HTTP/2.0"
    } else if version == Version::HTTP_3 {
        "HTTP/3.0"
    } else {
        "HTTP/1.1"
    }
}
