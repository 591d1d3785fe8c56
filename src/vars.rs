//! uwsgi block vars: the CGI-style name/value pairs that make up the body of
//! a modifier 0 packet.
//!
//! Every pair is serialized as
//! ```text
//! ┌──────────┬────────────┬───────────┬─────────────┐
//! │ name len │ name bytes │ value len │ value bytes │
//! │ u16 LE   │            │ u16 LE    │             │
//! └──────────┴────────────┴───────────┴─────────────┘
//! ```
//! and pairs are concatenated with no separator. The whole block is bounded by
//! the 16-bit datasize of the packet header.

use hyper::body::Bytes;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::params::UwsgiParams;
use crate::request::RequestDescriptor;

/// Largest block a single uwsgi packet can carry
pub const MAX_BLOCK_SIZE: usize = u16::MAX as usize;

/// Length prefix size of each name and value
const LEN_PREFIX: usize = 2;

/// Errors building, encoding or decoding a block
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    /// Peer address has no `:` separating host and port
    #[error("malformed peer address {0:?}: missing port")]
    MalformedPeerAddress(String),

    /// Serialized block does not fit the 16-bit packet size
    #[error("uwsgi block of {0} bytes exceeds the 65535 byte packet limit")]
    BlockTooLarge(usize),

    /// Serialized block ends in the middle of an entry
    #[error("truncated uwsgi block at offset {0}")]
    Truncated(usize),

    /// A decoded var name is not valid UTF-8
    #[error("invalid var name at offset {0}")]
    InvalidName(usize),
}

/// Name-keyed set of uwsgi vars; each name occurs exactly once
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockVars {
    vars: BTreeMap<String, Vec<u8>>,
}

impl BlockVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the vars for a request, then apply static params over them.
    ///
    /// Static params replace derived vars of the same name.
    pub fn build(desc: &RequestDescriptor, params: &UwsgiParams) -> Result<Self, BlockError> {
        Ok(Self::from_request(desc)?.with_params(params))
    }

    /// Derive the request vars, without static params
    pub fn from_request(desc: &RequestDescriptor) -> Result<Self, BlockError> {
        let (remote_host, remote_port) = split_peer_addr(&desc.remote_addr)?;
        let (server_name, server_port) = server_name_port(&desc.host, desc.tls);

        let mut vars = Self::new();
        vars.insert("QUERY_STRING", desc.query.as_str());
        vars.insert("REQUEST_METHOD", desc.method.as_str());
        vars.insert("CONTENT_TYPE", first_header(desc, CONTENT_TYPE.as_str()));
        vars.insert("CONTENT_LENGTH", first_header(desc, CONTENT_LENGTH.as_str()));

        vars.insert("REQUEST_URI", desc.request_uri.as_str());
        vars.insert("PATH_INFO", decode_path(&desc.path));
        vars.insert("SERVER_PROTOCOL", desc.protocol.as_str());
        vars.insert("REQUEST_SCHEME", desc.scheme.as_str());
        vars.insert("HTTPS", if desc.tls { "on" } else { "" });

        vars.insert("REMOTE_ADDR", remote_host);
        vars.insert("REMOTE_PORT", remote_port);
        vars.insert("SERVER_PORT", server_port);
        vars.insert("SERVER_NAME", server_name);

        vars.insert("HTTP_HOST", desc.host.as_str());

        for name in desc.headers.keys() {
            // Host is carried by the request's host string
            if *name == HOST {
                continue;
            }
            let mut joined = Vec::new();
            for (i, value) in desc.headers.get_all(name).iter().enumerate() {
                if i > 0 {
                    joined.extend_from_slice(b", ");
                }
                joined.extend_from_slice(value.as_bytes());
            }
            vars.insert(header_var_name(name.as_str()), joined);
        }

        Ok(vars)
    }

    /// Apply static params, replacing any var with the same name
    pub fn with_params(mut self, params: &UwsgiParams) -> Self {
        for (name, value) in params.iter() {
            self.insert(name, value);
        }
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.vars.get(name).map(Vec::as_slice)
    }

    /// Value of a var as UTF-8, if present and valid
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Size of the serialized block in bytes
    pub fn encoded_len(&self) -> usize {
        self.vars
            .iter()
            .map(|(k, v)| 2 * LEN_PREFIX + k.len() + v.len())
            .sum()
    }

    /// Serialize the block; fails rather than truncating if it exceeds
    /// [`MAX_BLOCK_SIZE`]
    pub fn encode(&self) -> Result<Bytes, BlockError> {
        let size = self.encoded_len();
        if size > MAX_BLOCK_SIZE {
            return Err(BlockError::BlockTooLarge(size));
        }

        let mut buf = Vec::with_capacity(size);
        for (name, value) in &self.vars {
            write_block_var(&mut buf, name.as_bytes());
            write_block_var(&mut buf, value);
        }
        Ok(Bytes::from(buf))
    }

    /// Parse a serialized block. A name repeated in the block keeps its last
    /// value.
    pub fn decode(mut buf: &[u8]) -> Result<Self, BlockError> {
        let total = buf.len();
        let mut vars = Self::new();

        while !buf.is_empty() {
            let offset = total - buf.len();
            let (name, rest) = read_block_var(buf, offset)?;
            let name = std::str::from_utf8(name).map_err(|_| BlockError::InvalidName(offset))?;
            let (value, rest) = read_block_var(rest, total - rest.len())?;
            vars.insert(name, value);
            buf = rest;
        }

        Ok(vars)
    }
}

fn write_block_var(buf: &mut Vec<u8>, bytes: &[u8]) {
    // encode() bounds the whole block, so every entry fits in u16
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn read_block_var(buf: &[u8], offset: usize) -> Result<(&[u8], &[u8]), BlockError> {
    if buf.len() < LEN_PREFIX {
        return Err(BlockError::Truncated(offset));
    }
    let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    let rest = &buf[LEN_PREFIX..];
    if rest.len() < len {
        return Err(BlockError::Truncated(offset));
    }
    Ok(rest.split_at(len))
}

fn first_header<'a>(desc: &'a RequestDescriptor, name: &str) -> &'a [u8] {
    desc.headers
        .get(name)
        .map(|v| v.as_bytes())
        .unwrap_or_default()
}

/// `X-Custom-Id` becomes `HTTP_X_CUSTOM_ID`
pub fn header_var_name(header: &str) -> String {
    let mut name = String::with_capacity(5 + header.len());
    name.push_str("HTTP_");
    for c in header.chars() {
        match c {
            '-' => name.push('_'),
            c => name.push(c.to_ascii_uppercase()),
        }
    }
    name
}

/// Split a peer address at its last `:`, stripping the brackets of an IPv6
/// literal.
pub fn split_peer_addr(addr: &str) -> Result<(&str, &str), BlockError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| BlockError::MalformedPeerAddress(addr.to_string()))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    Ok((host, port))
}

/// Split `host:port` or `[v6]:port`. Returns `None` when no port is present
/// or the string is ambiguous (a bare IPv6 literal).
pub fn split_host_port(hostport: &str) -> Option<(&str, &str)> {
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = after.strip_prefix(':')?;
        if port.contains([':', '[', ']']) {
            return None;
        }
        return Some((host, port));
    }

    let (host, port) = hostport.rsplit_once(':')?;
    if host.contains([':', '[', ']']) {
        return None;
    }
    Some((host, port))
}

/// `SERVER_NAME` and `SERVER_PORT` for a host string, defaulting the port to
/// 443 or 80 depending on transport security
pub fn server_name_port(host: &str, tls: bool) -> (&str, &str) {
    let default_port = if tls { "443" } else { "80" };
    match split_host_port(host) {
        Some((name, "")) => (name, default_port),
        Some((name, port)) => (name, port),
        None => (host, default_port),
    }
}

fn decode_path(path: &str) -> Vec<u8> {
    match urlencoding::decode(path) {
        Ok(decoded) => decoded.into_owned().into_bytes(),
        Err(_) => urlencoding::decode_binary(path.as_bytes()).into_owned(),
    }
}
