//! uwsgi-proxy - a reverse proxy transport for uWSGI application servers
//!
//! This library turns HTTP requests into uwsgi protocol packets:
//! - Derives CGI-style block vars from each request (`vars`)
//! - Frames them with the 4-byte uwsgi header (`packet`)
//! - Sends header, vars and the raw body over a fresh backend connection and
//!   parses the plain HTTP response the backend writes back (`transport`)
//! - Adds static `uwsgi_param` values from TOML/JSON or directive syntax
//!   (`params`, `directive`)
//!
//! The `proxy` module is a small HTTP front end that hosts the transport.

pub mod config;
pub mod directive;
pub mod error;
pub mod module;
pub mod packet;
pub mod params;
pub mod proxy;
pub mod request;
pub mod transport;
pub mod vars;

pub use error::TransportError;
pub use module::MODULE_ID;
pub use transport::UwsgiTransport;
