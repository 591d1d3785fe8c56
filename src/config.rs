use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::directive;
use crate::request::{DialInfo, Network};
use crate::transport::UwsgiTransport;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// The uwsgi application server requests are forwarded to
    pub upstream: UpstreamConfig,

    /// Transport settings, e.g. `uwsgi_params`
    #[serde(default)]
    pub transport: UwsgiTransport,

    /// Optional file in directive syntax; its params are merged over
    /// `[transport]`. Relative paths resolve against the config file.
    pub directives: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Max time to wait for the backend to answer, in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// "tcp" (default) or "unix"
    #[serde(default)]
    pub network: Network,

    /// `host:port` for tcp, socket path for unix
    pub address: String,
}

impl UpstreamConfig {
    pub fn dial_info(&self) -> DialInfo {
        DialInfo::new(self.network, self.address.clone())
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        if let Some(directives) = config.directives.clone() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            config.apply_directives(&base.join(directives))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Merge params from a directive file over the configured transport
    pub fn apply_directives(&mut self, path: &Path) -> anyhow::Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read directives '{}': {}", path.display(), e)
        })?;
        let parsed = directive::parse_transport(&content)
            .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;

        self.transport.uwsgi_params.merge(parsed.uwsgi_params);
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.upstream.address.trim().is_empty() {
            errors.push("upstream.address must not be empty".to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be greater than 0".to_string());
        }
        if let Err(e) = self.transport.validate() {
            errors.push(e);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
