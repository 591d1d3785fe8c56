//! Module identity and explicit registration.
//!
//! Hosts pick a transport by its module ID. Nothing registers itself at load
//! time: the host builds a [`Registry`] at startup and registers each module's
//! [`ModuleInfo`], which carries the constructor and config hooks.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::directive::{self, DirectiveError};
use crate::transport::UwsgiTransport;

/// Stable identifier of the uwsgi reverse proxy transport
pub const MODULE_ID: &str = "http.reverse_proxy.transport.uwsgi";

/// Short name used in directive syntax (`transport uwsgi { ... }`)
pub const MODULE_NAME: &str = "uwsgi";

/// Capabilities a transport module exposes to the host
#[derive(Debug, Clone, Copy)]
pub struct ModuleInfo {
    pub id: &'static str,
    /// Construct an instance with empty configuration
    pub new: fn() -> UwsgiTransport,
    /// Build an instance from directive syntax
    pub parse_directives: fn(&str) -> Result<UwsgiTransport, DirectiveError>,
    /// Check a configured instance before it serves requests
    pub validate: fn(&UwsgiTransport) -> Result<(), String>,
}

impl ModuleInfo {
    /// Last segment of the ID
    pub fn name(&self) -> &'static str {
        self.id.rsplit('.').next().unwrap_or(self.id)
    }
}

impl UwsgiTransport {
    pub fn module_info() -> ModuleInfo {
        ModuleInfo {
            id: MODULE_ID,
            new: UwsgiTransport::default,
            parse_directives: directive::parse_transport,
            validate: UwsgiTransport::validate,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("module already registered: {0}")]
    Duplicate(&'static str),
}

/// Modules known to a host, keyed by ID
#[derive(Debug, Default)]
pub struct Registry {
    modules: BTreeMap<&'static str, ModuleInfo>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, info: ModuleInfo) -> Result<(), RegistryError> {
        if self.modules.contains_key(info.id) {
            return Err(RegistryError::Duplicate(info.id));
        }
        self.modules.insert(info.id, info);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ModuleInfo> {
        self.modules.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.keys().copied()
    }
}
