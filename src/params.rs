//! Static uwsgi params configured once and sent with every request.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Static name/value pairs appended to every request's block vars.
///
/// Populated at configuration time (TOML/JSON binding or directives) and only
/// read afterwards, so a transport can share it across requests without
/// locking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UwsgiParams(BTreeMap<String, String>);

impl UwsgiParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a param, replacing any earlier value for the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge `other` over `self`; values from `other` win
    pub fn merge(&mut self, other: UwsgiParams) {
        self.0.extend(other.0);
    }

    /// Check every name can be sent as a uwsgi var
    pub fn validate(&self) -> Result<(), String> {
        for name in self.0.keys() {
            if name.is_empty() {
                return Err("uwsgi param name must not be empty".to_string());
            }
            if name.contains('\0') {
                return Err(format!("uwsgi param name {:?} contains a NUL byte", name));
            }
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for UwsgiParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
