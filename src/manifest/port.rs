//! Port entries of the app manifest.

use serde::Deserialize;

use crate::error::{Error, Result};

pub const PROTOCOL_TCP: &str = "tcp";
pub const PROTOCOL_UDP: &str = "udp";

const MAX_PORT: i64 = 65_535;

/// A container port the operator may publish on the host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
pub struct PortDecl {
    pub container: String,
    pub port: i64,

    /// `tcp` or `udp`. Defaults to `tcp`.
    pub protocol: String,
    pub description: String,
}

impl PortDecl {
    pub(super) fn validate(&self) -> Result<()> {
        if self.port <= 0 || self.port > MAX_PORT {
            return Err(Error::Manifest(format!("invalid port: {}", self.port)));
        }
        if !self.protocol.is_empty()
            && self.protocol != PROTOCOL_TCP
            && self.protocol != PROTOCOL_UDP
        {
            return Err(Error::Manifest(format!(
                "invalid port protocol: {}",
                self.protocol
            )));
        }
        if self.container.is_empty() {
            return Err(Error::Manifest(format!(
                "missing container name for port {}",
                self.port
            )));
        }
        Ok(())
    }

    pub(super) fn fill_defaults(&mut self) {
        if self.protocol.is_empty() {
            self.protocol = PROTOCOL_TCP.to_string();
        }
    }
}
