//! Listener address parsing.
//!
//! Listener addresses have the shape `[network/]node:port`, where the host
//! component names the pooled node rather than an interface address.

use std::fmt;

use crate::error::Error;

/// A listener address split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    /// Lower-cased network hint (`"tcp6"`, `"udp4"`...), empty when absent.
    pub network: String,
    /// Node name.
    pub host: String,
    /// Port on the node.
    pub port: u16,
}

impl NetworkAddress {
    /// Splits `address` into network hint, node name and port.
    ///
    /// IPv6-style bracketed hosts (`[name]:443`) are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] when the port is missing or not a
    /// number, or when the node name is empty.
    pub fn parse(address: &str) -> Result<Self, Error> {
        let invalid = |reason: &str| Error::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let (network, rest) = match address.split_once('/') {
            Some((network, rest)) => (network.trim().to_lowercase(), rest),
            None => (String::new(), address),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("missing ']' in host"))?;
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port"))?;
            (host, port)
        } else {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing port"))?;
            if host.contains(':') {
                return Err(invalid("too many colons; bracket IPv6 hosts"));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(invalid("missing node name"));
        }
        if port.is_empty() {
            return Err(invalid("missing port"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;

        Ok(Self {
            network,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.network.is_empty() {
            write!(f, "{}/", self.network)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
