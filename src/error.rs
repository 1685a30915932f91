//! Error types for node pooling, listener creation and local API routing.
//!
//! [`Error`] is the central error type of the crate. [`ConfigError`] covers
//! configuration resolution and is wrapped by [`Error::Config`] when it
//! surfaces through a listener factory.
//!
//! Both types are `Clone`: a failed node construction is handed to every
//! caller that was waiting on it, so the same error value must be shareable.

use std::io;
use std::sync::Arc;

/// Configuration resolution failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// A `{...}` placeholder that the replacer does not know.
    #[error("unknown placeholder {{{0}}}")]
    UnknownPlaceholder(String),

    /// A known placeholder that resolved to an empty value.
    #[error("placeholder {{{0}}} is empty")]
    EmptyPlaceholder(String),

    /// No state directory was configured and the platform has no user
    /// configuration directory to derive one from.
    #[error("unable to determine the user configuration directory")]
    NoConfigDir,

    /// The configuration document could not be parsed.
    #[error("invalid configuration: {0}")]
    Parse(String),
}

/// Crate-wide error enum.
///
/// # Categories
///
/// | Variants                                         | Category      |
/// |--------------------------------------------------|---------------|
/// | `Config`, `InvalidAddress`, `UnsupportedNetwork` | Configuration |
/// | `Start`, `NoAddress`                             | Construction  |
/// | `Teardown`, `NodeNotFound`                       | Teardown      |
/// | `UnexpectedAddress`, `LocalApiUnavailable`       | Routing       |
/// | `Certificate`, `Tls`, `Io`, `Closed`             | Transport     |
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Configuration for a node could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A listener address could not be split into network, node and port.
    #[error("invalid network address {address:?}: {reason}")]
    InvalidAddress {
        /// The address as given by the caller.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The network hint is not valid for the requested listener type.
    #[error("unsupported network {0:?}")]
    UnsupportedNetwork(String),

    /// The node runtime failed to start.
    #[error("failed to start node {node:?}: {reason}")]
    Start {
        /// Node name.
        node: String,
        /// Failure description from the runtime.
        reason: String,
    },

    /// The node runtime failed to shut down cleanly.
    #[error("failed to shut down node {node:?}: {reason}")]
    Teardown {
        /// Node name.
        node: String,
        /// Failure description from the runtime.
        reason: String,
    },

    /// A release was requested for a name that has no live pool entry.
    #[error("node {0:?} is not in the pool")]
    NodeNotFound(String),

    /// The node has no tailnet address of the requested IP family.
    #[error("node {node:?} has no {family} address")]
    NoAddress {
        /// Node name.
        node: String,
        /// `"IPv4"` or `"IPv6"`.
        family: &'static str,
    },

    /// The node's local API client is not available (yet).
    #[error("local API unavailable for node {node:?}: {reason}")]
    LocalApiUnavailable {
        /// Node name.
        node: String,
        /// Failure description from the runtime.
        reason: String,
    },

    /// The certificate dialer was asked to dial something other than the
    /// local API address.
    #[error("unexpected local API address {0:?}")]
    UnexpectedAddress(String),

    /// No certificate could be obtained for the requested server name.
    #[error("no certificate for {server_name:?}: {reason}")]
    Certificate {
        /// SNI value from the ClientHello.
        server_name: String,
        /// Failure description.
        reason: String,
    },

    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// Underlying socket failure.
    #[error("i/o error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The listener has already been closed.
    #[error("listener is closed")]
    Closed,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl Error {
    /// Returns `true` for errors caused by the caller's input rather than
    /// by a node or the network.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::InvalidAddress { .. } | Self::UnsupportedNetwork(_)
        )
    }
}
