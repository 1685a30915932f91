//! Certificate dial routing across pooled nodes.
//!
//! A TLS server that fetches certificates from a local API dials the
//! synthetic address [`LOCAL_API_ADDRESS`]. With several nodes in one
//! process, [`CertDialer`] picks the node whose certificate domains match
//! the server name of the handshake in progress and dials that node's local
//! API. Everything else goes to the machine-wide fallback dialer.

use std::ops::ControlFlow;
use std::sync::Arc;

use crate::domain::{NodeHandle, NodePool, match_wildcard};
use crate::error::Error;
use crate::runtime::{BoxStream, LocalApiDialer};

/// The only address [`CertDialer`] accepts.
pub const LOCAL_API_ADDRESS: &str = "local-tailscaled.sock:80";

/// The part of a TLS ClientHello the dialer routes on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
    /// Requested server name (SNI); empty when the client sent none.
    pub server_name: String,
}

impl ClientHelloInfo {
    /// Hello requesting `server_name`.
    #[must_use]
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
        }
    }
}

/// Routes local API dials to the node serving the requested server name.
#[derive(Debug)]
pub struct CertDialer {
    pool: Arc<NodePool>,
    fallback: Arc<dyn LocalApiDialer>,
}

impl CertDialer {
    /// Dialer over `pool`, using `fallback` when no node claims a dial.
    #[must_use]
    pub fn new(pool: Arc<NodePool>, fallback: Arc<dyn LocalApiDialer>) -> Self {
        Self { pool, fallback }
    }

    /// First constructed node with a certificate domain matching
    /// `server_name`.
    ///
    /// Nodes are visited in no particular order; when several match, which
    /// one is returned is unspecified.
    #[must_use]
    pub fn find_node(&self, server_name: &str) -> Option<Arc<NodeHandle>> {
        let mut found = None;
        self.pool.for_each(|_, node| {
            if node
                .cert_domains()
                .iter()
                .any(|domain| match_wildcard(server_name, domain))
            {
                found = Some(Arc::clone(node));
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
        found
    }

    /// Dials the local API on behalf of the handshake described by `hello`.
    ///
    /// Without a hello or server name, with no matching node, or when the
    /// matching node has no local client yet, the fallback dialer is used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedAddress`] if `addr` is not
    /// [`LOCAL_API_ADDRESS`], otherwise the failure of whichever dialer was
    /// chosen.
    pub async fn dial(
        &self,
        hello: Option<&ClientHelloInfo>,
        network: &str,
        addr: &str,
    ) -> Result<BoxStream, Error> {
        if addr != LOCAL_API_ADDRESS {
            return Err(Error::UnexpectedAddress(addr.to_string()));
        }

        let Some(server_name) = hello
            .map(|h| h.server_name.as_str())
            .filter(|name| !name.is_empty())
        else {
            return self.fallback.dial(network, addr).await;
        };

        if let Some(node) = self.find_node(server_name) {
            match node.local_client() {
                Ok(client) => {
                    tracing::debug!(node = node.name(), server_name, "routing certificate dial");
                    return client.dial(network, addr).await;
                }
                Err(err) => {
                    tracing::debug!(node = node.name(), error = %err, "local client unavailable; using fallback");
                }
            }
        }

        self.fallback.dial(network, addr).await
    }
}
