//! Listener construction keyed by node name.
//!
//! [`NodeListeners`] turns an address such as `tcp6/web:443` into a
//! listener on node `web`, starting the node through the [`NodePool`] on
//! first use. Three network schemes are registered:
//!
//! | Scheme              | Listener                         |
//! |---------------------|----------------------------------|
//! | `tailscale`         | [`PooledListener`] (TCP)         |
//! | `tailscale+tls`     | [`TlsListener`] over TCP         |
//! | `tailscale/udp`     | [`PooledPacketListener`] (UDP)   |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::CryptoProvider;

use super::pooled::{PooledListener, PooledPacketListener};
use super::tls::{DEFAULT_HANDSHAKE_TIMEOUT, TlsListener};
use crate::config::{ConfigResolver, NodeSettings};
use crate::domain::{NetworkAddress, NodeHandle, NodePool};
use crate::error::Error;
use crate::runtime::{Listener, NodeLauncher, PacketListener, start_error};

/// Scheme for plain TCP listeners.
pub const NETWORK_TCP: &str = "tailscale";

/// Scheme for TLS listeners with per-node certificates.
pub const NETWORK_TLS: &str = "tailscale+tls";

/// Scheme for UDP listeners.
pub const NETWORK_UDP: &str = "tailscale/udp";

/// Datagram scheme serving HTTP/3 for a stream scheme.
#[must_use]
pub fn http3_network(network: &str) -> Option<&'static str> {
    (network == NETWORK_TCP).then_some(NETWORK_UDP)
}

/// Listener returned by [`NodeListeners::listen`].
#[derive(Debug)]
pub enum AnyListener {
    /// Stream listener (`tailscale`, `tailscale+tls`).
    Stream(Box<dyn Listener>),
    /// Datagram listener (`tailscale/udp`).
    Packet(Box<dyn PacketListener>),
}

impl AnyListener {
    /// Local address of the underlying listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener is closed.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        match self {
            Self::Stream(listener) => listener.local_addr(),
            Self::Packet(listener) => listener.local_addr(),
        }
    }

    /// Closes the underlying listener.
    ///
    /// # Errors
    ///
    /// Returns the close failure.
    pub async fn close(&self) -> Result<(), Error> {
        match self {
            Self::Stream(listener) => listener.close().await,
            Self::Packet(listener) => listener.close().await,
        }
    }
}

/// Creates listeners on pooled nodes.
#[derive(Debug)]
pub struct NodeListeners {
    pool: Arc<NodePool>,
    resolver: Arc<ConfigResolver>,
    launcher: Arc<dyn NodeLauncher>,
    provider: Arc<CryptoProvider>,
    handshake_timeout: Duration,
}

impl NodeListeners {
    /// Listener factory over `pool`, resolving node settings with
    /// `resolver` and starting nodes with `launcher`.
    #[must_use]
    pub fn new(
        pool: Arc<NodePool>,
        resolver: Arc<ConfigResolver>,
        launcher: Arc<dyn NodeLauncher>,
    ) -> Self {
        Self {
            pool,
            resolver,
            launcher,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Overrides the TLS handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// The pool nodes are registered in.
    #[must_use]
    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    /// Returns node `name`, starting it on first use, and takes one pool
    /// reference that the caller must release.
    ///
    /// Settings are resolved before the pool is touched, so configuration
    /// errors never create an entry. The state directory is created with
    /// mode `0700` before the runtime is launched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] or the node's start failure.
    pub async fn node(&self, name: &str) -> Result<Arc<NodeHandle>, Error> {
        let settings = self.resolver.resolve(name)?;
        let launcher = Arc::clone(&self.launcher);
        self.pool
            .acquire(name, || async move {
                create_state_dir(&settings).await?;
                launcher.launch(settings).await
            })
            .await
    }

    /// Listens for TCP connections at `address` (`[tcp|tcp4|tcp6/]node:port`).
    ///
    /// # Errors
    ///
    /// Returns address, configuration, start or bind failures. No pool
    /// reference is kept on failure.
    pub async fn listen_tcp(&self, address: &str) -> Result<PooledListener, Error> {
        let addr = NetworkAddress::parse(address)?;
        let network = stream_network(&addr.network)?;
        let node = self.node(&addr.host).await?;
        let listener = node.listen(network, addr.port).await;
        self.release_on_err(&addr.host, listener).await
    }

    /// Listens for TLS connections at `address`, serving each connection
    /// the certificate its node holds for the requested server name.
    ///
    /// # Errors
    ///
    /// Same as [`Self::listen_tcp`], plus [`Error::LocalApiUnavailable`] if
    /// the node has no local client.
    pub async fn listen_tls(&self, address: &str) -> Result<TlsListener, Error> {
        let addr = NetworkAddress::parse(address)?;
        let network = stream_network(&addr.network)?;
        let node = self.node(&addr.host).await?;
        let certs = match node.local_client() {
            Ok(certs) => certs,
            Err(err) => return self.release_on_err(&addr.host, Err(err)).await,
        };
        let listener = node.listen(network, addr.port).await;
        let listener = self.release_on_err(&addr.host, listener).await?;
        Ok(TlsListener::new(
            Arc::new(listener),
            certs,
            Arc::clone(&self.provider),
            self.handshake_timeout,
        ))
    }

    /// Binds a UDP socket at `address` (`[udp|udp4|udp6/]node:port`).
    ///
    /// Waits for the node to come up, then binds the node's first address
    /// of the requested family (IPv4 unless `udp6` is given). The address
    /// is chosen once; later address changes on the node are not followed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAddress`] when the node has no address of the
    /// requested family, otherwise as [`Self::listen_tcp`].
    pub async fn listen_udp(&self, address: &str) -> Result<PooledPacketListener, Error> {
        let addr = NetworkAddress::parse(address)?;
        let (network, v6) = packet_network(&addr.network)?;
        let node = self.node(&addr.host).await?;
        let listener = async {
            let status = node.up().await?;
            let ip = status.first_ip(v6).ok_or_else(|| Error::NoAddress {
                node: addr.host.clone(),
                family: if v6 { "IPv6" } else { "IPv4" },
            })?;
            node.listen_packet(network, SocketAddr::new(ip, addr.port))
                .await
        }
        .await;
        self.release_on_err(&addr.host, listener).await
    }

    /// Creates a listener for one of the registered schemes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedNetwork`] for an unknown scheme,
    /// otherwise the failure of the scheme's factory.
    pub async fn listen(&self, network: &str, address: &str) -> Result<AnyListener, Error> {
        match network {
            NETWORK_TCP => Ok(AnyListener::Stream(Box::new(self.listen_tcp(address).await?))),
            NETWORK_TLS => Ok(AnyListener::Stream(Box::new(self.listen_tls(address).await?))),
            NETWORK_UDP => Ok(AnyListener::Packet(Box::new(self.listen_udp(address).await?))),
            other => Err(Error::UnsupportedNetwork(other.to_string())),
        }
    }

    /// Gives back the reference taken by [`Self::node`] when the listener
    /// could not be created.
    async fn release_on_err<T>(&self, name: &str, result: Result<T, Error>) -> Result<T, Error> {
        if result.is_err()
            && let Err(err) = self.pool.release(name).await
        {
            tracing::warn!(node = name, error = %err, "release after failed listen failed");
        }
        result
    }
}

fn stream_network(hint: &str) -> Result<&'static str, Error> {
    match hint {
        "" | "tcp" => Ok("tcp"),
        "tcp4" => Ok("tcp4"),
        "tcp6" => Ok("tcp6"),
        other => Err(Error::UnsupportedNetwork(other.to_string())),
    }
}

fn packet_network(hint: &str) -> Result<(&'static str, bool), Error> {
    match hint {
        "" | "udp" | "udp4" => Ok(("udp4", false)),
        "udp6" => Ok(("udp6", true)),
        other => Err(Error::UnsupportedNetwork(other.to_string())),
    }
}

#[cfg(unix)]
async fn create_state_dir(settings: &NodeSettings) -> Result<(), Error> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&settings.state_dir)
        .await
        .map_err(|err| start_error(&settings.name, &err))
}

#[cfg(not(unix))]
async fn create_state_dir(settings: &NodeSettings) -> Result<(), Error> {
    tokio::fs::create_dir_all(&settings.state_dir)
        .await
        .map_err(|err| start_error(&settings.name, &err))
}
