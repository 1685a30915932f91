//! Seam to the embedded network-identity runtime.
//!
//! The pool never starts, stops or talks to a tailnet node directly. It goes
//! through the traits in this module, which a concrete runtime implements:
//!
//! - [`NodeLauncher`] builds a [`NodeRuntime`] from resolved [`NodeSettings`].
//! - [`NodeRuntime`] listens on the node's virtual interface, reports status
//!   and certificate domains, and hands out a [`LocalClient`].
//! - [`LocalClient`] dials the node's local API and fetches certificates.
//! - [`LocalApiDialer`] is the machine-wide fallback used when no node
//!   claims a dial.
//!
//! [`loopback`] is a runtime that binds on the host loopback interface; it
//! is meant for development and tests.

pub mod loopback;

use std::fmt::Debug;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::NodeSettings;
use crate::error::Error;

/// Default path of the machine-wide tailscaled local API socket.
pub const DEFAULT_LOCALAPI_SOCKET: &str = "/var/run/tailscale/tailscaled.sock";

/// Byte stream accepted from a listener or dialed to a local API.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Owned, type-erased [`AsyncStream`].
pub type BoxStream = Box<dyn AsyncStream>;

/// Stream listener bound to a node's virtual interface.
#[async_trait]
pub trait Listener: Send + Sync + Debug {
    /// Waits for the next inbound connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once the listener is closed, or the
    /// underlying socket error.
    async fn accept(&self) -> Result<(BoxStream, SocketAddr), Error>;

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener is closed.
    fn local_addr(&self) -> Result<SocketAddr, Error>;

    /// Stops accepting connections and frees the socket.
    ///
    /// # Errors
    ///
    /// Returns the underlying close failure.
    async fn close(&self) -> Result<(), Error>;
}

/// Datagram listener bound to one of a node's addresses.
#[async_trait]
pub trait PacketListener: Send + Sync + Debug {
    /// Receives one datagram into `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once the listener is closed, or the
    /// underlying socket error.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error>;

    /// Sends one datagram to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once the listener is closed, or the
    /// underlying socket error.
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, Error>;

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener is closed.
    fn local_addr(&self) -> Result<SocketAddr, Error>;

    /// Frees the socket.
    ///
    /// # Errors
    ///
    /// Returns the underlying close failure.
    async fn close(&self) -> Result<(), Error>;
}

/// Snapshot of a node's backend state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeStatus {
    /// Backend state (e.g. `"Running"`, `"Starting"`).
    pub backend_state: String,

    /// Addresses assigned to the node on the tailnet.
    #[serde(rename = "TailscaleIPs")]
    pub tailscale_ips: Vec<IpAddr>,

    /// Fully qualified MagicDNS name, if known.
    #[serde(rename = "DNSName", default)]
    pub dns_name: Option<String>,
}

impl NodeStatus {
    /// First assigned address of the requested family.
    #[must_use]
    pub fn first_ip(&self, v6: bool) -> Option<IpAddr> {
        self.tailscale_ips
            .iter()
            .copied()
            .find(|ip| ip.is_ipv6() == v6)
    }
}

/// Client for a single node's local API.
#[async_trait]
pub trait LocalClient: Send + Sync + Debug {
    /// Opens a connection to the local API.
    ///
    /// # Errors
    ///
    /// Returns the connection failure.
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxStream, Error>;

    /// Fetches the certificate the node holds for `server_name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Certificate`] if the node has no certificate for the
    /// name or issuance failed.
    async fn get_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, Error>;
}

/// One running network identity.
///
/// Implementations own every resource of the node (state directory,
/// background tasks, sockets) and release them in [`NodeRuntime::close`].
#[async_trait]
pub trait NodeRuntime: Send + Sync + Debug {
    /// Hostname the node registers on the tailnet.
    fn hostname(&self) -> &str;

    /// Listens for stream connections on `port` of the node's virtual
    /// interface. `network` is `"tcp"`, `"tcp4"` or `"tcp6"`.
    ///
    /// # Errors
    ///
    /// Returns start failures or bind failures.
    async fn listen(&self, network: &str, port: u16) -> Result<Box<dyn Listener>, Error>;

    /// Binds a datagram socket at `addr`. `network` is `"udp4"` or `"udp6"`.
    ///
    /// # Errors
    ///
    /// Returns start failures or bind failures.
    async fn listen_packet(
        &self,
        network: &str,
        addr: SocketAddr,
    ) -> Result<Box<dyn PacketListener>, Error>;

    /// Brings the node up and waits until it reports itself running.
    ///
    /// # Errors
    ///
    /// Returns start failures (bad auth key, unreachable control server).
    async fn up(&self) -> Result<NodeStatus, Error>;

    /// Current status without waiting for the node to come up.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be queried.
    async fn status(&self) -> Result<NodeStatus, Error>;

    /// Domains the node can currently obtain certificates for.
    fn cert_domains(&self) -> Vec<String>;

    /// Client for the node's local API.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LocalApiUnavailable`] if the node is not started.
    fn local_client(&self) -> Result<Arc<dyn LocalClient>, Error>;

    /// Stops the node and releases its resources.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Teardown`] if shutdown did not complete cleanly.
    async fn close(&self) -> Result<(), Error>;
}

/// Builds node runtimes from resolved settings.
#[async_trait]
pub trait NodeLauncher: Send + Sync + Debug {
    /// Creates the runtime for one node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Start`] if the runtime cannot be created.
    async fn launch(&self, settings: NodeSettings) -> Result<Arc<dyn NodeRuntime>, Error>;
}

/// Dial path used when no pooled node claims a local API connection.
#[async_trait]
pub trait LocalApiDialer: Send + Sync + Debug {
    /// Opens a connection to the local API.
    ///
    /// # Errors
    ///
    /// Returns the connection failure.
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxStream, Error>;
}

/// Dials the machine's tailscaled over its Unix socket.
#[derive(Debug, Clone)]
pub struct TailscaledSocketDialer {
    socket_path: PathBuf,
}

impl TailscaledSocketDialer {
    /// Dialer for the given socket path.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Socket this dialer connects to.
    #[must_use]
    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }
}

impl Default for TailscaledSocketDialer {
    fn default() -> Self {
        Self::new(DEFAULT_LOCALAPI_SOCKET)
    }
}

#[async_trait]
impl LocalApiDialer for TailscaledSocketDialer {
    async fn dial(&self, _network: &str, _addr: &str) -> Result<BoxStream, Error> {
        connect_unix(&self.socket_path).await
    }
}

#[cfg(unix)]
pub(crate) async fn connect_unix(path: &std::path::Path) -> Result<BoxStream, Error> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
pub(crate) async fn connect_unix(path: &std::path::Path) -> Result<BoxStream, Error> {
    Err(Error::from(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("unix sockets unavailable, cannot dial {}", path.display()),
    )))
}

/// Maps an I/O failure during startup to [`Error::Start`].
pub(crate) fn start_error(node: &str, err: &io::Error) -> Error {
    Error::Start {
        node: node.to_string(),
        reason: err.to_string(),
    }
}
