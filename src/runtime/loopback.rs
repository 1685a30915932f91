//! Runtime that serves every node on the host loopback interface.
//!
//! Each [`LoopbackNode`] claims `127.0.0.1` and `::1` as its tailnet
//! addresses, answers certificate requests for `<hostname>.<domain>` with a
//! self-signed certificate, and exposes its local API as a Unix socket in
//! its state directory. The socket answers `GET /localapi/v0/status` with the
//! node status as JSON. Closing the node closes every listener it created
//! and removes the socket.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{OnceCell, watch};

use super::{
    BoxStream, Listener, LocalClient, NodeLauncher, NodeRuntime, NodeStatus, PacketListener,
    connect_unix, start_error,
};
use crate::config::NodeSettings;
use crate::domain::match_wildcard;
use crate::error::Error;

/// Tailnet domain appended to node hostnames.
pub const DEFAULT_TAILNET_DOMAIN: &str = "loopback.ts.net";

/// Name of the local API socket inside a node's state directory.
pub const LOCALAPI_SOCKET_NAME: &str = "tailscaled.sock";

/// Local API path serving the node status.
pub const LOCALAPI_STATUS_PATH: &str = "/localapi/v0/status";

const REQUEST_HEAD_LIMIT: usize = 8 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Issues a self-signed certificate covering `names`.
///
/// # Errors
///
/// Returns [`Error::Certificate`] if key generation or signing fails.
pub fn self_signed(names: &[String]) -> Result<Arc<CertifiedKey>, Error> {
    let server_name = names.first().cloned().unwrap_or_default();
    let failed = |reason: String| Error::Certificate {
        server_name: server_name.clone(),
        reason,
    };

    let key_pair = KeyPair::generate().map_err(|e| failed(e.to_string()))?;
    let params = CertificateParams::new(names.to_vec()).map_err(|e| failed(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| failed(e.to_string()))?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    Ok(Arc::new(CertifiedKey::new(
        vec![cert.der().clone()],
        signing_key,
    )))
}

/// Launches [`LoopbackNode`]s.
#[derive(Debug, Clone)]
pub struct LoopbackLauncher {
    domain: String,
}

impl LoopbackLauncher {
    /// Launcher using [`DEFAULT_TAILNET_DOMAIN`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `domain` as the tailnet domain of launched nodes.
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }
}

impl Default for LoopbackLauncher {
    fn default() -> Self {
        Self {
            domain: DEFAULT_TAILNET_DOMAIN.to_string(),
        }
    }
}

#[async_trait]
impl NodeLauncher for LoopbackLauncher {
    async fn launch(&self, settings: NodeSettings) -> Result<Arc<dyn NodeRuntime>, Error> {
        if !settings.state_dir.is_dir() {
            return Err(Error::Start {
                node: settings.name,
                reason: "state directory does not exist".to_string(),
            });
        }
        let node = LoopbackNode::new(settings, &self.domain);
        node.start_local_api().await?;
        tracing::info!(
            node = %node.settings.name,
            dns_name = %node.dns_name,
            state_dir = %node.settings.state_dir.display(),
            ephemeral = node.settings.ephemeral,
            "loopback node launched"
        );
        Ok(Arc::new(node))
    }
}

/// One node served on the loopback interface.
#[derive(Debug)]
pub struct LoopbackNode {
    settings: NodeSettings,
    dns_name: String,
    client: Arc<LoopbackLocalClient>,
    closed: watch::Sender<bool>,
    /// Inode of the socket file this node bound.
    socket_inode: OnceLock<u64>,
}

impl LoopbackNode {
    fn new(settings: NodeSettings, domain: &str) -> Self {
        let dns_name = format!("{}.{domain}", settings.hostname);
        let client = Arc::new(LoopbackLocalClient {
            node: settings.name.clone(),
            socket_path: settings.state_dir.join(LOCALAPI_SOCKET_NAME),
            domains: vec![dns_name.clone()],
            cert: OnceCell::new(),
        });
        Self {
            settings,
            dns_name,
            client,
            closed: watch::Sender::new(false),
            socket_inode: OnceLock::new(),
        }
    }

    /// Fully qualified name of the node.
    #[must_use]
    pub fn dns_name(&self) -> &str {
        &self.dns_name
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn gate(&self) -> Gate {
        Gate {
            own: watch::Sender::new(false),
            node: self.closed.subscribe(),
        }
    }

    fn status_now(&self) -> NodeStatus {
        loopback_status(&self.dns_name, !self.is_closed())
    }

    #[cfg(unix)]
    async fn start_local_api(&self) -> Result<(), Error> {
        let path = &self.client.socket_path;
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!(node = %self.settings.name, "removed stale local api socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(start_error(&self.settings.name, &err)),
        }
        let listener = tokio::net::UnixListener::bind(path)
            .map_err(|err| start_error(&self.settings.name, &err))?;
        if let Ok(inode) = socket_inode(path).await {
            let _ = self.socket_inode.set(inode);
        }
        tokio::spawn(serve_local_api(
            listener,
            self.dns_name.clone(),
            self.closed.subscribe(),
        ));
        Ok(())
    }

    #[cfg(not(unix))]
    async fn start_local_api(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Removes the socket file unless a newer node on the same state
    /// directory has replaced it.
    async fn remove_local_api(&self) -> io::Result<()> {
        let Some(bound) = self.socket_inode.get() else {
            return Ok(());
        };
        let path = &self.client.socket_path;
        match socket_inode(path).await {
            Ok(current) if current == *bound => tokio::fs::remove_file(path).await,
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(unix)]
async fn socket_inode(path: &std::path::Path) -> io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(tokio::fs::symlink_metadata(path).await?.ino())
}

#[cfg(not(unix))]
async fn socket_inode(_path: &std::path::Path) -> io::Result<u64> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

fn loopback_status(dns_name: &str, running: bool) -> NodeStatus {
    NodeStatus {
        backend_state: if running { "Running" } else { "Stopped" }.to_string(),
        tailscale_ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)],
        dns_name: Some(format!("{dns_name}.")),
    }
}

/// Accepts local API connections until the node closes or is dropped.
#[cfg(unix)]
async fn serve_local_api(
    listener: tokio::net::UnixListener,
    dns_name: String,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(err) => {
                    tracing::debug!(error = %err, "local api accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => break,
        };
        let dns_name = dns_name.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(REQUEST_TIMEOUT, answer(stream, &dns_name)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::debug!(error = %err, "local api request failed"),
                Err(_) => tracing::debug!("local api request timed out"),
            }
        });
    }
    tracing::debug!(dns_name = %dns_name, "local api stopped");
}

/// Reads one request head and writes the response.
async fn answer<S>(mut stream: S, dns_name: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < REQUEST_HEAD_LIMIT {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(buf.get(..n).unwrap_or_default());
    }
    stream.write_all(&respond(&head, dns_name)).await?;
    stream.shutdown().await
}

fn respond(head: &[u8], dns_name: &str) -> Vec<u8> {
    let request_line = head.split(|b| *b == b'\n').next().unwrap_or_default();
    let request_line = String::from_utf8_lossy(request_line);
    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(LOCALAPI_STATUS_PATH)) => {
            match serde_json::to_vec(&loopback_status(dns_name, true)) {
                Ok(body) => http_response("200 OK", "application/json", &body),
                Err(err) => http_response(
                    "500 Internal Server Error",
                    "text/plain",
                    err.to_string().as_bytes(),
                ),
            }
        }
        _ => http_response("404 Not Found", "text/plain", b"not found\n"),
    }
}

fn http_response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.0 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

#[async_trait]
impl NodeRuntime for LoopbackNode {
    fn hostname(&self) -> &str {
        &self.settings.hostname
    }

    async fn listen(&self, network: &str, port: u16) -> Result<Box<dyn Listener>, Error> {
        self.ensure_open()?;
        let ip = match network {
            "tcp" | "tcp4" => IpAddr::V4(Ipv4Addr::LOCALHOST),
            "tcp6" => IpAddr::V6(Ipv6Addr::LOCALHOST),
            other => return Err(Error::UnsupportedNetwork(other.to_string())),
        };
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        Ok(Box::new(LoopbackListener {
            socket: Mutex::new(Some(Arc::new(listener))),
            gate: self.gate(),
        }))
    }

    async fn listen_packet(
        &self,
        network: &str,
        addr: SocketAddr,
    ) -> Result<Box<dyn PacketListener>, Error> {
        self.ensure_open()?;
        match (network, addr.is_ipv6()) {
            ("udp4", false) | ("udp6", true) => {}
            _ => return Err(Error::UnsupportedNetwork(network.to_string())),
        }
        let socket = UdpSocket::bind(addr).await?;
        Ok(Box::new(LoopbackPacketListener {
            socket: Mutex::new(Some(Arc::new(socket))),
            gate: self.gate(),
        }))
    }

    async fn up(&self) -> Result<NodeStatus, Error> {
        if self.is_closed() {
            return Err(start_error(
                &self.settings.name,
                &std::io::Error::other("node is closed"),
            ));
        }
        Ok(self.status_now())
    }

    async fn status(&self) -> Result<NodeStatus, Error> {
        Ok(self.status_now())
    }

    fn cert_domains(&self) -> Vec<String> {
        if self.is_closed() {
            return Vec::new();
        }
        self.client.domains.clone()
    }

    fn local_client(&self) -> Result<Arc<dyn LocalClient>, Error> {
        if self.is_closed() {
            return Err(Error::LocalApiUnavailable {
                node: self.settings.name.clone(),
                reason: "node is closed".to_string(),
            });
        }
        Ok(Arc::clone(&self.client) as Arc<dyn LocalClient>)
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.send_replace(true);
        if let Err(err) = self.remove_local_api().await {
            tracing::warn!(node = %self.settings.name, error = %err, "failed to remove local api socket");
        }
        tracing::debug!(node = %self.settings.name, "loopback node closed");
        Ok(())
    }
}

/// Local API of a [`LoopbackNode`].
#[derive(Debug)]
pub struct LoopbackLocalClient {
    node: String,
    socket_path: PathBuf,
    domains: Vec<String>,
    cert: OnceCell<Arc<CertifiedKey>>,
}

#[async_trait]
impl LocalClient for LoopbackLocalClient {
    async fn dial(&self, _network: &str, _addr: &str) -> Result<BoxStream, Error> {
        connect_unix(&self.socket_path).await
    }

    async fn get_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, Error> {
        if !self
            .domains
            .iter()
            .any(|domain| match_wildcard(server_name, domain))
        {
            return Err(Error::Certificate {
                server_name: server_name.to_string(),
                reason: format!("node {:?} does not serve this name", self.node),
            });
        }
        let cert = self
            .cert
            .get_or_try_init(|| async { self_signed(&self.domains) })
            .await?;
        Ok(Arc::clone(cert))
    }
}

/// Closed when either the listener or its node closes.
#[derive(Debug)]
struct Gate {
    own: watch::Sender<bool>,
    node: watch::Receiver<bool>,
}

impl Gate {
    fn close(&self) {
        self.own.send_replace(true);
    }

    async fn closed(&self) {
        let mut own = self.own.subscribe();
        let mut node = self.node.clone();
        tokio::select! {
            _ = own.wait_for(|closed| *closed) => {}
            _ = node.wait_for(|closed| *closed) => {}
        }
    }
}

fn current<T>(slot: &Mutex<Option<Arc<T>>>) -> Result<Arc<T>, Error> {
    slot.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(Arc::clone)
        .ok_or(Error::Closed)
}

fn take<T>(slot: &Mutex<Option<Arc<T>>>) {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take();
}

#[derive(Debug)]
struct LoopbackListener {
    socket: Mutex<Option<Arc<TcpListener>>>,
    gate: Gate,
}

#[async_trait]
impl Listener for LoopbackListener {
    async fn accept(&self) -> Result<(BoxStream, SocketAddr), Error> {
        let socket = current(&self.socket)?;
        tokio::select! {
            accepted = socket.accept() => {
                let (stream, peer) = accepted?;
                let stream: BoxStream = Box::new(stream);
                Ok((stream, peer))
            }
            () = self.gate.closed() => {
                take(&self.socket);
                Err(Error::Closed)
            }
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(current(&self.socket)?.local_addr()?)
    }

    async fn close(&self) -> Result<(), Error> {
        self.gate.close();
        take(&self.socket);
        Ok(())
    }
}

#[derive(Debug)]
struct LoopbackPacketListener {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    gate: Gate,
}

#[async_trait]
impl PacketListener for LoopbackPacketListener {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        let socket = current(&self.socket)?;
        tokio::select! {
            received = socket.recv_from(buf) => Ok(received?),
            () = self.gate.closed() => {
                take(&self.socket);
                Err(Error::Closed)
            }
        }
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, Error> {
        let socket = current(&self.socket)?;
        Ok(socket.send_to(buf, target).await?)
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(current(&self.socket)?.local_addr()?)
    }

    async fn close(&self) -> Result<(), Error> {
        self.gate.close();
        take(&self.socket);
        Ok(())
    }
}
