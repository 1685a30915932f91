//! In-memory runtime doubles shared by the unit tests.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rustls::sign::CertifiedKey;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};

use crate::config::NodeSettings;
use crate::error::Error;
use crate::runtime::loopback::self_signed;
use crate::runtime::{
    BoxStream, Listener, LocalClient, NodeLauncher, NodeRuntime, NodeStatus, PacketListener,
};

/// Flag flipped by `close`, awaited by pending `accept`/`recv_from`.
#[derive(Debug)]
struct Closer(watch::Sender<bool>);

impl Closer {
    fn new() -> Self {
        Self(watch::Sender::new(false))
    }

    fn close(&self) {
        self.0.send_replace(true);
    }

    async fn closed(&self) -> Error {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
        Error::Closed
    }
}

fn injected(what: &str) -> Error {
    Error::from(io::Error::other(format!("injected {what} failure")))
}

#[derive(Debug)]
pub(crate) struct FakeListener {
    addr: SocketAddr,
    fail_close: bool,
    closer: Closer,
}

#[async_trait]
impl Listener for FakeListener {
    async fn accept(&self) -> Result<(BoxStream, SocketAddr), Error> {
        Err(self.closer.closed().await)
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.addr)
    }

    async fn close(&self) -> Result<(), Error> {
        self.closer.close();
        if self.fail_close {
            return Err(injected("listener close"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct FakePacketListener {
    addr: SocketAddr,
    closer: Closer,
}

#[async_trait]
impl PacketListener for FakePacketListener {
    async fn recv_from(&self, _buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        Err(self.closer.closed().await)
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> Result<usize, Error> {
        Ok(buf.len())
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.addr)
    }

    async fn close(&self) -> Result<(), Error> {
        self.closer.close();
        Ok(())
    }
}

/// Local client whose dials yield a stream carrying its tag.
#[derive(Debug)]
pub(crate) struct FakeLocalClient {
    tag: String,
    cert: Option<Arc<CertifiedKey>>,
    dials: Arc<AtomicUsize>,
}

impl FakeLocalClient {
    pub(crate) fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            cert: None,
            dials: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn with_certificate(mut self, cert: Arc<CertifiedKey>) -> Self {
        self.cert = Some(cert);
        self
    }

    pub(crate) fn dials(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.dials)
    }
}

/// A stream that yields `tag` and then EOF.
pub(crate) async fn tagged_stream(tag: &str) -> Result<BoxStream, Error> {
    let (client, mut server) = tokio::io::duplex(256);
    server.write_all(tag.as_bytes()).await?;
    Ok(Box::new(client))
}

#[async_trait]
impl LocalClient for FakeLocalClient {
    async fn dial(&self, _network: &str, _addr: &str) -> Result<BoxStream, Error> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        tagged_stream(&self.tag).await
    }

    async fn get_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, Error> {
        match &self.cert {
            Some(cert) => Ok(Arc::clone(cert)),
            None => self_signed(&[server_name.to_string()]),
        }
    }
}

/// Node runtime double with injectable failures.
#[derive(Debug)]
pub(crate) struct FakeRuntime {
    hostname: String,
    domains: Vec<String>,
    ips: Vec<IpAddr>,
    client: Option<Arc<dyn LocalClient>>,
    closes: Arc<AtomicUsize>,
    close_gate: Option<Arc<Notify>>,
    fail_close: bool,
    fail_listen: bool,
    fail_listener_close: bool,
}

impl FakeRuntime {
    pub(crate) fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            domains: Vec::new(),
            ips: vec![IpAddr::from([100, 64, 0, 1]), IpAddr::from([0xfd7a, 0x115c, 0xa1e0, 0, 0, 0, 0, 1])],
            client: Some(Arc::new(FakeLocalClient::new(hostname))),
            closes: Arc::new(AtomicUsize::new(0)),
            close_gate: None,
            fail_close: false,
            fail_listen: false,
            fail_listener_close: false,
        }
    }

    pub(crate) fn with_domains(mut self, domains: &[&str]) -> Self {
        self.domains = domains.iter().map(|d| (*d).to_string()).collect();
        self
    }

    pub(crate) fn with_ips(mut self, ips: &[&str]) -> Self {
        self.ips = ips.iter().filter_map(|ip| ip.parse().ok()).collect();
        self
    }

    pub(crate) fn with_client(mut self, client: Option<Arc<dyn LocalClient>>) -> Self {
        self.client = client;
        self
    }

    pub(crate) fn with_close_counter(mut self, closes: Arc<AtomicUsize>) -> Self {
        self.closes = closes;
        self
    }

    /// `close` counts itself, then waits for `gate` before returning.
    pub(crate) fn with_close_gate(mut self, gate: Arc<Notify>) -> Self {
        self.close_gate = Some(gate);
        self
    }

    pub(crate) fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub(crate) fn failing_listen(mut self) -> Self {
        self.fail_listen = true;
        self
    }

    pub(crate) fn failing_listener_close(mut self) -> Self {
        self.fail_listener_close = true;
        self
    }

    pub(crate) fn closes(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }

    fn status_now(&self) -> NodeStatus {
        NodeStatus {
            backend_state: "Running".to_string(),
            tailscale_ips: self.ips.clone(),
            dns_name: None,
        }
    }
}

#[async_trait]
impl NodeRuntime for FakeRuntime {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn listen(&self, _network: &str, port: u16) -> Result<Box<dyn Listener>, Error> {
        if self.fail_listen {
            return Err(injected("listen"));
        }
        Ok(Box::new(FakeListener {
            addr: SocketAddr::from(([100, 64, 0, 1], port)),
            fail_close: self.fail_listener_close,
            closer: Closer::new(),
        }))
    }

    async fn listen_packet(
        &self,
        _network: &str,
        addr: SocketAddr,
    ) -> Result<Box<dyn PacketListener>, Error> {
        if self.fail_listen {
            return Err(injected("listen"));
        }
        Ok(Box::new(FakePacketListener {
            addr,
            closer: Closer::new(),
        }))
    }

    async fn up(&self) -> Result<NodeStatus, Error> {
        Ok(self.status_now())
    }

    async fn status(&self) -> Result<NodeStatus, Error> {
        Ok(self.status_now())
    }

    fn cert_domains(&self) -> Vec<String> {
        self.domains.clone()
    }

    fn local_client(&self) -> Result<Arc<dyn LocalClient>, Error> {
        self.client
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| Error::LocalApiUnavailable {
                node: self.hostname.clone(),
                reason: "node is not running".to_string(),
            })
    }

    async fn close(&self) -> Result<(), Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.close_gate {
            gate.notified().await;
        }
        if self.fail_close {
            return Err(Error::Teardown {
                node: self.hostname.clone(),
                reason: "injected close failure".to_string(),
            });
        }
        Ok(())
    }
}

type RuntimeBuilder = Box<dyn Fn(&str) -> FakeRuntime + Send + Sync>;

/// Launcher producing [`FakeRuntime`]s that share one close counter.
pub(crate) struct FakeLauncher {
    build: RuntimeBuilder,
    fail: bool,
    launches: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl std::fmt::Debug for FakeLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeLauncher")
            .field("fail", &self.fail)
            .finish_non_exhaustive()
    }
}

impl FakeLauncher {
    pub(crate) fn new() -> Self {
        Self {
            build: Box::new(FakeRuntime::new),
            fail: false,
            launches: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn with_runtime<F>(mut self, build: F) -> Self
    where
        F: Fn(&str) -> FakeRuntime + Send + Sync + 'static,
    {
        self.build = Box::new(build);
        self
    }

    pub(crate) fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub(crate) fn launches(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.launches)
    }

    pub(crate) fn closes(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

#[async_trait]
impl NodeLauncher for FakeLauncher {
    async fn launch(&self, settings: NodeSettings) -> Result<Arc<dyn NodeRuntime>, Error> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Start {
                node: settings.name,
                reason: "invalid auth key".to_string(),
            });
        }
        let runtime = (self.build)(&settings.hostname).with_close_counter(Arc::clone(&self.closes));
        Ok(Arc::new(runtime))
    }
}

/// Plain TCP listener on 127.0.0.1 for exercising stream wrappers.
#[derive(Debug)]
pub(crate) struct TcpTestListener {
    inner: TcpListener,
    closer: Closer,
}

impl TcpTestListener {
    pub(crate) async fn bind() -> io::Result<Self> {
        Ok(Self {
            inner: TcpListener::bind(("127.0.0.1", 0)).await?,
            closer: Closer::new(),
        })
    }
}

#[async_trait]
impl Listener for TcpTestListener {
    async fn accept(&self) -> Result<(BoxStream, SocketAddr), Error> {
        tokio::select! {
            accepted = self.inner.accept() => {
                let (stream, peer) = accepted?;
                let stream: BoxStream = Box::new(stream);
                Ok((stream, peer))
            }
            closed = self.closer.closed() => Err(closed),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.inner.local_addr()?)
    }

    async fn close(&self) -> Result<(), Error> {
        self.closer.close();
        Ok(())
    }
}
