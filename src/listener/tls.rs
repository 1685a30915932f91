//! TLS termination with certificates fetched per connection from a node.
//!
//! [`TlsListener`] accepts raw connections on a background task, reads each
//! ClientHello, asks the node's [`LocalClient`] for the certificate of the
//! requested server name and completes the handshake. Finished streams are
//! handed out by [`Listener::accept`]; failed handshakes are logged and
//! dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::ServerConfig;
use rustls::crypto::CryptoProvider;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::LazyConfigAcceptor;
use tokio_rustls::server::TlsStream;

use crate::error::Error;
use crate::runtime::{BoxStream, Listener, LocalClient};

/// Upper bound for one handshake, including the certificate lookup.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_QUEUE: usize = 64;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

type Accepted = Result<(BoxStream, SocketAddr), Error>;

/// Serves the one certificate already chosen for this connection.
#[derive(Debug)]
struct ChosenCert(Arc<CertifiedKey>);

impl ResolvesServerCert for ChosenCert {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// TLS listener over a node listener.
#[derive(Debug)]
pub struct TlsListener {
    inner: Arc<dyn Listener>,
    incoming: Mutex<mpsc::Receiver<Accepted>>,
    accept_task: JoinHandle<()>,
}

impl TlsListener {
    /// Starts terminating TLS on `inner`, sourcing certificates from
    /// `certs`. Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(
        inner: Arc<dyn Listener>,
        certs: Arc<dyn LocalClient>,
        provider: Arc<CryptoProvider>,
        handshake_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(&inner),
            certs,
            provider,
            handshake_timeout,
            tx,
        ));
        Self {
            inner,
            incoming: Mutex::new(rx),
            accept_task,
        }
    }
}

#[async_trait]
impl Listener for TlsListener {
    async fn accept(&self) -> Result<(BoxStream, SocketAddr), Error> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.unwrap_or(Err(Error::Closed))
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.inner.local_addr()
    }

    async fn close(&self) -> Result<(), Error> {
        // Aborting the loop drops its JoinSet, which cancels in-flight
        // handshakes and closes the channel.
        self.accept_task.abort();
        self.inner.close().await
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    inner: Arc<dyn Listener>,
    certs: Arc<dyn LocalClient>,
    provider: Arc<CryptoProvider>,
    handshake_timeout: Duration,
    tx: mpsc::Sender<Accepted>,
) {
    let mut handshakes = JoinSet::new();
    loop {
        while handshakes.try_join_next().is_some() {}

        let (stream, peer) = match inner.accept().await {
            Ok(accepted) => accepted,
            Err(Error::Closed) => break,
            Err(err) => {
                if tx.send(Err(err)).await.is_err() {
                    break;
                }
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let certs = Arc::clone(&certs);
        let provider = Arc::clone(&provider);
        let tx = tx.clone();
        handshakes.spawn(async move {
            let handshake = handshake(stream, certs.as_ref(), provider);
            match tokio::time::timeout(handshake_timeout, handshake).await {
                Ok(Ok(tls)) => {
                    let stream: BoxStream = Box::new(tls);
                    let _ = tx.send(Ok((stream, peer))).await;
                }
                Ok(Err(err)) => tracing::debug!(%peer, error = %err, "tls handshake failed"),
                Err(_) => tracing::debug!(%peer, "tls handshake timed out"),
            }
        });
    }
    tracing::debug!("tls accept loop stopped");
}

async fn handshake(
    stream: BoxStream,
    certs: &dyn LocalClient,
    provider: Arc<CryptoProvider>,
) -> Result<TlsStream<BoxStream>, Error> {
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
    let server_name = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .ok_or_else(|| Error::Certificate {
            server_name: String::new(),
            reason: "client sent no server name".to_string(),
        })?;

    let cert = certs.get_certificate(&server_name).await?;
    tracing::trace!(server_name = %server_name, "certificate selected");

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(ChosenCert(cert)));
    Ok(start.into_stream(Arc::new(config)).await?)
}
