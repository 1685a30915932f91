//! Listeners that hold a reference on their node.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::domain::NodePool;
use crate::error::Error;
use crate::runtime::{BoxStream, Listener, PacketListener};

/// One pool reference, released exactly once.
///
/// Released explicitly by the owning listener's `close`, or on a background
/// task when dropped unreleased.
#[derive(Debug)]
struct NodeLease {
    name: String,
    pool: Arc<NodePool>,
    released: AtomicBool,
}

impl NodeLease {
    fn new(name: String, pool: Arc<NodePool>) -> Self {
        Self {
            name,
            pool,
            released: AtomicBool::new(false),
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Releases the reference if this is the first call.
    async fn release(&self) -> Result<(), Error> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pool.release(&self.name).await
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        if *self.released.get_mut() {
            return;
        }
        let pool = Arc::clone(&self.pool);
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = pool.release(&name).await {
                        tracing::warn!(node = %name, error = %err, "release of dropped listener failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(node = %name, "listener dropped outside a runtime; node reference leaked");
            }
        }
    }
}

/// Releases the lease after the caller closed the socket; the close error
/// takes precedence.
async fn close_then_release(
    close: Result<(), Error>,
    lease: &NodeLease,
) -> Result<(), Error> {
    let released = lease.release().await;
    if let Err(err) = &released {
        tracing::warn!(node = %lease.name, error = %err, "node release failed");
    }
    close.and(released)
}

/// Stream listener whose close releases one reference on its node.
#[derive(Debug)]
pub struct PooledListener {
    inner: Box<dyn Listener>,
    lease: NodeLease,
}

impl PooledListener {
    pub(crate) fn new(name: String, inner: Box<dyn Listener>, pool: Arc<NodePool>) -> Self {
        Self {
            inner,
            lease: NodeLease::new(name, pool),
        }
    }

    /// Name of the node this listener belongs to.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.lease.name
    }
}

#[async_trait]
impl Listener for PooledListener {
    async fn accept(&self) -> Result<(BoxStream, SocketAddr), Error> {
        self.inner.accept().await
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.inner.local_addr()
    }

    async fn close(&self) -> Result<(), Error> {
        if self.lease.is_released() {
            return Ok(());
        }
        let closed = self.inner.close().await;
        close_then_release(closed, &self.lease).await
    }
}

/// Datagram listener whose close releases one reference on its node.
#[derive(Debug)]
pub struct PooledPacketListener {
    inner: Box<dyn PacketListener>,
    lease: NodeLease,
}

impl PooledPacketListener {
    pub(crate) fn new(name: String, inner: Box<dyn PacketListener>, pool: Arc<NodePool>) -> Self {
        Self {
            inner,
            lease: NodeLease::new(name, pool),
        }
    }

    /// Name of the node this listener belongs to.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.lease.name
    }
}

#[async_trait]
impl PacketListener for PooledPacketListener {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        self.inner.recv_from(buf).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, Error> {
        self.inner.send_to(buf, target).await
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.inner.local_addr()
    }

    async fn close(&self) -> Result<(), Error> {
        if self.lease.is_released() {
            return Ok(());
        }
        let closed = self.inner.close().await;
        close_then_release(closed, &self.lease).await
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio_test::assert_ok;

    use super::*;
    use crate::domain::NodeHandle;
    use crate::runtime::NodeRuntime;
    use crate::testing::FakeRuntime;

    async fn pooled(pool: &Arc<NodePool>, runtime: FakeRuntime, refs: usize) -> Arc<NodeHandle> {
        let runtime: Arc<dyn NodeRuntime> = Arc::new(runtime);
        let mut handle = None;
        for _ in 0..refs {
            let runtime = Arc::clone(&runtime);
            let Ok(acquired) = pool.acquire("web", || async move { Ok(runtime) }).await else {
                panic!("acquire failed");
            };
            handle = Some(acquired);
        }
        let Some(handle) = handle else {
            panic!("no references taken");
        };
        handle
    }

    #[tokio::test]
    async fn close_releases_exactly_once() {
        let pool = Arc::new(NodePool::new());
        let node = pooled(&pool, FakeRuntime::new("web"), 2).await;

        let Ok(listener) = node.listen("tcp", 80).await else {
            panic!("listen failed");
        };
        assert_eq!(listener.node_name(), "web");

        assert_ok!(listener.close().await);
        assert_ok!(listener.close().await);
        assert_eq!(pool.refs("web"), Some(1));
    }

    #[tokio::test]
    async fn failed_close_still_releases() {
        let pool = Arc::new(NodePool::new());
        let runtime = FakeRuntime::new("web").failing_listener_close();
        let closes = runtime.closes();
        let node = pooled(&pool, runtime, 1).await;

        let Ok(listener) = node.listen("tcp", 80).await else {
            panic!("listen failed");
        };
        assert!(matches!(listener.close().await, Err(Error::Io(_))));
        assert!(!pool.contains("web"));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn packet_listener_close_releases() {
        let pool = Arc::new(NodePool::new());
        let node = pooled(&pool, FakeRuntime::new("web"), 1).await;

        let addr = SocketAddr::from(([100, 64, 0, 1], 443));
        let Ok(listener) = node.listen_packet("udp4", addr).await else {
            panic!("listen_packet failed");
        };
        assert!(matches!(listener.local_addr(), Ok(a) if a == addr));
        assert!(listener.close().await.is_ok());
        assert!(!pool.contains("web"));
    }

    #[tokio::test]
    async fn dropped_listener_releases_in_background() {
        let pool = Arc::new(NodePool::new());
        let runtime = FakeRuntime::new("web");
        let closes: Arc<AtomicUsize> = runtime.closes();
        let node = pooled(&pool, runtime, 1).await;

        let Ok(listener) = node.listen("tcp", 80).await else {
            panic!("listen failed");
        };
        drop(listener);

        let released = tokio::time::timeout(Duration::from_secs(1), async {
            while pool.contains("web") {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(released.is_ok());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_outside_runtime_keeps_reference() {
        let pool = Arc::new(NodePool::new());
        let listener = tokio_test::block_on(async {
            let node = pooled(&pool, FakeRuntime::new("web"), 1).await;
            let Ok(listener) = node.listen("tcp", 80).await else {
                panic!("listen failed");
            };
            listener
        });

        drop(listener);
        assert_eq!(pool.refs("web"), Some(1));
    }
}
