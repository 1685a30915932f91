//! Handle to one running node.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::NodePool;
use crate::error::Error;
use crate::listener::{PooledListener, PooledPacketListener};
use crate::runtime::{LocalClient, NodeRuntime, NodeStatus};

/// A pooled node: the runtime plus the name it is registered under.
///
/// Handles are created by [`NodePool::acquire`] and shared by every
/// consumer of the same name. Listeners created through a handle are
/// wrapped so that closing them releases one pool reference; the handle
/// itself never changes the reference count.
#[derive(Debug)]
pub struct NodeHandle {
    name: String,
    runtime: Arc<dyn NodeRuntime>,
    pool: Weak<NodePool>,
    torn_down: AtomicBool,
}

impl NodeHandle {
    pub(crate) fn new(name: String, runtime: Arc<dyn NodeRuntime>, pool: Weak<NodePool>) -> Self {
        Self {
            name,
            runtime,
            pool,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Pool key of this node.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hostname the node registers on the tailnet.
    #[must_use]
    pub fn hostname(&self) -> &str {
        self.runtime.hostname()
    }

    /// Domains the node can currently obtain certificates for.
    #[must_use]
    pub fn cert_domains(&self) -> Vec<String> {
        self.runtime.cert_domains()
    }

    /// Client for the node's local API.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LocalApiUnavailable`] if the node is not started.
    pub fn local_client(&self) -> Result<Arc<dyn LocalClient>, Error> {
        self.runtime.local_client()
    }

    /// Addresses currently assigned to the node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node status cannot be queried.
    pub async fn addresses(&self) -> Result<Vec<IpAddr>, Error> {
        Ok(self.runtime.status().await?.tailscale_ips)
    }

    /// Brings the node up and waits until it is running.
    ///
    /// # Errors
    ///
    /// Returns the runtime's start failure.
    pub async fn up(&self) -> Result<NodeStatus, Error> {
        self.runtime.up().await
    }

    /// Whether [`Self::teardown`] has run.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Listens for stream connections on `port` of the node's interface.
    ///
    /// The returned listener adopts one pool reference held by the caller
    /// and releases it when closed.
    ///
    /// # Errors
    ///
    /// Returns bind or start failures from the runtime, or
    /// [`Error::NodeNotFound`] if the owning pool is gone.
    pub async fn listen(&self, network: &str, port: u16) -> Result<PooledListener, Error> {
        let pool = self.pool()?;
        let inner = self.runtime.listen(network, port).await?;
        tracing::debug!(node = %self.name, network, port, "listening");
        Ok(PooledListener::new(self.name.clone(), inner, pool))
    }

    /// Binds a datagram socket at `addr` on the node.
    ///
    /// Like [`Self::listen`], the result adopts one pool reference.
    ///
    /// # Errors
    ///
    /// Returns bind or start failures from the runtime, or
    /// [`Error::NodeNotFound`] if the owning pool is gone.
    pub async fn listen_packet(
        &self,
        network: &str,
        addr: SocketAddr,
    ) -> Result<PooledPacketListener, Error> {
        let pool = self.pool()?;
        let inner = self.runtime.listen_packet(network, addr).await?;
        tracing::debug!(node = %self.name, network, %addr, "listening for packets");
        Ok(PooledPacketListener::new(self.name.clone(), inner, pool))
    }

    /// Stops the runtime. Only the first call reaches the runtime.
    ///
    /// # Errors
    ///
    /// Returns the runtime's shutdown failure.
    pub async fn teardown(&self) -> Result<(), Error> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.runtime.close().await
    }

    fn pool(&self) -> Result<Arc<NodePool>, Error> {
        self.pool
            .upgrade()
            .ok_or_else(|| Error::NodeNotFound(self.name.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use tokio_test::assert_ok;

    use super::*;
    use crate::testing::FakeRuntime;

    #[tokio::test]
    async fn teardown_reaches_runtime_once() {
        let runtime = FakeRuntime::new("web");
        let closes = runtime.closes();
        let handle = NodeHandle::new("web".to_string(), Arc::new(runtime), Weak::new());

        assert_ok!(handle.teardown().await);
        assert_ok!(handle.teardown().await);
        assert!(handle.is_torn_down());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listen_without_pool_fails() {
        let handle = NodeHandle::new(
            "web".to_string(),
            Arc::new(FakeRuntime::new("web")),
            Weak::new(),
        );
        let result = handle.listen("tcp", 80).await;
        assert!(matches!(result, Err(Error::NodeNotFound(name)) if name == "web"));
    }

    #[tokio::test]
    async fn accessors_delegate_to_runtime() {
        let runtime = FakeRuntime::new("www").with_domains(&["www.tailnet.ts.net"]);
        let handle = NodeHandle::new("web".to_string(), Arc::new(runtime), Weak::new());

        assert_eq!(handle.name(), "web");
        assert_eq!(handle.hostname(), "www");
        assert_eq!(handle.cert_domains(), vec!["www.tailnet.ts.net".to_string()]);
        let Ok(addresses) = handle.addresses().await else {
            panic!("status should succeed");
        };
        assert!(!addresses.is_empty());
    }
}
