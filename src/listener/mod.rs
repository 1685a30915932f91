//! Listener layer: pooled wrappers, TLS termination and the factories that
//! create listeners on named nodes.

pub mod factory;
pub mod pooled;
pub mod tls;

pub use factory::{AnyListener, NETWORK_TCP, NETWORK_TLS, NETWORK_UDP, NodeListeners, http3_network};
pub use pooled::{PooledListener, PooledPacketListener};
pub use tls::{DEFAULT_HANDSHAKE_TIMEOUT, TlsListener};
