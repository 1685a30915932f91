//! # tsnet-mux
//!
//! Runs several tailnet nodes inside one process and hands out TCP, TLS and
//! UDP listeners on them by node name.
//!
//! Nodes are started lazily the first time a listener asks for them and
//! shut down when the last listener on them closes. TLS certificates are
//! fetched from the node that owns the requested server name, so each node
//! serves its own identity.
//!
//! ## Architecture
//!
//! ```text
//! Host (listener registration, certificate manager)
//!     │
//!     ├── NodeListeners (listener/)   tailscale, tailscale+tls, tailscale/udp
//!     ├── CertDialer (routing)        SNI → node local API
//!     │
//!     ├── NodePool (domain/)          name → (NodeHandle, refcount)
//!     ├── ConfigResolver (config)     per-node settings
//!     │
//!     └── NodeLauncher / NodeRuntime (runtime/)
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod listener;
pub mod routing;
pub mod runtime;

#[cfg(test)]
mod testing;

pub use config::{ConfigResolver, NodeConfig, NodeSettings, TailscaleConfig};
pub use domain::{NodeHandle, NodePool};
pub use error::{ConfigError, Error};
pub use listener::{AnyListener, NodeListeners};
pub use routing::{CertDialer, ClientHelloInfo};
