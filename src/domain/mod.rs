//! Domain layer: node pool, node handles, addresses and domain matching.
//!
//! This module contains the reference-counted [`NodePool`] that owns the
//! lifecycle of every node, the [`NodeHandle`] wrapping one running node,
//! listener address parsing, and certificate domain matching.

pub mod address;
pub mod node_handle;
pub mod node_pool;
pub mod wildcard;

pub use address::NetworkAddress;
pub use node_handle::NodeHandle;
pub use node_pool::NodePool;
pub use wildcard::match_wildcard;
