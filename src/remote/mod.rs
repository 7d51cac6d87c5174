//! The distributed remote filesystem: a replicated content-addressed store
//! keyed by `(u64 hash, name)`, sharded across a consistent-hash ring.
//!
//! Submodules:
//! - [`ring`]: token ownership of the 64-bit hash space and its invariants
//! - [`cluster`]: one node's membership, placement and persistence logic
//! - [`proto`]: wire messages and framing
//! - [`server`] / [`client`]: the two ends of the framed TCP protocol
//! - [`store`]: node-local object storage

pub mod client;
pub mod cluster;
pub mod proto;
pub mod ring;
pub mod server;
pub mod store;

pub use client::{Client, RemoteError};
pub use cluster::{Cluster, ClusterOptions};
pub use ring::{Ring, RingError, verify_ranges};
pub use server::Server;
pub use store::Store;
