//! Core library for `ZVault`.
//!
//! Contains the encryption barrier, Shamir seal/unseal, the root token,
//! storage-lock leader election, the cluster identity (key, self-signed
//! certificate, trust pool), and the mutual-TLS cluster transport used to
//! forward requests from standbys to the active node. [`Core`] ties these
//! together into one node's lifecycle.
//!
//! This crate depends on `zvault-storage` for the storage and lock traits
//! and knows nothing about HTTP routing for clients; the server crate owns
//! that.

pub mod barrier;
pub mod cluster;
pub mod crypto;
pub mod error;
pub mod ha;
pub mod logical;
pub mod node;
pub mod seal;
pub mod token;
pub mod transport;

pub use cluster::{Cluster, ClusterIdentity, ClusterInfo};
pub use error::CoreError;
pub use ha::HaTiming;
pub use logical::{LogicalHandler, Operation, PassthroughBackend, Request, Response};
pub use node::{Core, CoreConfig, InitResponse, LeaderStatus, NodeState};
pub use seal::SealStatus;
pub use transport::{ClusterListeners, ListenerProvider, PortOffsetListenerProvider};
