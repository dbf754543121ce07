//! `ZVault` HTTP server.
//!
//! Wires the core library and in-memory storage into a running Axum server.
//! Serves the operator routes at `/v1/sys/*` and logical requests at
//! `/v1/*`; the node's cluster listener runs on the next port up.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
