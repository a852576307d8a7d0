//! Tollgate HTTP server library.
//!
//! Exposes the control-plane core over a versioned REST API (`/api/v1`).
//! The binary in `main.rs` wires configuration, storage backends, and
//! background workers; everything routable lives here so integration
//! tests can drive the exact production router against in-memory fakes.

pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
