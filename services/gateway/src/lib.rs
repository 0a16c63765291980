//! Gateway service library crate.
//!
//! Exposes the proxy subsystems (config, routing, TLS, listeners, sessions)
//! to the gateway binary and the integration tests. Each module covers one
//! feature area; nothing here is re-exported at the crate root.
pub mod config;
pub mod listener;
pub mod observability;
pub mod registry;
pub mod routes;
pub mod service;
pub mod session;
pub mod tls;
