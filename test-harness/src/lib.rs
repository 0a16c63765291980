// Shared helpers for the harness binaries and the gateway integration tests.
pub mod tls;
