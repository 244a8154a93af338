//! Interactive Smartlog server: launcher, HTTP/WebSocket surface, and the
//! per-connection message router.
//!
//! The `run-proxy` binary is a thin wrapper over this crate; the pieces are
//! exposed as a library so integration tests can drive the axum app and the
//! launcher logic in-process.

pub mod assets;
pub mod child;
pub mod cli;
pub mod connection;
pub mod launcher;
pub mod server;
