// Library root for the gavel auction server.
// Exposes modules for use by integration tests and the binary entry point.

pub mod config;
pub mod protocol;
pub mod session;
pub mod ws_server;
