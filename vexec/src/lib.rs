//! Host-side exec client.
//!
//! Resolves a guest target to its agent endpoint, opens a mutually
//! authenticated TLS connection, streams stdio, and exits with the remote
//! command's exact exit status.

pub mod client;
pub mod target;
pub mod terminal;
pub mod vsock;
