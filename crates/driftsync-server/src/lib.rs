//! Driftsync node runtime.
//!
//! This crate wraps the sans-IO logic of [`driftsync_core`] with real I/O:
//! a per-connection [`Transport`] that frames the byte stream, a [`Server`]
//! that owns shares and routes connections, and (in the binary) a Tokio TCP
//! accept loop plus the scan timer.
//!
//! The split mirrors the suspension points of the design: socket read
//! complete, socket write complete, and timer tick are the only places the
//! core is entered.

mod error;
mod server;
mod transport;

pub use error::ServerError;
pub use server::{ConnectionStatus, Server, ServerConfig};
pub use transport::Transport;
