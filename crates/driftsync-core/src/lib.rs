//! Core synchronization logic for driftsync.
//!
//! Everything here is sans-IO in the networking sense: the protocol state
//! machine consumes typed messages and returns actions for a transport to
//! execute, and the share index performs only the bounded filesystem and
//! database work the caller ticks it for. No sockets, no runtime.
//!
//! Modules:
//!
//! - [`vclock`]: per-file vector clocks deciding supersession vs conflict
//! - [`share`]: the indexed manifest with its scan/checksum pipeline
//! - [`protocol`]: the per-connection conversation state machine
//! - [`node`]: node and peer descriptors exchanged in the handshake

pub mod errors;
pub mod node;
pub mod protocol;
pub mod share;
pub mod time;
pub mod vclock;

pub use errors::{ProtocolError, ShareError};
pub use node::{Access, NodeInfo, PeerInfo};
pub use protocol::{Protocol, ProtocolAction, ProtocolConfig, ShareMap, State};
pub use share::{FetchPlan, FrozenManifest, MFile, RemoteOutcome, Share};
pub use vclock::VClock;
