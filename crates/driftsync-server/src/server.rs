//! Server surface: owns the shares and the connections.
//!
//! The server routes inbound bytes to the right protocol instance and
//! executes the actions that come back. Everything here is synchronous;
//! the async runtime in `main` drives it from socket reads, write
//! completions, and timers, the three suspension points of the design.
//!
//! A connection dies when framing breaks, a message cannot be decoded, or
//! the protocol reports a violation; the faulting connection is removed and
//! every other connection (and the shares) carries on.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Instant,
};

use driftsync_core::{
    NodeInfo, Protocol, ProtocolAction, Share, ShareMap,
    protocol::ProtocolConfig,
};
use driftsync_proto::{FrameEvent, Message, decode_message};

use crate::{error::ServerError, transport::Transport};

/// Server configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Per-connection protocol tunables
    pub protocol: ProtocolConfig,
    /// Maximum concurrent connections; 0 means unlimited
    pub max_connections: usize,
}

/// Whether a connection survived the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Still registered and usable
    Open,
    /// Removed; the socket should be dropped
    Closed,
}

/// One peer connection: protocol state machine plus transport driver.
struct Connection {
    protocol: Protocol,
    transport: Transport,
}

/// A driftsync node: shares by id, connections by id.
pub struct Server {
    node: NodeInfo,
    config: ServerConfig,
    shares: ShareMap,
    connections: HashMap<u64, Connection>,
    /// Farewell bytes (e.g. `CannotStart`) queued by a connection that has
    /// already been closed; the socket layer drains these before dropping
    /// the socket.
    parting: HashMap<u64, std::collections::VecDeque<Vec<u8>>>,
    next_connection_id: u64,
}

impl Server {
    /// New server with no shares and no connections.
    pub fn new(node: NodeInfo, config: ServerConfig) -> Self {
        Self {
            node,
            config,
            shares: ShareMap::new(),
            connections: HashMap::new(),
            parting: HashMap::new(),
            next_connection_id: 1,
        }
    }

    /// Attach a directory as a share. Identity is created on first attach
    /// and read back from `db_path` afterwards. Returns the share id.
    pub fn attach_share(
        &mut self,
        path: &Path,
        db_path: Option<&PathBuf>,
    ) -> Result<String, ServerError> {
        let share = Share::open(path, db_path.map(PathBuf::as_path))?;
        let share_id = share.share_id().to_string();
        tracing::info!(%share_id, path = %path.display(), "share attached");
        self.shares.insert(share_id.clone(), share);
        Ok(share_id)
    }

    /// Detach a share. Connections bound to it will fail their next lookup
    /// with `ShareNotFound` and close.
    pub fn detach_share(&mut self, share_id: &str) -> bool {
        let removed = self.shares.remove(share_id).is_some();
        if removed {
            tracing::info!(share_id, "share detached");
        }
        removed
    }

    /// Attached share ids.
    pub fn share_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shares.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// A share by id.
    pub fn share(&self, share_id: &str) -> Option<&Share> {
        self.shares.get(share_id)
    }

    /// Mutable access to a share, for scan driving and tests.
    pub fn share_mut(&mut self, share_id: &str) -> Option<&mut Share> {
        self.shares.get_mut(share_id)
    }

    /// Register a new connection. `None` when the connection limit is hit;
    /// the caller should drop the socket.
    pub fn add_connection(&mut self, now: Instant) -> Option<u64> {
        if self.config.max_connections != 0
            && self.connections.len() >= self.config.max_connections
        {
            tracing::warn!("connection limit reached, refusing");
            return None;
        }

        let id = self.next_connection_id;
        self.next_connection_id += 1;
        self.connections.insert(id, Connection {
            protocol: Protocol::new(self.node.clone(), now, self.config.protocol.clone()),
            transport: Transport::new(),
        });
        tracing::debug!(connection = id, "connection registered");
        Some(id)
    }

    /// Remove a connection (socket closed or errored), releasing any
    /// in-flight transfer resources and discarding undelivered bytes.
    pub fn remove_connection(&mut self, id: u64) {
        self.parting.remove(&id);
        if let Some(mut conn) = self.connections.remove(&id) {
            conn.protocol.abort();
            tracing::debug!(connection = id, "connection removed");
        }
    }

    /// Close a connection but keep its already-queued outbound bytes
    /// available via [`Server::take_outbound`] for a final flush.
    fn close_connection(&mut self, id: u64) {
        if let Some(mut conn) = self.connections.remove(&id) {
            conn.protocol.abort();
            let mut farewell = std::collections::VecDeque::new();
            while let Some(bytes) = conn.transport.next_write() {
                farewell.push_back(bytes);
            }
            if !farewell.is_empty() {
                self.parting.insert(id, farewell);
            }
            tracing::debug!(connection = id, "connection closed");
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Kick an outbound connection: emit `Start` for `share_id`.
    pub fn connect_share(
        &mut self,
        id: u64,
        share_id: &str,
        now: Instant,
    ) -> Result<ConnectionStatus, ServerError> {
        if !self.shares.contains_key(share_id) {
            return Err(ServerError::UnknownShare(share_id.to_string()));
        }
        let kick = Message::InternalSendStart { share_id: share_id.to_string() };
        self.dispatch_message(id, kick, now)
    }

    /// Feed bytes read from a connection's socket.
    pub fn connection_input(
        &mut self,
        id: u64,
        bytes: &[u8],
        now: Instant,
    ) -> Result<ConnectionStatus, ServerError> {
        let events = {
            let conn =
                self.connections.get_mut(&id).ok_or(ServerError::UnknownConnection(id))?;
            conn.transport.ingest(bytes)
        };

        for event in events {
            if self.handle_frame_event(id, event, now)? == ConnectionStatus::Closed {
                return Ok(ConnectionStatus::Closed);
            }
        }
        Ok(ConnectionStatus::Open)
    }

    /// Next buffer to write on this connection's socket. Farewell bytes of
    /// a just-closed connection drain here too.
    pub fn take_outbound(&mut self, id: u64) -> Option<Vec<u8>> {
        if let Some(conn) = self.connections.get_mut(&id) {
            return conn.transport.next_write();
        }
        let farewell = self.parting.get_mut(&id)?;
        let bytes = farewell.pop_front();
        if farewell.is_empty() {
            self.parting.remove(&id);
        }
        bytes
    }

    /// True when the connection has bytes waiting to be written.
    pub fn has_outbound(&self, id: u64) -> bool {
        self.connections.get(&id).is_some_and(|conn| !conn.transport.is_drained())
            || self.parting.contains_key(&id)
    }

    /// The socket finished writing and the queue is empty: let the protocol
    /// pump the next payload chunk if a transfer is in progress.
    pub fn on_write_complete(&mut self, id: u64) -> Result<ConnectionStatus, ServerError> {
        let pumped = {
            let conn =
                self.connections.get_mut(&id).ok_or(ServerError::UnknownConnection(id))?;
            if !conn.transport.is_drained() {
                return Ok(ConnectionStatus::Open);
            }
            conn.protocol.handle_outbound_drained()
        };

        match pumped {
            Ok(actions) => self.apply_actions(id, actions),
            Err(e) => {
                tracing::warn!(connection = id, error = %e, "payload pump failed");
                self.close_connection(id);
                Ok(ConnectionStatus::Closed)
            },
        }
    }

    /// Periodic per-connection maintenance (keep-alive).
    pub fn tick_connection(
        &mut self,
        id: u64,
        now: Instant,
    ) -> Result<ConnectionStatus, ServerError> {
        let conn =
            self.connections.get_mut(&id).ok_or(ServerError::UnknownConnection(id))?;
        let actions = conn.protocol.tick(now);
        self.apply_actions(id, actions)
    }

    /// Step every in-progress share scan by one bounded tick.
    pub fn scan_step_shares(&mut self) {
        for share in self.shares.values_mut() {
            if share.scan_in_progress() {
                if let Err(e) = share.scan_step() {
                    tracing::warn!(share_id = share.share_id(), error = %e, "scan step failed");
                }
            }
        }
    }

    /// Begin a scan on every share that is not already scanning.
    pub fn start_scans(&mut self) {
        for share in self.shares.values_mut() {
            if !share.scan_in_progress() {
                share.scan();
            }
        }
    }

    /// Route one frame event into the connection's protocol.
    fn handle_frame_event(
        &mut self,
        id: u64,
        event: FrameEvent,
        now: Instant,
    ) -> Result<ConnectionStatus, ServerError> {
        match event {
            FrameEvent::Message { body, signature, .. } => {
                if signature.is_some() {
                    // Key exchange is not wired up, so nothing can verify
                    // a signature yet; the message is processed unsigned.
                    tracing::debug!(connection = id, "ignoring frame signature");
                }
                match decode_message(&body) {
                    Ok(message) => self.dispatch_message(id, message, now),
                    Err(e) => {
                        tracing::warn!(connection = id, error = %e, "undecodable message");
                        self.close_connection(id);
                        Ok(ConnectionStatus::Closed)
                    },
                }
            },

            FrameEvent::PayloadChunk(chunk) => {
                let written = {
                    let conn = self
                        .connections
                        .get_mut(&id)
                        .ok_or(ServerError::UnknownConnection(id))?;
                    conn.protocol.handle_payload_chunk(&chunk)
                };
                match written {
                    Ok(()) => Ok(ConnectionStatus::Open),
                    Err(e) => {
                        tracing::warn!(connection = id, error = %e, "payload rejected");
                        self.close_connection(id);
                        Ok(ConnectionStatus::Closed)
                    },
                }
            },

            FrameEvent::PayloadEnd => {
                let finished = {
                    let Self { connections, shares, .. } = self;
                    let conn =
                        connections.get_mut(&id).ok_or(ServerError::UnknownConnection(id))?;
                    conn.protocol.handle_payload_end(shares)
                };
                match finished {
                    Ok(actions) => self.apply_actions(id, actions),
                    Err(e) => {
                        tracing::warn!(connection = id, error = %e, "payload end rejected");
                        self.close_connection(id);
                        Ok(ConnectionStatus::Closed)
                    },
                }
            },

            FrameEvent::Garbage(junk) => {
                tracing::warn!(connection = id, bytes = junk.len(), "unparseable frame bytes");
                self.close_connection(id);
                Ok(ConnectionStatus::Closed)
            },
        }
    }

    /// Hand a decoded message to the protocol and execute its actions.
    fn dispatch_message(
        &mut self,
        id: u64,
        message: Message,
        now: Instant,
    ) -> Result<ConnectionStatus, ServerError> {
        let handled = {
            let Self { connections, shares, .. } = self;
            let conn = connections.get_mut(&id).ok_or(ServerError::UnknownConnection(id))?;
            conn.protocol.handle_message(message, shares, now)
        };

        match handled {
            Ok(actions) => self.apply_actions(id, actions),
            Err(e) => {
                tracing::warn!(connection = id, error = %e, "protocol error, closing");
                self.close_connection(id);
                Ok(ConnectionStatus::Closed)
            },
        }
    }

    /// Execute protocol actions against the connection's transport.
    fn apply_actions(
        &mut self,
        id: u64,
        actions: Vec<ProtocolAction>,
    ) -> Result<ConnectionStatus, ServerError> {
        for action in actions {
            let conn =
                self.connections.get_mut(&id).ok_or(ServerError::UnknownConnection(id))?;
            match action {
                ProtocolAction::Send(message) => {
                    if let Err(e) = conn.transport.queue_message(&message) {
                        tracing::error!(connection = id, error = %e, "encode failed");
                        self.close_connection(id);
                        return Ok(ConnectionStatus::Closed);
                    }
                },
                ProtocolAction::SendChunk(chunk) => conn.transport.queue_chunk(&chunk),
                ProtocolAction::Close { reason } => {
                    tracing::info!(connection = id, %reason, "closing connection");
                    self.close_connection(id);
                    return Ok(ConnectionStatus::Closed);
                },
            }
        }
        Ok(ConnectionStatus::Open)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("shares", &self.shares.len())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_and_detach_share() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::new(NodeInfo::default(), ServerConfig::default());

        let share_id = server.attach_share(dir.path(), None).unwrap();
        assert_eq!(server.share_ids(), vec![share_id.clone()]);
        assert!(server.share(&share_id).is_some());

        assert!(server.detach_share(&share_id));
        assert!(!server.detach_share(&share_id));
        assert!(server.share(&share_id).is_none());
    }

    #[test]
    fn connection_limit_is_enforced() {
        let mut server = Server::new(NodeInfo::default(), ServerConfig {
            max_connections: 2,
            ..ServerConfig::default()
        });

        let now = Instant::now();
        assert!(server.add_connection(now).is_some());
        assert!(server.add_connection(now).is_some());
        assert!(server.add_connection(now).is_none());
        assert_eq!(server.connection_count(), 2);
    }

    #[test]
    fn garbage_input_closes_the_connection() {
        let mut server = Server::new(NodeInfo::default(), ServerConfig::default());
        let now = Instant::now();
        let id = server.add_connection(now).unwrap();

        let status = server.connection_input(id, b"not a frame at all", now).unwrap();
        assert_eq!(status, ConnectionStatus::Closed);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn connect_share_requires_an_attached_share() {
        let mut server = Server::new(NodeInfo::default(), ServerConfig::default());
        let now = Instant::now();
        let id = server.add_connection(now).unwrap();

        let result = server.connect_share(id, "deadbeef", now);
        assert!(matches!(result, Err(ServerError::UnknownShare(_))));
    }
}
