//! Per-connection protocol state machine.
//!
//! The machine is pure in the transport sense: it consumes typed messages
//! and payload events, and returns [`ProtocolAction`]s for the transport to
//! execute. There are no callbacks into the transport and no sockets here;
//! time is passed in by the caller, which keeps every transition
//! deterministic under test.
//!
//! # States
//!
//! ```text
//!            InternalSendStart                Start
//! ┌─────────┐ ───────────────► ┌──────────┐ ◄─────── (listener stays in
//! │ Initial │                  │ Wait4Go  │           Initial until Start)
//! └─────────┘ ◄─ Start/Go ──── └──────────┘
//!      │                            │ Go
//!      ▼                            ▼
//! ┌───────────────────────────────────────┐
//! │               Connected               │◄──────────────┐
//! └───────────────────────────────────────┘               │
//!      │ Get (serving)          │ Update(partial=true)    │
//!      ▼                        ▼                         │
//! ┌─────────┐             ┌────────────┐  Update(partial=false)
//! │   Get   │── drained ─►│ GetUpdates │─────────────────┘
//! └─────────┘             └────────────┘
//! ```
//!
//! `Get` is left by the transport draining the outbound file, not by a
//! message; any message received while serving content is a protocol error.

use std::{
    collections::VecDeque,
    fs,
    io::{Read, Write},
    path::PathBuf,
    time::{Duration, Instant},
};

use driftsync_proto::{FileRecord, Handshake, Message, Update};
use sha2::{Digest, Sha256};

use crate::{
    errors::ProtocolError,
    node::{Access, NodeInfo, PeerInfo},
    share::{FetchPlan, RemoteOutcome, Share},
    time::now_isotime,
};

/// Bytes of file content per outbound payload chunk.
pub const PAYLOAD_BLOCK_SIZE: usize = 65536;

/// Shares available to a connection, keyed by share id.
pub type ShareMap = std::collections::HashMap<String, Share>;

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No peer message received yet
    Initial,
    /// Sent `Start`, awaiting `Go`
    Wait4Go,
    /// Steady state
    Connected,
    /// Receiving a multi-part `Update`
    GetUpdates,
    /// Streaming a file payload outbound
    Get,
}

/// Effects the transport must execute, in order.
#[derive(Debug)]
pub enum ProtocolAction {
    /// Encode and send a message frame
    Send(Message),
    /// Send one payload chunk; empty means the zero-length terminator
    SendChunk(Vec<u8>),
    /// Close the connection
    Close {
        /// Human-readable reason, for the log
        reason: String,
    },
}

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Keep-alive window advertised in our `Ping`s. We close after twice
    /// this long without inbound traffic.
    pub ping_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        let secs = u64::from(driftsync_proto::message::DEFAULT_PING_TIMEOUT);
        Self { ping_timeout: Duration::from_secs(secs) }
    }
}

/// Content arriving from the peer into quarantine.
struct RxTransfer {
    plan: FetchPlan,
    staged: PathBuf,
    file: fs::File,
    hasher: Sha256,
}

/// The per-connection state machine.
pub struct Protocol {
    node: NodeInfo,
    config: ProtocolConfig,
    state: State,
    /// Selected share id, set during the handshake
    share_id: Option<String>,
    /// What the remote side advertised
    peer: Option<PeerInfo>,
    /// Open source file while serving a `Get`
    tx_file: Option<fs::File>,
    /// Open quarantine sink while receiving content
    rx: Option<RxTransfer>,
    /// Fetches not yet issued; one `Get` is in flight at a time
    pending_fetches: VecDeque<FetchPlan>,
    /// The fetch we have asked for and not yet received
    inflight_fetch: Option<FetchPlan>,
    last_activity: Instant,
    last_ping_sent: Option<Instant>,
    /// Keep-alive window the peer advertised in its last `Ping`
    peer_timeout: Option<Duration>,
}

impl Protocol {
    /// New connection in [`State::Initial`].
    pub fn new(node: NodeInfo, now: Instant, config: ProtocolConfig) -> Self {
        Self {
            node,
            config,
            state: State::Initial,
            share_id: None,
            peer: None,
            tx_file: None,
            rx: None,
            pending_fetches: VecDeque::new(),
            inflight_fetch: None,
            last_activity: now,
            last_ping_sent: None,
            peer_timeout: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Remote identity, once the handshake recorded it.
    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.as_ref()
    }

    /// Share this connection is bound to.
    pub fn share_id(&self) -> Option<&str> {
        self.share_id.as_deref()
    }

    fn share<'a>(&self, shares: &'a mut ShareMap) -> Result<&'a mut Share, ProtocolError> {
        let id = self.share_id.clone().unwrap_or_default();
        shares.get_mut(&id).ok_or(ProtocolError::ShareNotFound(id))
    }

    fn handshake_for(&self, share: &Share) -> Handshake {
        Handshake {
            software: self.node.software.clone(),
            protocol: self.node.protocol,
            features: self.node.features.clone(),
            share_id: share.share_id().to_string(),
            // Granting by key class is not wired up; every accepted peer is
            // treated as read-write for now.
            access: Access::ReadWrite.as_str().to_string(),
            peer: share.peer_id().to_string(),
            name: self.node.name.clone(),
            time: now_isotime(),
        }
    }

    /// Process one inbound (or internally injected) message.
    pub fn handle_message(
        &mut self,
        message: Message,
        shares: &mut ShareMap,
        now: Instant,
    ) -> Result<Vec<ProtocolAction>, ProtocolError> {
        self.last_activity = now;

        if let Message::Unknown { raw } = &message {
            tracing::warn!(%raw, "peer sent unrecognized message kind");
        }

        match (self.state, message) {
            // Initiator: kick the conversation for a share.
            (State::Initial, Message::InternalSendStart { share_id }) => {
                self.share_id = Some(share_id.clone());
                let share = self.share(shares)?;
                let start = Message::Start(self.handshake_for(share));
                self.state = State::Wait4Go;
                Ok(vec![ProtocolAction::Send(start)])
            },

            // Listener: peer opens a share.
            (State::Initial, Message::Start(handshake)) => {
                self.share_id = Some(handshake.share_id.clone());
                match self.share(shares) {
                    Ok(share) => {
                        let go = Message::Go(self.handshake_for(share));
                        self.peer = Some(PeerInfo::from_handshake(&handshake));
                        self.state = State::Connected;
                        tracing::info!(
                            share_id = %handshake.share_id,
                            peer = %handshake.peer,
                            name = %handshake.name,
                            "peer connected"
                        );
                        Ok(vec![ProtocolAction::Send(go)])
                    },
                    Err(_) => {
                        tracing::warn!(share_id = %handshake.share_id, "start for unknown share");
                        Ok(vec![ProtocolAction::Send(Message::CannotStart), ProtocolAction::Close {
                            reason: format!("share {} not found", handshake.share_id),
                        }])
                    },
                }
            },

            // Initiator: accepted. Immediately ask for the manifest delta.
            (State::Wait4Go, Message::Go(handshake)) => {
                let started = self.share_id.clone().unwrap_or_default();
                if handshake.share_id != started {
                    return Err(ProtocolError::ShareIdMismatch {
                        started,
                        answered: handshake.share_id,
                    });
                }
                self.peer = Some(PeerInfo::from_handshake(&handshake));
                self.state = State::Connected;

                let since = self.share(shares)?.seen_vector()?;
                Ok(vec![ProtocolAction::Send(Message::GetUpdates { since })])
            },

            // Initiator: refused.
            (State::Wait4Go, Message::CannotStart) => {
                let share_id = self.share_id.clone().unwrap_or_default();
                Ok(vec![ProtocolAction::Close {
                    reason: format!("peer refused share {share_id}"),
                }])
            },

            (State::Connected, Message::Ping { timeout }) => {
                self.peer_timeout = Some(Duration::from_secs(u64::from(timeout)));
                Ok(Vec::new())
            },

            // Legacy no-op some older peers still emit after the handshake.
            (State::Connected, Message::Identity { .. }) => Ok(Vec::new()),

            (State::Connected, Message::Get { checksum }) => self.do_get(&checksum, shares),

            (State::Connected, Message::GetUpdates { since }) => {
                let requester =
                    self.peer.as_ref().map(|p| p.name.clone()).unwrap_or_default();
                let share = self.share(shares)?;
                let frozen = share.get_updates(&requester, &since)?;
                let update = Update {
                    revision: share.revision(),
                    partial: false,
                    files: frozen.into_records(),
                };
                Ok(vec![ProtocolAction::Send(Message::Update(update))])
            },

            (State::Connected | State::GetUpdates, Message::Update(update)) => {
                self.do_update(&update.files, shares)?;
                self.state = if update.partial { State::GetUpdates } else { State::Connected };
                Ok(self.maybe_issue_fetch())
            },

            // Reply to our Get: the peer does not have the content.
            (State::Connected, Message::NoSuchFile { checksum }) => {
                match self.inflight_fetch.take_if(|plan| plan.checksum == checksum) {
                    Some(plan) => {
                        tracing::warn!(
                            checksum = %plan.checksum,
                            path = %plan.path,
                            "peer has no content for scheduled fetch"
                        );
                        Ok(self.maybe_issue_fetch())
                    },
                    None => Err(ProtocolError::Unexpected {
                        state: self.state,
                        kind: "no_such_file",
                    }),
                }
            },

            // Reply to our Get: content follows as payload chunks.
            (State::Connected, Message::FileData { checksum }) => {
                let Some(plan) = self.inflight_fetch.take() else {
                    return Err(ProtocolError::Unexpected {
                        state: self.state,
                        kind: "file_data",
                    });
                };
                if plan.checksum != checksum {
                    return Err(ProtocolError::WrongFileData {
                        expected: plan.checksum,
                        got: checksum,
                    });
                }
                let (file, staged) = self.share(shares)?.quarantine_sink(&plan.checksum)?;
                self.rx = Some(RxTransfer { plan, staged, file, hasher: Sha256::new() });
                Ok(Vec::new())
            },

            (state, message) => {
                Err(ProtocolError::Unexpected { state, kind: message.kind() })
            },
        }
    }

    /// Serve a content request: first matching path wins, `NoSuchFile` when
    /// nothing non-stale matches.
    fn do_get(
        &mut self,
        checksum: &str,
        shares: &mut ShareMap,
    ) -> Result<Vec<ProtocolAction>, ProtocolError> {
        let share = self.share(shares)?;
        let matches = share.get_by_checksum(checksum)?;
        let Some(mfile) = matches.first() else {
            return Ok(vec![ProtocolAction::Send(Message::NoSuchFile {
                checksum: checksum.to_string(),
            })]);
        };

        let file = fs::File::open(share.fullpath(&mfile.path))?;
        self.tx_file = Some(file);
        self.state = State::Get;
        Ok(vec![ProtocolAction::Send(Message::FileData { checksum: checksum.to_string() })])
    }

    /// Apply a manifest delta and queue the fetches it implies.
    fn do_update(
        &mut self,
        records: &[FileRecord],
        shares: &mut ShareMap,
    ) -> Result<(), ProtocolError> {
        let share = self.share(shares)?;
        for record in records {
            match share.apply_remote_update(record)? {
                RemoteOutcome::Applied { fetch: Some(plan) }
                | RemoteOutcome::Conflict { fetch: plan } => {
                    self.pending_fetches.push_back(plan);
                },
                RemoteOutcome::Applied { fetch: None } | RemoteOutcome::Ignored => {},
            }
        }
        Ok(())
    }

    /// Issue the next queued `Get`, if nothing is in flight and we are not
    /// busy streaming.
    fn maybe_issue_fetch(&mut self) -> Vec<ProtocolAction> {
        if self.state != State::Connected
            || self.inflight_fetch.is_some()
            || self.rx.is_some()
        {
            return Vec::new();
        }
        let Some(plan) = self.pending_fetches.pop_front() else {
            return Vec::new();
        };
        let checksum = plan.checksum.clone();
        self.inflight_fetch = Some(plan);
        vec![ProtocolAction::Send(Message::Get { checksum })]
    }

    /// Payload bytes for the in-progress inbound transfer.
    pub fn handle_payload_chunk(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(ProtocolError::UnexpectedPayload);
        };
        rx.file.write_all(data)?;
        rx.hasher.update(data);
        Ok(())
    }

    /// The zero-length terminator arrived: verify and commit, or discard.
    pub fn handle_payload_end(
        &mut self,
        shares: &mut ShareMap,
    ) -> Result<Vec<ProtocolAction>, ProtocolError> {
        let Some(rx) = self.rx.take() else {
            return Err(ProtocolError::UnexpectedPayload);
        };

        let RxTransfer { plan, staged, mut file, hasher } = rx;
        file.flush()?;
        drop(file);

        let actual = hex::encode(hasher.finalize());
        if actual == plan.checksum {
            self.share(shares)?.commit_fetched(&staged, &plan)?;
        } else {
            // Recoverable: drop the quarantine file and move on; the peer
            // can be asked again on a later sync round.
            tracing::warn!(
                expected = %plan.checksum,
                %actual,
                path = %plan.path,
                "fetched content failed verification, discarding"
            );
            if let Err(e) = fs::remove_file(&staged) {
                tracing::debug!(staged = %staged.display(), error = %e, "discard failed");
            }
        }

        Ok(self.maybe_issue_fetch())
    }

    /// The transport drained its outbound queue; feed it more payload if a
    /// transfer is in progress.
    pub fn handle_outbound_drained(&mut self) -> Result<Vec<ProtocolAction>, ProtocolError> {
        if self.state != State::Get {
            return Ok(Vec::new());
        }
        let Some(file) = self.tx_file.as_mut() else {
            return Ok(Vec::new());
        };

        let mut buf = vec![0u8; PAYLOAD_BLOCK_SIZE];
        let n = file.read(&mut buf)?;
        if n > 0 {
            buf.truncate(n);
            return Ok(vec![ProtocolAction::SendChunk(buf)]);
        }

        // EOF: terminator, release the source, and resume the fetch queue.
        self.tx_file = None;
        self.state = State::Connected;
        let mut actions = vec![ProtocolAction::SendChunk(Vec::new())];
        actions.extend(self.maybe_issue_fetch());
        Ok(actions)
    }

    /// Periodic maintenance: keep-alive pings and the receive deadline.
    ///
    /// The receive deadline is twice the keep-alive window the peer last
    /// advertised (ours until it has advertised one).
    pub fn tick(&mut self, now: Instant) -> Vec<ProtocolAction> {
        let window = self.peer_timeout.unwrap_or(self.config.ping_timeout);
        let idle = now.duration_since(self.last_activity);
        if idle > window * 2 {
            return vec![ProtocolAction::Close {
                reason: format!("no traffic for {idle:?}"),
            }];
        }

        if matches!(self.state, State::Connected) {
            let due = match self.last_ping_sent {
                None => true,
                Some(sent) => now.duration_since(sent) >= self.config.ping_timeout,
            };
            if due {
                self.last_ping_sent = Some(now);
                return vec![ProtocolAction::Send(Message::Ping {
                    timeout: self.config.ping_timeout.as_secs() as u32,
                })];
            }
        }

        Vec::new()
    }

    /// Release scoped resources on connection teardown: the outbound source
    /// file and any half-received quarantine content.
    pub fn abort(&mut self) {
        self.tx_file = None;
        if let Some(rx) = self.rx.take() {
            drop(rx.file);
            if let Err(e) = fs::remove_file(&rx.staged) {
                tracing::debug!(staged = %rx.staged.display(), error = %e, "cleanup failed");
            }
        }
        self.inflight_fetch = None;
        self.pending_fetches.clear();
    }
}

impl Drop for Protocol {
    fn drop(&mut self) {
        self.abort();
    }
}
