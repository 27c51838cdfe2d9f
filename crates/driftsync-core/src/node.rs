//! Node and peer descriptors.
//!
//! `NodeInfo` is what this node advertises in `Start`/`Go`; `PeerInfo` is the
//! per-connection record of what the remote side advertised.

use driftsync_proto::Handshake;

/// Access level a peer holds on a share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// May read manifests and content and push updates
    ReadWrite,
    /// May read manifests and content only
    ReadOnly,
    /// May relay encrypted content without reading it
    Untrusted,
}

impl Access {
    /// Wire string for this access level.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadWrite => "read_write",
            Self::ReadOnly => "read_only",
            Self::Untrusted => "untrusted",
        }
    }

    /// Parse a wire access string. Unrecognized values degrade to the least
    /// privileged readable level.
    pub fn parse(s: &str) -> Self {
        match s {
            "read_write" => Self::ReadWrite,
            "untrusted" => Self::Untrusted,
            _ => Self::ReadOnly,
        }
    }
}

/// Identity this node advertises during the handshake.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Software identification string
    pub software: String,
    /// Protocol revision we speak
    pub protocol: u32,
    /// Feature strings we advertise
    pub features: Vec<String>,
    /// Human-readable node name
    pub name: String,
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self {
            software: concat!("driftsync ", env!("CARGO_PKG_VERSION")).to_string(),
            protocol: 1,
            features: Vec::new(),
            name: "driftsync".to_string(),
        }
    }
}

/// What the remote side advertised on this connection.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Remote per-share peer id (hex)
    pub peer_id: String,
    /// Remote node name
    pub name: String,
    /// Remote software string
    pub software: String,
    /// Remote protocol revision
    pub protocol: u32,
    /// Features the remote advertised
    pub features: Vec<String>,
    /// Access level the remote granted us
    pub access: Access,
}

impl PeerInfo {
    /// Record a peer from a received handshake.
    pub fn from_handshake(handshake: &Handshake) -> Self {
        Self {
            peer_id: handshake.peer.clone(),
            name: handshake.name.clone(),
            software: handshake.software.clone(),
            protocol: handshake.protocol,
            features: handshake.features.clone(),
            access: Access::parse(&handshake.access),
        }
    }
}
