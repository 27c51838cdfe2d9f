//! Server error types.

use std::fmt;

use driftsync_core::ShareError;

/// Errors that can occur in the server surface.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, bad share path, etc.).
    ///
    /// These are fatal errors that prevent startup. Fix configuration and
    /// restart.
    Config(String),

    /// The referenced connection id is not registered.
    ///
    /// Usually a race between socket teardown and a late event; safe to
    /// ignore at the caller after logging.
    UnknownConnection(u64),

    /// The referenced share id is not attached on this node.
    UnknownShare(String),

    /// Failure in a share's database or filesystem.
    Share(ShareError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::UnknownConnection(id) => write!(f, "unknown connection {id}"),
            Self::UnknownShare(id) => write!(f, "unknown share {id}"),
            Self::Share(err) => write!(f, "share error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Share(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ShareError> for ServerError {
    fn from(err: ShareError) -> Self {
        Self::Share(err)
    }
}
