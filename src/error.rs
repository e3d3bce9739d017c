//! Hub error taxonomy.
//!
//! Every fallible path in the hub returns `Result<T, HubError>`. The variant
//! a function returns maps directly onto the action a caller at a protocol
//! boundary takes: a close code on a client socket, a reconnect schedule on
//! a bootstrap link, or a logged drop with no reply.

use crate::peer_id::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Bad frame, bad peerId, oversized payload.
    #[error("protocol violation: {reason}")]
    Protocol { reason: String },

    /// Accept over `maxConnections`, or a duplicate active peerId.
    #[error("capacity violation: {reason}")]
    Capacity { reason: String },

    /// Socket I/O failure on a client, bootstrap, or overlay link.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// Signaling directed at an unknown target with no forwarding option.
    #[error("routing error: no path to {target}")]
    Routing { target: PeerId },

    /// Attempt to mutate state that is immutable while the hub is running.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// Migration completed but the overlay subsequently lost quorum.
    #[error("overlay unavailable: {reason}")]
    OverlayUnavailable { reason: String },
}

impl HubError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol { reason: reason.into() }
    }

    pub fn capacity(reason: impl Into<String>) -> Self {
        Self::Capacity { reason: reason.into() }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport { reason: reason.into() }
    }

    pub fn routing(target: PeerId) -> Self {
        Self::Routing { target }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config { reason: reason.into() }
    }

    pub fn overlay_unavailable(reason: impl Into<String>) -> Self {
        Self::OverlayUnavailable { reason: reason.into() }
    }

    /// The WebSocket close code this error maps to, per the wire spec's
    /// close-code table. `None` means the error never closes a socket
    /// (e.g. a routing drop just gets logged).
    pub fn close_code(&self) -> Option<u16> {
        match self {
            HubError::Protocol { .. } => Some(1008),
            HubError::Capacity { .. } => Some(1008),
            HubError::Transport { .. } => Some(1006),
            HubError::Routing { .. } => None,
            HubError::Config { .. } => None,
            HubError::OverlayUnavailable { .. } => None,
        }
    }
}

pub type HubResult<T> = Result<T, HubError>;
