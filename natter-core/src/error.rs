//! Failure taxonomy shared by discovery, links and sends.

use crate::model::PeerAddress;

/// Why a scan, connect or established link failed. Peer-scoped except `PermissionOrRadio`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("radio unavailable: {0}")]
    PermissionOrRadio(String),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("connect rejected: {0}")]
    ConnectRejected(String),
    #[error("framing error: {0}")]
    Framing(String),
    #[error("socket error: {0}")]
    SocketIo(String),
    #[error("not connected")]
    NotConnected,
}

impl LinkError {
    /// Classify an error from opening an outgoing socket.
    pub fn from_connect_io(e: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut => LinkError::ConnectTimeout,
            ErrorKind::PermissionDenied | ErrorKind::AddrNotAvailable => {
                LinkError::PermissionOrRadio(e.to_string())
            }
            _ => LinkError::ConnectRejected(e.to_string()),
        }
    }

    /// Error on an established link.
    pub fn from_io(e: &std::io::Error) -> Self {
        LinkError::SocketIo(e.to_string())
    }

    pub fn is_radio(&self) -> bool {
        matches!(self, LinkError::PermissionOrRadio(_))
    }
}

/// A specific send failed. The message stays in history marked Failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("not connected to {0}")]
    NotConnected(PeerAddress),
    #[error("send failed: {reason}")]
    Failed { reason: LinkError },
    #[error("invalid send: {0}")]
    InvalidInput(&'static str),
    #[error("messaging service is not running")]
    ServiceStopped,
}
