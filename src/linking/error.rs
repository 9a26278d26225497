use std::fmt;

use super::protocol::{DisconnectReason, ProtocolError};

/// Why a linking attempt did not reach `Linked`.
#[derive(Debug)]
pub enum LinkError {
    /// Every pairing-code request came back empty or failed.
    NegotiationExhausted,
    /// The connection closed for a reason that cannot be recovered from.
    /// `None` when the event stream ended without a reason.
    ConnectionLost(Option<DisconnectReason>),
    /// The watchdog fired before the connection opened.
    AttemptExpired,
    /// Code mode was requested without a phone number.
    MissingPhone,
    Protocol(ProtocolError),
    Io(std::io::Error),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegotiationExhausted => write!(f, "could not obtain a pairing code"),
            Self::ConnectionLost(Some(reason)) => write!(f, "connection lost: {reason}"),
            Self::ConnectionLost(None) => write!(f, "connection lost"),
            Self::AttemptExpired => write!(f, "linking attempt expired"),
            Self::MissingPhone => write!(f, "a phone number is required for code linking"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for LinkError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
