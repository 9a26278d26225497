//! Capability surface of the external protocol client.
//!
//! The engine never speaks the messaging protocol itself. It opens
//! connections through a [`ProtocolClient`], reads [`ConnectionUpdate`]s from
//! the returned channel, and asks the [`Connection`] for pairing codes.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

/// Coarse connection state reported by the protocol library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

/// Why the protocol library closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    LoggedOut,
    /// Connection lost or timed out (the library uses one code for both).
    ConnectionLost,
    MultideviceMismatch,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    Forbidden,
    UnavailableService,
    /// Sent right after a successful pairing; the session must be reopened.
    RestartRequired,
    Other(u16),
}

impl DisconnectReason {
    pub fn from_status(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::ConnectionLost,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::UnavailableService,
            515 => Self::RestartRequired,
            other => Self::Other(other),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::LoggedOut => 401,
            Self::Forbidden => 403,
            Self::ConnectionLost => 408,
            Self::MultideviceMismatch => 411,
            Self::ConnectionClosed => 428,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::UnavailableService => 503,
            Self::RestartRequired => 515,
            Self::Other(code) => *code,
        }
    }

    /// A pending attempt reopens on the same auth dir instead of failing.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RestartRequired)
    }

    /// A linked session may be reopened after these.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RestartRequired | Self::ConnectionLost | Self::ConnectionClosed | Self::UnavailableService
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "status {code}"),
            other => write!(f, "{:?} ({})", other, other.status_code()),
        }
    }
}

/// One `connection.update` from the protocol library.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionUpdate {
    pub connection: Option<ConnectionState>,
    /// A fresh pairing challenge.
    pub qr: Option<String>,
    pub last_disconnect: Option<DisconnectReason>,
    pub is_new_login: bool,
    /// Account identifier, known once the connection is open.
    pub account_id: Option<String>,
}

impl ConnectionUpdate {
    pub fn open(account_id: impl Into<String>) -> Self {
        Self {
            connection: Some(ConnectionState::Open),
            account_id: Some(account_id.into()),
            ..Default::default()
        }
    }

    pub fn challenge(qr: impl Into<String>) -> Self {
        Self {
            qr: Some(qr.into()),
            ..Default::default()
        }
    }

    pub fn closed(reason: DisconnectReason) -> Self {
        Self {
            connection: Some(ConnectionState::Close),
            last_disconnect: Some(reason),
            ..Default::default()
        }
    }
}

/// Browser identity presented to the platform, e.g. ("Windows", "Firefox").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserLabel {
    pub os: String,
    pub name: String,
}

impl BrowserLabel {
    pub fn new(os: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            name: name.into(),
        }
    }
}

impl Default for BrowserLabel {
    fn default() -> Self {
        Self::new("Windows", "Firefox")
    }
}

impl fmt::Display for BrowserLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub browser: BrowserLabel,
}

#[derive(Debug)]
pub enum ProtocolError {
    /// Could not start the connection.
    Spawn(std::io::Error),
    Io(std::io::Error),
    /// The connection is gone.
    Closed,
    /// The library answered with an error.
    Rejected(String),
    /// The library exposes no entry point for this operation.
    Unsupported(&'static str),
    Timeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "failed to start connection: {e}"),
            Self::Io(e) => write!(f, "connection I/O error: {e}"),
            Self::Closed => write!(f, "connection closed"),
            Self::Rejected(msg) => write!(f, "rejected: {msg}"),
            Self::Unsupported(op) => write!(f, "unsupported operation: {op}"),
            Self::Timeout => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// A live protocol connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Ask the library for a pairing code for `phone_digits`.
    ///
    /// `Ok(None)` means the library answered without a code.
    async fn request_pairing_code(&self, phone_digits: &str) -> Result<Option<String>, ProtocolError>;

    async fn close(&self) -> Result<(), ProtocolError>;

    async fn logout(&self) -> Result<(), ProtocolError>;
}

/// A freshly opened connection and its update stream.
pub struct OpenedConnection {
    pub handle: Arc<dyn Connection>,
    pub events: mpsc::Receiver<ConnectionUpdate>,
}

/// Opens connections whose credentials live in `auth_dir`.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn open(&self, auth_dir: &Path, options: &ConnectOptions) -> Result<OpenedConnection, ProtocolError>;
}
