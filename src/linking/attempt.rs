//! Data model of a single linking attempt.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// How the user authenticates the new device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkMode {
    /// Numeric pairing code typed on the phone.
    Code,
    /// QR image scanned with the phone.
    Qr,
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkMode::Code => write!(f, "code"),
            LinkMode::Qr => write!(f, "qr"),
        }
    }
}

/// Attempt lifecycle. `Linked`, `Failed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Created,
    AwaitingCredential,
    Authenticating,
    Linked,
    Failed,
    Expired,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::AwaitingCredential => "AWAITING_CREDENTIAL",
            Self::Authenticating => "AUTHENTICATING",
            Self::Linked => "LINKED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        };
        f.write_str(name)
    }
}

/// `sub-<unix ms>-<6 hex>`, unique per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate(now: DateTime<Utc>) -> Self {
        let suffix = rand::random::<u32>() & 0x00ff_ffff;
        Self(format!("sub-{}-{suffix:06x}", now.timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the router hands to the orchestrator.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    /// Cooldown key.
    pub user_id: String,
    pub chat_id: i64,
    /// Message to quote in replies.
    pub reply_to: Option<i64>,
    pub mode: LinkMode,
    /// Digits only. Required for code mode.
    pub phone: Option<String>,
}

/// One in-flight attempt.
#[derive(Debug, Clone)]
pub struct LinkingAttempt {
    pub session_id: SessionId,
    pub mode: LinkMode,
    /// Owned by this attempt until committed or destroyed.
    pub auth_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: AttemptState,
}

impl LinkingAttempt {
    pub fn new(
        session_id: SessionId,
        mode: LinkMode,
        auth_root: &Path,
        now: DateTime<Utc>,
        budget: Duration,
    ) -> Self {
        let auth_dir = auth_root.join(session_id.as_str());
        let budget = TimeDelta::from_std(budget).unwrap_or(TimeDelta::MAX);
        Self {
            session_id,
            mode,
            auth_dir,
            created_at: now,
            expires_at: now.checked_add_signed(budget).unwrap_or(now),
            state: AttemptState::Created,
        }
    }
}
