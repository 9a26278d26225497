use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use teloxide::types::ChatId;

use crate::linking::{BrowserLabel, LinkSettings};

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    /// Chats allowed to request links. Empty means any chat.
    #[serde(default)]
    allowed_chats: Vec<i64>,
    log_chat_id: Option<i64>,
    /// Directory for state files (logs, sessions). Defaults to current directory.
    data_dir: Option<String>,
    /// Defaults to `<data_dir>/sessions`.
    sessions_dir: Option<String>,
    #[serde(default)]
    bridge: BridgeFile,
    #[serde(default)]
    linking: LinkingFile,
}

#[derive(Deserialize)]
struct BridgeFile {
    #[serde(default = "default_bridge_command")]
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

impl Default for BridgeFile {
    fn default() -> Self {
        Self {
            command: default_bridge_command(),
            args: Vec::new(),
        }
    }
}

fn default_bridge_command() -> String {
    "subbot-bridge".to_string()
}

#[derive(Deserialize)]
#[serde(default)]
struct LinkingFile {
    cooldown_secs: u64,
    restart_window_secs: u64,
    code_expiry_secs: u64,
    qr_expiry_secs: u64,
    expiry_grace_secs: u64,
    pairing_attempts: u32,
    pairing_interval_ms: u64,
    pairing_warmup_ms: u64,
    max_reconnects: u32,
    restart_after_cooldown: bool,
    qr_max_size: u32,
    /// `[os, browser]`
    browser: Vec<String>,
}

impl Default for LinkingFile {
    fn default() -> Self {
        Self {
            cooldown_secs: 30,
            restart_window_secs: 3,
            code_expiry_secs: 45,
            qr_expiry_secs: 60,
            expiry_grace_secs: 2,
            pairing_attempts: 6,
            pairing_interval_ms: 800,
            pairing_warmup_ms: 1200,
            max_reconnects: 2,
            restart_after_cooldown: true,
            qr_max_size: 512,
            browser: vec!["Windows".to_string(), "Firefox".to_string()],
        }
    }
}

impl LinkingFile {
    fn into_settings(self) -> Result<LinkSettings, ConfigError> {
        if self.cooldown_secs == 0 {
            return Err(ConfigError::Validation("linking.cooldown_secs must be positive".into()));
        }
        if self.restart_after_cooldown && self.restart_window_secs >= self.cooldown_secs {
            return Err(ConfigError::Validation(
                "linking.restart_window_secs must be shorter than linking.cooldown_secs".into(),
            ));
        }
        if self.code_expiry_secs == 0 || self.qr_expiry_secs == 0 {
            return Err(ConfigError::Validation("linking expiry windows must be positive".into()));
        }
        if self.pairing_attempts == 0 {
            return Err(ConfigError::Validation("linking.pairing_attempts must be at least 1".into()));
        }
        if self.qr_max_size < 64 {
            return Err(ConfigError::Validation("linking.qr_max_size must be at least 64".into()));
        }
        let browser = match self.browser.as_slice() {
            [os, name] if !os.trim().is_empty() && !name.trim().is_empty() => BrowserLabel::new(os.trim(), name.trim()),
            _ => {
                return Err(ConfigError::Validation(
                    "linking.browser must be [os, browser], e.g. [\"Windows\", \"Firefox\"]".into(),
                ));
            }
        };

        Ok(LinkSettings {
            cooldown: Duration::from_secs(self.cooldown_secs),
            restart_window: Duration::from_secs(self.restart_window_secs),
            code_expiry: Duration::from_secs(self.code_expiry_secs),
            qr_expiry: Duration::from_secs(self.qr_expiry_secs),
            expiry_grace: Duration::from_secs(self.expiry_grace_secs),
            pairing_attempts: self.pairing_attempts,
            pairing_interval: Duration::from_millis(self.pairing_interval_ms),
            pairing_warmup: Duration::from_millis(self.pairing_warmup_ms),
            max_reconnects: self.max_reconnects,
            restart_after_cooldown: self.restart_after_cooldown,
            qr_max_size: self.qr_max_size,
            browser,
        })
    }
}

/// Helper process that speaks the messaging protocol for us.
pub struct BridgeConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
}

pub struct Config {
    /// Path to the config file
    pub config_path: PathBuf,
    pub telegram_bot_token: String,
    pub allowed_chats: HashSet<ChatId>,
    pub log_chat_id: Option<ChatId>,
    /// Directory for state files (logs).
    pub data_dir: PathBuf,
    /// Holds `sessions.json`, `cooldowns.json` and the auth directories.
    pub sessions_dir: PathBuf,
    pub bridge: BridgeConfig,
    pub linking: LinkSettings,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }

        if file.bridge.command.trim().is_empty() {
            return Err(ConfigError::Validation("bridge.command must not be empty".into()));
        }

        let linking = file.linking.into_settings()?;

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let sessions_dir = file
            .sessions_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("sessions"));

        Ok(Self {
            config_path,
            telegram_bot_token: file.telegram_bot_token,
            allowed_chats: file.allowed_chats.into_iter().map(ChatId).collect(),
            log_chat_id: file.log_chat_id.map(ChatId),
            data_dir,
            sessions_dir,
            bridge: BridgeConfig {
                command: PathBuf::from(file.bridge.command),
                args: file.bridge.args,
            },
            linking,
        })
    }

    /// Empty `allowed_chats` allows every chat.
    pub fn is_allowed_chat(&self, chat_id: ChatId) -> bool {
        self.allowed_chats.is_empty() || self.allowed_chats.contains(&chat_id)
    }
}
