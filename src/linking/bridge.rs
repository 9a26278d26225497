//! Protocol client backed by a helper process speaking JSON lines.
//!
//! One helper process is spawned per connection:
//!
//! ```text
//! <command> <args...> --auth-dir <dir> --browser <os>,<name>
//! ```
//!
//! The helper owns the protocol library and the auth-state files in
//! `<dir>`. Its first stdout line must be a hello listing the capability
//! entry points it exposes:
//!
//! ```text
//! {"type":"hello","capabilities":["request_pairing_code","signal.request_pairing_code"]}
//! ```
//!
//! After that it writes `connection.update`, `pairing_code`, `error` and
//! `creds.update` events, and reads `request_pairing_code`, `logout` and
//! `close` commands on stdin.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{
    ConnectOptions, Connection, ConnectionState, ConnectionUpdate, DisconnectReason, OpenedConnection,
    ProtocolClient, ProtocolError,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Where the helper routes a pairing-code request inside the protocol library.
///
/// Chosen once from the hello, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingEntry {
    Primary,
    Signal,
    Socket,
}

impl PairingEntry {
    const PRIORITY: [PairingEntry; 3] = [Self::Primary, Self::Signal, Self::Socket];

    pub fn capability(&self) -> &'static str {
        match self {
            Self::Primary => "request_pairing_code",
            Self::Signal => "signal.request_pairing_code",
            Self::Socket => "ws.request_pairing_code",
        }
    }

    pub fn select(capabilities: &[String]) -> Option<Self> {
        Self::PRIORITY
            .into_iter()
            .find(|entry| capabilities.iter().any(|c| c == entry.capability()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum BridgeEvent {
    #[serde(rename = "hello")]
    Hello {
        #[serde(default)]
        capabilities: Vec<String>,
    },
    #[serde(rename = "connection.update")]
    ConnectionUpdate(RawUpdate),
    #[serde(rename = "pairing_code")]
    PairingCode {
        id: u64,
        #[serde(default)]
        code: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        id: Option<u64>,
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "creds.update")]
    CredsUpdate,
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUpdate {
    #[serde(default)]
    connection: Option<ConnectionState>,
    #[serde(default)]
    qr: Option<String>,
    #[serde(default)]
    last_disconnect: Option<RawDisconnect>,
    #[serde(default)]
    is_new_login: bool,
    #[serde(default)]
    account_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDisconnect {
    #[serde(default)]
    status_code: Option<u16>,
}

impl From<RawUpdate> for ConnectionUpdate {
    fn from(raw: RawUpdate) -> Self {
        ConnectionUpdate {
            connection: raw.connection,
            qr: raw.qr.filter(|q| !q.is_empty()),
            last_disconnect: raw
                .last_disconnect
                .map(|d| DisconnectReason::from_status(d.status_code.unwrap_or(0))),
            is_new_login: raw.is_new_login,
            account_id: raw.account_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    RequestPairingCode {
        id: u64,
        phone: &'a str,
        entry: &'static str,
    },
    Logout,
    Close,
}

type PendingReplies = Mutex<HashMap<u64, oneshot::Sender<Result<Option<String>, String>>>>;

/// Spawns the configured helper for every connection.
pub struct BridgeClient {
    command: PathBuf,
    args: Vec<String>,
}

impl BridgeClient {
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn open(&self, auth_dir: &Path, options: &ConnectOptions) -> Result<OpenedConnection, ProtocolError> {
        let label = auth_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bridge".to_string());

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg("--auth-dir")
            .arg(auth_dir)
            .arg("--browser")
            .arg(format!("{},{}", options.browser.os, options.browser.name))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ProtocolError::Spawn)?;

        info!("🔌 [{label}] Bridge started (PID {:?})", child.id());

        let stdin = child.stdin.take().ok_or(ProtocolError::Closed)?;
        let stdout = child.stdout.take().ok_or(ProtocolError::Closed)?;
        if let Some(stderr) = child.stderr.take() {
            let label = label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{label}] bridge: {line}");
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        let capabilities = match timeout(HANDSHAKE_TIMEOUT, read_hello(&mut lines)).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.start_kill();
                return Err(ProtocolError::Timeout);
            }
        };

        let pairing_entry = PairingEntry::select(&capabilities);
        match pairing_entry {
            Some(entry) => debug!("[{label}] Pairing via {}", entry.capability()),
            None => warn!("[{label}] Bridge exposes no pairing-code entry point: {capabilities:?}"),
        }

        let (tx, rx) = mpsc::channel(32);
        let pending: Arc<PendingReplies> = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();
        tokio::spawn(pump(label.clone(), lines, tx, pending.clone(), cancel.clone()));

        let connection = BridgeConnection {
            label,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: tokio::sync::Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            pairing_entry,
            cancel,
            closed: AtomicBool::new(false),
        };

        Ok(OpenedConnection {
            handle: Arc::new(connection),
            events: rx,
        })
    }
}

async fn read_hello(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<Vec<String>, ProtocolError> {
    loop {
        let line = lines.next_line().await.map_err(ProtocolError::Io)?.ok_or(ProtocolError::Closed)?;
        match serde_json::from_str::<BridgeEvent>(&line) {
            Ok(BridgeEvent::Hello { capabilities }) => return Ok(capabilities),
            Ok(other) => debug!("Ignoring pre-hello event: {other:?}"),
            Err(e) => debug!("Parse error: {} ({})", e, preview(&line)),
        }
    }
}

/// Forward helper events until EOF or cancellation.
async fn pump(
    label: String,
    mut lines: Lines<BufReader<ChildStdout>>,
    tx: mpsc::Sender<ConnectionUpdate>,
    pending: Arc<PendingReplies>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(l)) if l.trim().is_empty() => continue,
            Ok(Some(l)) => l,
            Ok(None) => {
                debug!("[{label}] Bridge stdout closed");
                break;
            }
            Err(e) => {
                warn!("[{label}] Read error: {e}");
                break;
            }
        };

        match serde_json::from_str::<BridgeEvent>(&line) {
            Ok(BridgeEvent::ConnectionUpdate(raw)) => {
                if tx.send(raw.into()).await.is_err() {
                    debug!("[{label}] Update dropped, no subscriber");
                }
            }
            Ok(BridgeEvent::PairingCode { id, code }) => resolve(&pending, id, Ok(code)),
            Ok(BridgeEvent::Error { id: Some(id), message }) => resolve(&pending, id, Err(message)),
            Ok(BridgeEvent::Error { id: None, message }) => warn!("[{label}] Bridge error: {message}"),
            Ok(BridgeEvent::CredsUpdate) => debug!("[{label}] Credentials saved"),
            Ok(BridgeEvent::Hello { .. }) | Ok(BridgeEvent::Other) => {}
            Err(e) => debug!("[{label}] Parse error: {} ({})", e, preview(&line)),
        }
    }

    // Anyone still waiting for a code gets a closed channel.
    pending.lock().unwrap_or_else(|p| p.into_inner()).clear();
}

fn preview(line: &str) -> String {
    line.chars().take(80).collect()
}

fn resolve(pending: &PendingReplies, id: u64, reply: Result<Option<String>, String>) {
    let sender = pending.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
    match sender {
        Some(sender) => {
            let _ = sender.send(reply);
        }
        None => debug!("Reply for unknown request {id}"),
    }
}

struct BridgeConnection {
    label: String,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Child>,
    pending: Arc<PendingReplies>,
    next_id: AtomicU64,
    pairing_entry: Option<PairingEntry>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl BridgeConnection {
    async fn send(&self, command: &BridgeCommand<'_>) -> Result<(), ProtocolError> {
        let mut json = serde_json::to_vec(command).map_err(|e| ProtocolError::Rejected(e.to_string()))?;
        json.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(ProtocolError::Closed)?;
        stdin.write_all(&json).await.map_err(ProtocolError::Io)?;
        stdin.flush().await.map_err(ProtocolError::Io)
    }
}

#[async_trait]
impl Connection for BridgeConnection {
    async fn request_pairing_code(&self, phone_digits: &str) -> Result<Option<String>, ProtocolError> {
        let entry = self
            .pairing_entry
            .ok_or(ProtocolError::Unsupported("request_pairing_code"))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).insert(id, tx);

        let command = BridgeCommand::RequestPairingCode {
            id,
            phone: phone_digits,
            entry: entry.capability(),
        };
        if let Err(e) = self.send(&command).await {
            self.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
            return Err(e);
        }

        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(code))) => Ok(code),
            Ok(Ok(Err(message))) => Err(ProtocolError::Rejected(message)),
            Ok(Err(_)) => Err(ProtocolError::Closed),
            Err(_) => {
                self.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
                Err(ProtocolError::Timeout)
            }
        }
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(e) = self.send(&BridgeCommand::Close).await {
            debug!("[{}] Close command not delivered: {e}", self.label);
        }
        self.stdin.lock().await.take();
        self.cancel.cancel();

        let mut child = self.child.lock().await;
        if timeout(EXIT_GRACE, child.wait()).await.is_err() {
            child.start_kill().map_err(ProtocolError::Io)?;
            let _ = child.wait().await;
        }
        info!("🔌 [{}] Bridge closed", self.label);
        Ok(())
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.send(&BridgeCommand::Logout).await
    }
}

impl Drop for BridgeConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_priority() {
        let caps = vec!["ws.request_pairing_code".to_string(), "signal.request_pairing_code".to_string()];
        assert_eq!(PairingEntry::select(&caps), Some(PairingEntry::Signal));

        let caps = vec!["request_pairing_code".to_string(), "ws.request_pairing_code".to_string()];
        assert_eq!(PairingEntry::select(&caps), Some(PairingEntry::Primary));

        assert_eq!(PairingEntry::select(&[]), None);
    }

    #[test]
    fn test_parse_connection_update() {
        let line = r#"{"type":"connection.update","connection":"close","lastDisconnect":{"statusCode":401},"isNewLogin":false}"#;
        let BridgeEvent::ConnectionUpdate(raw) = serde_json::from_str(line).unwrap() else {
            panic!("expected connection.update");
        };
        let update = ConnectionUpdate::from(raw);
        assert_eq!(update.connection, Some(ConnectionState::Close));
        assert_eq!(update.last_disconnect, Some(DisconnectReason::LoggedOut));
    }

    #[test]
    fn test_parse_open_with_account() {
        let line = r#"{"type":"connection.update","connection":"open","accountId":"521555@s.whatsapp.net"}"#;
        let BridgeEvent::ConnectionUpdate(raw) = serde_json::from_str(line).unwrap() else {
            panic!("expected connection.update");
        };
        assert_eq!(ConnectionUpdate::from(raw), ConnectionUpdate::open("521555@s.whatsapp.net"));
    }

    #[test]
    fn test_unknown_event_is_other() {
        let event: BridgeEvent = serde_json::from_str(r#"{"type":"messages.upsert","x":1}"#).unwrap();
        assert!(matches!(event, BridgeEvent::Other));
    }

    #[test]
    fn test_command_shape() {
        let json = serde_json::to_value(BridgeCommand::RequestPairingCode {
            id: 3,
            phone: "5215550000",
            entry: PairingEntry::Primary.capability(),
        })
        .unwrap();
        assert_eq!(json["cmd"], "request_pairing_code");
        assert_eq!(json["id"], 3);
        assert_eq!(serde_json::to_value(BridgeCommand::Close).unwrap()["cmd"], "close");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scripted_bridge_session() {
        let script = r#"
printf '%s\n' '{"type":"hello","capabilities":["signal.request_pairing_code"]}'
printf '%s\n' '{"type":"connection.update","qr":"2@abc"}'
read line
printf '%s\n' '{"type":"pairing_code","id":1,"code":"ABCD1234"}'
read line
"#;
        let client = BridgeClient::new("sh", vec!["-c".to_string(), script.to_string()]);
        let dir = tempfile::TempDir::new().unwrap();

        let mut opened = client.open(dir.path(), &ConnectOptions::default()).await.unwrap();

        let update = opened.events.recv().await.unwrap();
        assert_eq!(update, ConnectionUpdate::challenge("2@abc"));

        let code = opened.handle.request_pairing_code("5215550000").await.unwrap();
        assert_eq!(code.as_deref(), Some("ABCD1234"));

        opened.handle.close().await.unwrap();
        assert!(opened.events.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_no_entry_point_is_unsupported() {
        let script = r#"
printf '%s\n' '{"type":"hello","capabilities":[]}'
read line
"#;
        let client = BridgeClient::new("sh", vec!["-c".to_string(), script.to_string()]);
        let dir = tempfile::TempDir::new().unwrap();
        let opened = client.open(dir.path(), &ConnectOptions::default()).await.unwrap();

        let err = opened.handle.request_pairing_code("1").await.unwrap_err();
        assert!(matches!(err, ProtocolError::Unsupported(_)));
        opened.handle.close().await.unwrap();
    }
}
