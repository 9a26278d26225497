//! In-memory protocol client and messenger for unit tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::messenger::Messenger;
use super::protocol::{ConnectOptions, Connection, ConnectionUpdate, OpenedConnection, ProtocolClient, ProtocolError};

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text { chat_id: i64, id: i64, text: String },
    Image { chat_id: i64, id: i64, caption: Option<String> },
    Deleted { chat_id: i64, id: i64 },
}

/// Messenger that records everything and never fails. Ids start at 1000.
pub struct RecordingMessenger {
    log: Mutex<Vec<Sent>>,
    next_id: AtomicI64,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1000),
        }
    }

    pub fn log(&self) -> Vec<Sent> {
        self.log.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn texts_containing(&self, needle: &str) -> usize {
        self.texts().iter().filter(|t| t.contains(needle)).count()
    }

    pub fn images(&self) -> usize {
        self.log().iter().filter(|s| matches!(s, Sent::Image { .. })).count()
    }

    pub fn deleted(&self) -> Vec<i64> {
        self.log()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Deleted { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }

    fn next(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_text(&self, chat_id: i64, text: &str, _reply_to: Option<i64>) -> Result<i64, String> {
        let id = self.next();
        self.log.lock().unwrap().push(Sent::Text {
            chat_id,
            id,
            text: text.to_string(),
        });
        Ok(id)
    }

    async fn send_image(
        &self,
        chat_id: i64,
        _png: Vec<u8>,
        caption: Option<&str>,
        _reply_to: Option<i64>,
    ) -> Result<i64, String> {
        let id = self.next();
        self.log.lock().unwrap().push(Sent::Image {
            chat_id,
            id,
            caption: caption.map(str::to_string),
        });
        Ok(id)
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), String> {
        self.log.lock().unwrap().push(Sent::Deleted { chat_id, id: message_id });
        Ok(())
    }
}

/// Connection driven by the test through [`FakeConnection::push`].
pub struct FakeConnection {
    pub auth_dir: PathBuf,
    updates: Mutex<Option<mpsc::Sender<ConnectionUpdate>>>,
    code: Option<String>,
    pairing_calls: AtomicUsize,
    closes: AtomicUsize,
    logouts: AtomicUsize,
}

impl FakeConnection {
    pub async fn push(&self, update: ConnectionUpdate) {
        let sender = self.updates.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(update).await;
        }
    }

    /// Close the update stream without a reason.
    pub fn end_stream(&self) {
        self.updates.lock().unwrap().take();
    }

    pub fn pairing_calls(&self) -> usize {
        self.pairing_calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn request_pairing_code(&self, _phone_digits: &str) -> Result<Option<String>, ProtocolError> {
        self.pairing_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.code.clone())
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Protocol client handing out [`FakeConnection`]s.
pub struct FakeProtocol {
    opened: Mutex<VecDeque<Arc<FakeConnection>>>,
    code: Mutex<Option<String>>,
    fail_open: AtomicBool,
}

impl FakeProtocol {
    /// Connections answer pairing requests with `code`.
    pub fn new(code: Option<&str>) -> Self {
        Self {
            opened: Mutex::new(VecDeque::new()),
            code: Mutex::new(code.map(str::to_string)),
            fail_open: AtomicBool::new(false),
        }
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    /// The `n`th connection opened (0-based).
    pub fn connection(&self, n: usize) -> Arc<FakeConnection> {
        self.opened.lock().unwrap()[n].clone()
    }

    pub fn last(&self) -> Arc<FakeConnection> {
        self.opened.lock().unwrap().back().cloned().unwrap()
    }

    /// Wait until at least `n` connections have been opened.
    pub async fn wait_for_opens(&self, n: usize) {
        for _ in 0..500 {
            if self.opens() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} opens, saw {}", self.opens());
    }
}

#[async_trait]
impl ProtocolClient for FakeProtocol {
    async fn open(&self, auth_dir: &Path, _options: &ConnectOptions) -> Result<OpenedConnection, ProtocolError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(ProtocolError::Spawn(std::io::Error::other("bridge missing")));
        }

        // Adapters persist credentials into the auth dir.
        std::fs::create_dir_all(auth_dir).map_err(ProtocolError::Io)?;
        std::fs::write(auth_dir.join("creds.json"), "{}").map_err(ProtocolError::Io)?;

        let (tx, rx) = mpsc::channel(32);
        let connection = Arc::new(FakeConnection {
            auth_dir: auth_dir.to_path_buf(),
            updates: Mutex::new(Some(tx)),
            code: self.code.lock().unwrap().clone(),
            pairing_calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
        });
        self.opened.lock().unwrap().push_back(connection.clone());

        Ok(OpenedConnection {
            handle: connection,
            events: rx,
        })
    }
}
