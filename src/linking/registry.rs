//! Durable registry of linked sub-bot sessions, plus the in-memory set of
//! live connections.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::persist::{read_json_or_recover, write_json_atomic};
use super::protocol::Connection;

/// A linked session, keyed by the account identifier the protocol assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub identifier: String,
    /// Retained credential material for this session.
    pub auth_directory: PathBuf,
    pub active: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
    /// e.g. "Windows/Firefox"
    pub browser_label: String,
}

pub type SessionMap = BTreeMap<String, SessionRecord>;

/// JSON-file registry of [`SessionRecord`]s.
///
/// Every mutation is a locked read-modify-write that re-serializes the whole
/// map and commits it with a rename, so concurrent attempts finishing at the
/// same time cannot interleave into a corrupt file.
pub struct SessionRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records. A corrupt file is backed up and read as empty.
    pub fn read_all(&self) -> SessionMap {
        let _guard = self.guard();
        read_json_or_recover(&self.path)
    }

    pub fn get(&self, identifier: &str) -> Option<SessionRecord> {
        self.read_all().remove(identifier)
    }

    /// Insert or replace the record for `record.identifier`.
    pub fn add(&self, record: SessionRecord) -> Result<(), String> {
        self.update(|map| {
            info!("💾 Registering session {}", record.identifier);
            map.insert(record.identifier.clone(), record);
            true
        })
        .map(|_| ())
    }

    /// Returns true if a record was removed.
    pub fn remove(&self, identifier: &str) -> Result<bool, String> {
        self.update(|map| map.remove(identifier).is_some())
    }

    /// Returns true if the record exists (whether or not the flag changed).
    pub fn set_active(&self, identifier: &str, active: bool) -> Result<bool, String> {
        self.update(|map| match map.get_mut(identifier) {
            Some(record) => {
                record.active = active;
                record.last_updated = Utc::now();
                true
            }
            None => false,
        })
    }

    /// Apply `f` to the current map and persist if it reports a change.
    fn update<F>(&self, f: F) -> Result<bool, String>
    where
        F: FnOnce(&mut SessionMap) -> bool,
    {
        let _guard = self.guard();
        let mut map: SessionMap = read_json_or_recover(&self.path);
        let changed = f(&mut map);
        if changed {
            write_json_atomic(&self.path, &map)?;
        }
        Ok(changed)
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        // The mutex guards no data, so a poisoned lock is still usable.
        self.lock.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Live linked connections for this process.
///
/// Passed by `Arc` to whoever needs it instead of living in a global.
#[derive(Default)]
pub struct ActiveConnections {
    inner: Mutex<HashMap<String, Arc<dyn Connection>>>,
}

impl ActiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the one it replaced.
    pub fn insert(&self, identifier: &str, connection: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        let previous = self.lock().insert(identifier.to_string(), connection);
        if previous.is_some() {
            warn!("Replaced live connection for {identifier}");
        }
        previous
    }

    pub fn remove(&self, identifier: &str) -> Option<Arc<dyn Connection>> {
        self.lock().remove(identifier)
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.lock().contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether `connection` is the one currently registered for `identifier`.
    pub fn holds(&self, identifier: &str, connection: &Arc<dyn Connection>) -> bool {
        self.lock()
            .get(identifier)
            .is_some_and(|current| Arc::ptr_eq(current, connection))
    }

    /// Remove `identifier` only while it still maps to `connection`.
    pub fn remove_if_same(&self, identifier: &str, connection: &Arc<dyn Connection>) -> bool {
        let mut inner = self.lock();
        if inner.get(identifier).is_some_and(|current| Arc::ptr_eq(current, connection)) {
            inner.remove(identifier);
            true
        } else {
            false
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Connection>>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            identifier: id.to_string(),
            auth_directory: PathBuf::from(format!("/tmp/auth/{id}")),
            active: true,
            created_at: now,
            last_updated: now,
            browser_label: "Windows/Firefox".to_string(),
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new(dir.path().join("sessions.json"));

        registry.add(record("123@s.whatsapp.net")).unwrap();
        registry.add(record("123@s.whatsapp.net")).unwrap();

        assert_eq!(registry.read_all().len(), 1);
    }

    #[test]
    fn test_remove_reports_presence() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new(dir.path().join("sessions.json"));
        registry.add(record("a")).unwrap();

        assert!(registry.remove("a").unwrap());
        assert!(!registry.remove("a").unwrap());
        assert!(registry.read_all().is_empty());
    }

    #[test]
    fn test_set_active() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new(dir.path().join("sessions.json"));
        registry.add(record("a")).unwrap();

        assert!(registry.set_active("a", false).unwrap());
        assert!(!registry.get("a").unwrap().active);
        assert!(!registry.set_active("missing", true).unwrap());
    }

    #[test]
    fn test_corrupt_file_is_backed_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{\"a\": {\"identifier\": ").unwrap();

        let registry = SessionRegistry::new(&path);
        assert!(registry.read_all().is_empty());

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("sessions.json.corrupt."))
            .collect();
        assert_eq!(backups.len(), 1);
        // Replaced by an empty map, so the next read is clean.
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "{}");
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_value(record("x")).unwrap();
        assert!(json.get("authDirectory").is_some());
        assert!(json.get("lastUpdated").unwrap().is_i64());
        assert_eq!(json["browserLabel"], "Windows/Firefox");
    }
}
