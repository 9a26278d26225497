//! JSON map files committed with write-temp-then-rename.
//!
//! Both the session registry and the cooldown table live in a single JSON
//! document that is rewritten in full on every change. Writers go through
//! [`write_json_atomic`] so a reader only ever sees the old or the new file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

/// Suffix of in-flight temp files. Maintenance deletes leftovers with this suffix.
pub const ATOMIC_SUFFIX: &str = ".temporal";

/// Path of the temp file used while committing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "unnamed".into());
    name.push(ATOMIC_SUFFIX);
    path.with_file_name(name)
}

/// Serialize `value` and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
    }

    let json = serde_json::to_vec_pretty(value).map_err(|e| format!("Failed to serialize: {e}"))?;
    let tmp = temp_path(path);

    let mut file = std::fs::File::create(&tmp)
        .map_err(|e| format!("Failed to create {}: {e}", tmp.display()))?;
    file.write_all(&json)
        .and_then(|_| file.sync_all())
        .map_err(|e| format!("Failed to write {}: {e}", tmp.display()))?;
    drop(file);

    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        format!("Failed to rename {} to {}: {e}", tmp.display(), path.display())
    })
}

/// Read a JSON document, recovering from corruption.
///
/// A missing file yields `T::default()`. An unreadable or unparsable file is
/// renamed to `<file>.corrupt.<unix ms>`, replaced by an empty document, and
/// `T::default()` is returned. Never fails.
pub fn read_json_or_recover<T>(path: &Path) -> T
where
    T: DeserializeOwned + Serialize + Default,
{
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            warn!("Failed to read {}: {e}", path.display());
            return recover(path);
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(e) => {
            warn!("Corrupt JSON in {}: {e}", path.display());
            recover(path)
        }
    }
}

fn recover<T: Serialize + Default>(path: &Path) -> T {
    let backup = corrupt_backup_path(path, Utc::now().timestamp_millis());
    match std::fs::rename(path, &backup) {
        Ok(()) => info!("Backed up corrupt file to {}", backup.display()),
        Err(e) => warn!("Failed to back up corrupt file {}: {e}", path.display()),
    }

    let empty = T::default();
    if let Err(e) = write_json_atomic(path, &empty) {
        warn!("Failed to reset {}: {e}", path.display());
    }
    empty
}

/// `<file>.corrupt.<ts>` next to `path`.
pub fn corrupt_backup_path(path: &Path, timestamp_ms: i64) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "unnamed".into());
    name.push(format!(".corrupt.{timestamp_ms}"));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.json");
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1i64);

        write_json_atomic(&path, &map).unwrap();
        let back: BTreeMap<String, i64> = read_json_or_recover(&path);
        assert_eq!(back, map);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let map: BTreeMap<String, i64> = read_json_or_recover(&dir.path().join("nope.json"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_temp_path_suffix() {
        let tmp = temp_path(Path::new("/data/sessions.json"));
        assert_eq!(tmp, PathBuf::from("/data/sessions.json.temporal"));
    }

    #[test]
    fn test_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("map.json");
        write_json_atomic(&path, &BTreeMap::<String, i64>::new()).unwrap();
        assert!(path.exists());
    }
}
