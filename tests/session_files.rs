//! Integration tests for the on-disk session and cooldown files.
//!
//! Run with: cargo test --test session_files

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use subbot::linking::{CooldownDecision, CooldownTracker, SessionRecord, SessionRegistry};
use tempfile::TempDir;

fn record(identifier: &str) -> SessionRecord {
    let now = Utc::now();
    SessionRecord {
        identifier: identifier.to_string(),
        auth_directory: format!("/data/auth/{identifier}").into(),
        active: true,
        created_at: now,
        last_updated: now,
        browser_label: "Windows/Firefox".to_string(),
    }
}

#[test]
fn test_concurrent_adds_do_not_interleave() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(SessionRegistry::new(dir.path().join("sessions.json")));

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let registry = registry.clone();
            thread::spawn(move || registry.add(record(&format!("{n}@s.whatsapp.net"))).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(registry.read_all().len(), 8);

    // The file itself is a single valid JSON object keyed by identifier.
    let raw = std::fs::read_to_string(registry.path()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value.as_object().unwrap().len(), 8);
    assert!(value["3@s.whatsapp.net"]["authDirectory"].is_string());
    assert!(value["3@s.whatsapp.net"]["createdAt"].is_i64());

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().ends_with(".temporal"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_corrupt_registry_recovers_to_empty() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.json");
    std::fs::write(&path, "{ not json").unwrap();

    let registry = SessionRegistry::new(&path);
    assert!(registry.read_all().is_empty());

    let backups: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("sessions.json.corrupt."))
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(std::fs::read_to_string(backups[0].path()).unwrap(), "{ not json");

    registry.add(record("1@s.whatsapp.net")).unwrap();
    assert_eq!(registry.read_all().len(), 1);
}

#[test]
fn test_registry_lifecycle() {
    let dir = TempDir::new().unwrap();
    let registry = SessionRegistry::new(dir.path().join("sessions.json"));

    registry.add(record("x@s.whatsapp.net")).unwrap();
    registry.add(record("x@s.whatsapp.net")).unwrap();
    assert_eq!(registry.read_all().len(), 1);

    assert!(registry.set_active("x@s.whatsapp.net", false).unwrap());
    assert!(!registry.get("x@s.whatsapp.net").unwrap().active);

    assert!(registry.remove("x@s.whatsapp.net").unwrap());
    assert!(!registry.remove("x@s.whatsapp.net").unwrap());
    assert!(!registry.set_active("x@s.whatsapp.net", true).unwrap());
}

#[test]
fn test_cooldown_file_uses_unix_millis() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cooldowns.json");
    let tracker = CooldownTracker::load(&path, Duration::from_secs(30));
    let t0 = Utc::now();

    assert_eq!(tracker.check_and_reserve("42", t0), CooldownDecision::Allowed);

    let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(value["42"]["lastAttemptAt"].as_i64(), Some(t0.timestamp_millis()));

    let reloaded = CooldownTracker::load(&path, Duration::from_secs(30));
    assert_eq!(
        reloaded.check_and_reserve("42", t0 + TimeDelta::seconds(31)),
        CooldownDecision::Allowed
    );
}
