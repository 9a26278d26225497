//! Per-user rate limit on new linking attempts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::persist::{read_json_or_recover, write_json_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownRecord {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    Allowed,
    Denied { remaining: Duration },
}

/// Tracks the last attempt per user and gates new ones.
pub struct CooldownTracker {
    path: PathBuf,
    window: Duration,
    records: Mutex<BTreeMap<String, CooldownRecord>>,
}

impl CooldownTracker {
    /// Load the cooldown table from `path` (corrupt files start empty).
    pub fn load(path: impl Into<PathBuf>, window: Duration) -> Self {
        let path = path.into();
        let records = read_json_or_recover(&path);
        Self {
            path,
            window,
            records: Mutex::new(records),
        }
    }

    /// Check the user's cooldown and, if clear, reserve `now` as their last attempt.
    ///
    /// The check and the reservation happen under one lock, so two requests
    /// racing for the same user cannot both be allowed.
    pub fn check_and_reserve(&self, user_id: &str, now: DateTime<Utc>) -> CooldownDecision {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(record) = records.get(user_id) {
            let elapsed = (now - record.last_attempt_at).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.window {
                let remaining = self.window - elapsed;
                debug!("Cooldown for {user_id}: {}ms left", remaining.as_millis());
                return CooldownDecision::Denied { remaining };
            }
        }

        let window = self.window;
        records.retain(|_, r| (now - r.last_attempt_at).to_std().map_or(true, |elapsed| elapsed < window));
        records.insert(user_id.to_string(), CooldownRecord { last_attempt_at: now });
        if let Err(e) = write_json_atomic(&self.path, &*records) {
            warn!("Failed to persist cooldowns: {e}");
        }
        CooldownDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    const WINDOW: Duration = Duration::from_secs(30);

    #[test]
    fn test_second_request_denied_with_remaining() {
        let dir = TempDir::new().unwrap();
        let tracker = CooldownTracker::load(dir.path().join("cooldowns.json"), WINDOW);
        let t0 = Utc::now();

        assert_eq!(tracker.check_and_reserve("alice", t0), CooldownDecision::Allowed);
        let decision = tracker.check_and_reserve("alice", t0 + TimeDelta::seconds(10));
        assert_eq!(
            decision,
            CooldownDecision::Denied { remaining: Duration::from_millis(20_000) }
        );
    }

    #[test]
    fn test_denied_does_not_extend_window() {
        let dir = TempDir::new().unwrap();
        let tracker = CooldownTracker::load(dir.path().join("cooldowns.json"), WINDOW);
        let t0 = Utc::now();

        tracker.check_and_reserve("alice", t0);
        tracker.check_and_reserve("alice", t0 + TimeDelta::seconds(29));
        assert_eq!(
            tracker.check_and_reserve("alice", t0 + TimeDelta::seconds(30)),
            CooldownDecision::Allowed
        );
    }

    #[test]
    fn test_users_are_independent() {
        let dir = TempDir::new().unwrap();
        let tracker = CooldownTracker::load(dir.path().join("cooldowns.json"), WINDOW);
        let t0 = Utc::now();

        tracker.check_and_reserve("alice", t0);
        assert_eq!(tracker.check_and_reserve("bob", t0), CooldownDecision::Allowed);
    }

    #[test]
    fn test_expired_entries_are_pruned() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cooldowns.json");
        let tracker = CooldownTracker::load(&path, WINDOW);
        let t0 = Utc::now();

        tracker.check_and_reserve("alice", t0);
        tracker.check_and_reserve("bob", t0 + TimeDelta::seconds(10));
        tracker.check_and_reserve("carol", t0 + TimeDelta::seconds(31));

        let saved: BTreeMap<String, CooldownRecord> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.keys().collect::<Vec<_>>(), ["bob", "carol"]);
    }

    #[test]
    fn test_persists_across_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cooldowns.json");
        let t0 = Utc::now();

        CooldownTracker::load(&path, WINDOW).check_and_reserve("alice", t0);

        let reloaded = CooldownTracker::load(&path, WINDOW);
        assert!(matches!(
            reloaded.check_and_reserve("alice", t0 + TimeDelta::seconds(5)),
            CooldownDecision::Denied { .. }
        ));
    }
}
