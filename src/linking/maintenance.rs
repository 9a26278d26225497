//! Housekeeping and supervised restart, timed to the tail of a cooldown.
//!
//! A linking request arms one maintenance cycle per process. The cycle waits
//! until `restart_window` before the requester's cooldown ends, deletes stale
//! temporary artifacts, posts a notice and then restarts the process so a
//! supervisor brings it back up clean.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::messenger::Messenger;
use super::persist::ATOMIC_SUFFIX;
use super::registry::SessionRegistry;

pub const RESTART_NOTICE: &str = "🪷 Restarting the bot...";

/// What "restart" means. Defaults to exiting for the supervisor.
pub type RestartAction = Arc<dyn Fn() + Send + Sync>;

pub struct MaintenanceScheduler {
    sessions_root: PathBuf,
    cooldown: Duration,
    restart_window: Duration,
    messenger: Arc<dyn Messenger>,
    restart: RestartAction,
    scheduled: AtomicBool,
}

impl MaintenanceScheduler {
    pub fn new(
        sessions_root: impl Into<PathBuf>,
        cooldown: Duration,
        restart_window: Duration,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            cooldown,
            restart_window,
            messenger,
            restart: Arc::new(|| std::process::exit(0)),
            scheduled: AtomicBool::new(false),
        }
    }

    pub fn with_restart_action(mut self, action: RestartAction) -> Self {
        self.restart = action;
        self
    }

    /// `<sessions>/temporal`, scratch space removed on every cycle.
    pub fn temp_dir(&self) -> PathBuf {
        self.sessions_root.join("temporal")
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Arm a cycle unless one is already pending. Returns true if this call armed it.
    pub fn schedule(self: &Arc<Self>, chat_id: i64) -> bool {
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Maintenance already scheduled");
            return false;
        }

        let this = self.clone();
        tokio::spawn(async move { this.run_cycle(chat_id).await });
        true
    }

    async fn run_cycle(&self, chat_id: i64) {
        sleep(self.cooldown.saturating_sub(self.restart_window)).await;
        info!("🧰 Maintenance: cleaning up before scheduled restart");

        let removed = self.clean_stale_artifacts();
        info!("🧰 Maintenance removed {removed} stale artifact(s)");

        if let Err(e) = self.messenger.send_text(chat_id, RESTART_NOTICE, None).await {
            warn!("Restart notice not delivered: {e}");
        }

        info!("🧰 Restarting in {}ms", self.restart_window.as_millis());
        sleep(self.restart_window).await;
        (self.restart)();

        // Still alive: allow a later cycle.
        self.scheduled.store(false, Ordering::Release);
    }

    /// Remove the temporal directory and leftover `*.temporal` files. Best-effort.
    pub fn clean_stale_artifacts(&self) -> usize {
        let mut removed = 0;

        let temp_dir = self.temp_dir();
        if temp_dir.exists() {
            match std::fs::remove_dir_all(&temp_dir) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {e}", temp_dir.display()),
            }
        }

        let entries = match std::fs::read_dir(&self.sessions_root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read {}: {e}", self.sessions_root.display());
                return removed;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_leftover = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(ATOMIC_SUFFIX));
            if !is_leftover || !path.is_file() {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {e}", path.display()),
            }
        }

        removed
    }

    /// Delete auth directories that no session record references.
    ///
    /// Only safe at startup, before any attempt has allocated a directory.
    pub fn sweep_orphans(&self, auth_root: &Path, registry: &SessionRegistry) -> usize {
        let records = registry.read_all();
        let entries = match std::fs::read_dir(auth_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!("Failed to read {}: {e}", auth_root.display());
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let referenced = records
                .values()
                .any(|r| r.auth_directory == path || r.auth_directory.file_name() == path.file_name());
            if referenced {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!("🧹 Removed orphaned auth dir {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove {}: {e}", path.display()),
            }
        }
        removed
    }
}
