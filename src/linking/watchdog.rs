//! Per-attempt expiry timer, the finish latch, and the shared teardown.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{Connection, ConnectionUpdate};

const ARMED: u8 = 0;
const DISARMED: u8 = 1;
const FIRED: u8 = 2;

/// Countdown that runs `on_expire` unless disarmed first.
///
/// Exactly one of `disarm()` or the expiry wins. Dropping the watchdog
/// cancels the timer task.
pub struct TimeoutWatchdog {
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
}

impl TimeoutWatchdog {
    pub fn arm<F>(duration: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(ARMED));
        let cancel = CancellationToken::new();

        let task_state = state.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = task_cancel.cancelled() => {}
                _ = sleep(duration) => {
                    if task_state
                        .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        debug!("⏰ Watchdog fired after {}ms", duration.as_millis());
                        on_expire();
                    }
                }
            }
        });

        Self { state, cancel }
    }

    /// Cancel the countdown. Returns false if it already fired or was disarmed.
    pub fn disarm(&self) -> bool {
        let won = self
            .state
            .compare_exchange(ARMED, DISARMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.cancel.cancel();
        won
    }
}

impl Drop for TimeoutWatchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// First-transition-wins latch for an attempt.
#[derive(Debug, Default)]
pub struct FinishLatch(AtomicBool);

impl FinishLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch. Only the first caller gets `true`.
    pub fn try_finish(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Release everything an unsuccessful attempt owns.
///
/// Drops the event subscription, closes the connection and removes the auth
/// directory. Every step is best-effort: failures are logged and swallowed.
pub async fn teardown(
    session_id: &str,
    connection: &dyn Connection,
    auth_dir: &Path,
    events: Option<mpsc::Receiver<ConnectionUpdate>>,
) {
    if let Some(mut events) = events {
        events.close();
    }

    if let Err(e) = connection.close().await {
        warn!("[{session_id}] Failed to close connection: {e}");
    }

    match tokio::fs::remove_dir_all(auth_dir).await {
        Ok(()) => debug!("[{session_id}] Removed {}", auth_dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("[{session_id}] Failed to remove {}: {e}", auth_dir.display()),
    }

    info!("🧹 [{session_id}] Torn down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_duration() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let watchdog = TimeoutWatchdog::arm(Duration::from_secs(45), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_secs(44)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!watchdog.disarm());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_prevents_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let watchdog = TimeoutWatchdog::arm(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(watchdog.disarm());
        assert!(!watchdog.disarm());

        sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let watchdog = TimeoutWatchdog::arm(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(watchdog);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_latch_first_wins() {
        let latch = FinishLatch::new();
        assert!(latch.try_finish());
        assert!(!latch.try_finish());
    }
}
