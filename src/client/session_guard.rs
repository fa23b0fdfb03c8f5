//! Client-side idle timeout.
//!
//! The guard keeps an idle clock that every user interaction resets. A
//! background task compares the clock against the configured timeout and
//! fires the logout callback once when it is exceeded. The wall-clock copy
//! in storage lets a restarted client resume the idle window instead of
//! granting a fresh one.

use chrono::Utc;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::storage::{TokenStorage, LAST_ACTIVITY_KEY};
use crate::config::SessionConfig;

pub struct SessionGuard {
    storage: Arc<dyn TokenStorage>,
    idle_timeout: Duration,
    check_interval: Duration,
    last_activity: Arc<Mutex<Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionGuard {
    pub fn new(config: &SessionConfig, storage: Arc<dyn TokenStorage>) -> Self {
        let idle_timeout = Duration::from_secs(config.idle_timeout_secs);

        // Resume the idle window from the previous run if a timestamp
        // survived in storage
        let elapsed = storage
            .get(LAST_ACTIVITY_KEY)
            .and_then(|v| v.parse::<i64>().ok())
            .map(|millis| Utc::now().timestamp_millis().saturating_sub(millis))
            .filter(|elapsed| *elapsed > 0)
            .map(|elapsed| Duration::from_millis(elapsed as u64))
            .unwrap_or(Duration::ZERO);
        let last_activity = Instant::now()
            .checked_sub(elapsed.min(idle_timeout))
            .unwrap_or_else(Instant::now);

        Self {
            storage,
            idle_timeout,
            check_interval: Duration::from_secs(config.check_interval_secs),
            last_activity: Arc::new(Mutex::new(last_activity)),
            task: Mutex::new(None),
        }
    }

    /// Reset the idle clock. Called on every user interaction.
    pub fn record_activity(&self) {
        *self.last_activity.lock() = Instant::now();
        self.storage
            .set(LAST_ACTIVITY_KEY, &Utc::now().timestamp_millis().to_string());
    }

    /// Drop the persisted idle clock and reset the in-memory one. Called
    /// when the session ends so the next run starts with a fresh window.
    pub fn clear_activity(&self) {
        *self.last_activity.lock() = Instant::now();
        self.storage.remove(LAST_ACTIVITY_KEY);
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Spawn the watcher task. Replaces any previous watcher. The callback
    /// runs once when the idle timeout is exceeded, then the task exits.
    pub fn start<F, Fut>(&self, on_timeout: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.stop();

        let last_activity = self.last_activity.clone();
        let idle_timeout = self.idle_timeout;
        let check_interval = self.check_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            // First tick fires immediately; skip it so a fresh guard does not
            // evaluate a zero-length window
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let idle = last_activity.lock().elapsed();
                if idle >= idle_timeout {
                    tracing::info!(idle_secs = idle.as_secs(), "Session idle timeout reached");
                    on_timeout().await;
                    break;
                }
            }
        });

        *self.task.lock() = Some(handle);
    }

    /// Abort the watcher task, if running.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::storage::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(idle_secs: u64, check_secs: u64) -> SessionConfig {
        SessionConfig {
            idle_timeout_secs: idle_secs,
            check_interval_secs: check_secs,
        }
    }

    fn counting_guard(
        guard: &SessionGuard,
    ) -> Arc<AtomicUsize> {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        guard.start(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        fired
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_idle_timeout() {
        let guard = SessionGuard::new(&config(60, 5), Arc::new(MemoryStorage::new()));
        let fired = counting_guard(&guard);

        tokio::time::advance(Duration::from_secs(59)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // The task exits after firing
        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!guard.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_the_clock() {
        let guard = SessionGuard::new(&config(60, 5), Arc::new(MemoryStorage::new()));
        let fired = counting_guard(&guard);

        tokio::time::advance(Duration::from_secs(40)).await;
        settle().await;
        guard.record_activity();

        // 41..=65 seconds since start, but under 30 since the activity
        tokio::time::advance(Duration::from_secs(25)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(40)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_aborts_the_watcher() {
        let guard = SessionGuard::new(&config(60, 5), Arc::new(MemoryStorage::new()));
        let fired = counting_guard(&guard);

        assert!(guard.is_running());
        guard.stop();

        tokio::time::advance(Duration::from_secs(300)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!guard.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_the_watcher() {
        let guard = SessionGuard::new(&config(60, 5), Arc::new(MemoryStorage::new()));
        let first = counting_guard(&guard);
        let second = counting_guard(&guard);
        settle().await;

        tokio::time::advance(Duration::from_secs(70)).await;
        settle().await;
        // Only the replacement fires
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_stored_activity_counts_against_the_window() {
        let storage = Arc::new(MemoryStorage::new());
        // Last activity 50 wall-clock seconds ago
        let stale = Utc::now().timestamp_millis() - 50_000;
        storage.set(LAST_ACTIVITY_KEY, &stale.to_string());

        let guard = SessionGuard::new(&config(60, 5), storage);
        assert!(guard.idle_for() >= Duration::from_secs(49));

        let fired = counting_guard(&guard);
        settle().await;
        tokio::time::advance(Duration::from_secs(15)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn record_activity_persists_to_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let guard = SessionGuard::new(&config(60, 5), storage.clone());

        assert!(storage.get(LAST_ACTIVITY_KEY).is_none());
        guard.record_activity();
        let stored: i64 = storage.get(LAST_ACTIVITY_KEY).unwrap().parse().unwrap();
        assert!(stored > 0);
    }

    #[tokio::test]
    async fn clear_activity_drops_the_stored_stamp() {
        let storage = Arc::new(MemoryStorage::new());
        let guard = SessionGuard::new(&config(60, 5), storage.clone());

        guard.record_activity();
        assert!(storage.get(LAST_ACTIVITY_KEY).is_some());

        guard.clear_activity();
        assert!(storage.get(LAST_ACTIVITY_KEY).is_none());
        assert!(guard.idle_for() < Duration::from_secs(1));
    }
}
