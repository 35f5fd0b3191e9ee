//! Stall watchdog: a single cooperative task per run that cancels the run
//! when no progress event has landed within `stall_timeout`.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Shared, mutex-free progress clock. `bump` is called from the run loop
/// whenever a progress event is emitted; the watchdog task only reads it.
#[derive(Debug)]
pub struct ProgressClock {
    started_at: Instant,
    last_progress_millis: AtomicU64,
}

impl ProgressClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started_at: Instant::now(),
            last_progress_millis: AtomicU64::new(0),
        })
    }

    pub fn bump(&self) {
        let elapsed = self.started_at.elapsed().as_millis() as u64;
        self.last_progress_millis.store(elapsed, Ordering::SeqCst);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_progress_millis.load(Ordering::SeqCst);
        let elapsed = self.started_at.elapsed().as_millis() as u64;
        Duration::from_millis(elapsed.saturating_sub(last))
    }
}

impl Default for ProgressClock {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            last_progress_millis: AtomicU64::new(0),
        }
    }
}

/// Cancel-cause flag the run loop polls at suspension points. `reason` is
/// set exactly once; later cancellations are no-ops.
#[derive(Debug, Default)]
pub struct CancelHandle {
    canceled: AtomicBool,
    reason: std::sync::Mutex<Option<String>>,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .canceled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.reason.lock().expect("cancel reason mutex poisoned") = Some(reason.into());
            self.notify.notify_waiters();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().expect("cancel reason mutex poisoned").clone()
    }

    /// Resolves once [`Self::cancel`] has been called. Re-checks
    /// `is_canceled` after registering the `Notify` waiter so a cancel that
    /// races the registration is never missed.
    pub async fn canceled(&self) {
        loop {
            if self.is_canceled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StallWatchdogConfig {
    pub stall_timeout: Duration,
    pub stall_check_interval: Duration,
}

impl StallWatchdogConfig {
    /// A watchdog config with `stall_timeout == Duration::ZERO` is disabled.
    pub fn is_enabled(&self) -> bool {
        !self.stall_timeout.is_zero()
    }
}

impl Default for StallWatchdogConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::ZERO,
            stall_check_interval: Duration::from_secs(5),
        }
    }
}

/// Spawns the per-run stall-watchdog task described in the runtime model:
/// on every tick, if idle time exceeds `stall_timeout`, the run is canceled
/// with a "stall watchdog timeout after <d> with no progress" cause and the
/// task exits. Returns `None` when the watchdog is disabled.
pub fn spawn_stall_watchdog(
    config: StallWatchdogConfig,
    progress: Arc<ProgressClock>,
    cancel: Arc<CancelHandle>,
) -> Option<tokio::task::JoinHandle<()>> {
    if !config.is_enabled() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.stall_check_interval);
        loop {
            interval.tick().await;
            if cancel.is_canceled() {
                return;
            }
            let idle = progress.idle_for();
            if idle > config.stall_timeout {
                cancel.cancel(format!(
                    "stall watchdog timeout after {:?} with no progress",
                    idle
                ));
                return;
            }
        }
    }))
}
