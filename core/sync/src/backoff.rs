//! Re-armable resume timer with multiplicative backoff.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::config::BackoffConfig;

/// Callback invoked when the timer fires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Single-shot timer whose delay grows on every `backoff()`.
///
/// At most one schedule is pending at a time. `backoff()` only changes the
/// delay; callers arm the timer explicitly with `start()`.
pub struct BackoffTimer {
    config: BackoffConfig,
    delay_ms: f64,
    pending: Option<JoinHandle<()>>,
    callback: TimerCallback,
}

impl BackoffTimer {
    /// Create a timer at the initial delay, with nothing scheduled.
    pub fn new(config: BackoffConfig, callback: TimerCallback) -> Self {
        Self {
            delay_ms: config.initial_delay_ms as f64,
            config,
            pending: None,
            callback,
        }
    }

    /// Cancel any pending schedule and fire the callback after the current delay.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        self.cancel();

        let delay = self.delay();
        let callback = self.callback.clone();
        debug!("Resume timer armed for {:?}", delay);

        self.pending = Some(tokio::spawn(async move {
            sleep(delay).await;
            callback();
        }));
    }

    /// Grow the delay, capped at the configured maximum. Does not reschedule.
    pub fn backoff(&mut self) {
        self.delay_ms =
            (self.delay_ms * self.config.multiplier).min(self.config.max_delay_ms as f64);
    }

    /// Cancel any pending schedule and restore the initial delay.
    pub fn reset(&mut self) {
        self.cancel();
        self.delay_ms = self.config.initial_delay_ms as f64;
    }

    /// Clear the pending schedule, if any.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    /// Current delay, rounded to the millisecond.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.round() as u64)
    }

    /// Whether a schedule is armed and has not fired yet.
    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Get the backoff configuration.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl Drop for BackoffTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
