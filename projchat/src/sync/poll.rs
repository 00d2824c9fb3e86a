//! Periodic history re-fetch.
//!
//! [`PollFallback`] runs a tick function on a fixed interval for as long as
//! its handle lives. The first tick fires immediately, which doubles as the
//! initial load, and [`PollFallback::trigger`] forces an extra tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default time between history fetches.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Shortest interval the timer accepts; smaller values are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a running poll timer. Dropping it stops the timer.
#[derive(Debug)]
pub struct PollFallback {
    trigger: Arc<Notify>,
    task: JoinHandle<()>,
}

impl PollFallback {
    /// Starts calling `tick` every `interval`, beginning now.
    ///
    /// Ticks never overlap: a slow tick delays the next one instead of
    /// queueing a burst. Intervals below [`MIN_POLL_INTERVAL`] are raised
    /// to it.
    pub fn start<F, Fut>(interval: Duration, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if interval < MIN_POLL_INTERVAL {
            tracing::warn!(?interval, min = ?MIN_POLL_INTERVAL, "poll interval too short, clamping");
        }
        let interval = interval.max(MIN_POLL_INTERVAL);
        let trigger = Arc::new(Notify::new());
        let forced = Arc::clone(&trigger);
        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    () = forced.notified() => timer.reset(),
                }
                tick().await;
            }
        });
        Self { trigger, task }
    }

    /// Requests an immediate tick. Requests made during a tick are
    /// coalesced into one follow-up tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Returns `true` until the timer is stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the timer.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for PollFallback {
    fn drop(&mut self) {
        self.task.abort();
    }
}
