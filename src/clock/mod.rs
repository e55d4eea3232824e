use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Callback invoked with the end (ns since epoch) of every window that closes.
pub type WindowClosedFn = Box<dyn Fn(u64) + Send + Sync>;

/// Upper bound on the boundary polling period.
const MAX_POLL: Duration = Duration::from_millis(100);

/// Wall clock that tracks fixed-width window boundaries.
///
/// A window `[k * W, (k + 1) * W)` is reported closed once the wall clock
/// passes its end plus `grace`, so late events still have a chance to land.
pub struct WindowClock {
    window_ns: u64,
    grace_ns: u64,
    current_window: Arc<AtomicU64>,
    callbacks: Arc<parking_lot::Mutex<Vec<WindowClosedFn>>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for WindowClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowClock")
            .field("window_ns", &self.window_ns)
            .field("grace_ns", &self.grace_ns)
            .finish()
    }
}

impl WindowClock {
    /// Create a clock for windows of `window`, closing each `grace` after its end.
    pub fn new(window: Duration, grace: Duration) -> Result<Self> {
        let window_ns = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
        if window_ns == 0 {
            bail!("window duration must be > 0");
        }
        let grace_ns = u64::try_from(grace.as_nanos()).unwrap_or(u64::MAX);

        let index = window_index(now_ns(), window_ns, grace_ns);

        Ok(Self {
            window_ns,
            grace_ns,
            current_window: Arc::new(AtomicU64::new(index)),
            callbacks: Arc::new(parking_lot::Mutex::new(Vec::with_capacity(2))),
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn window_ns(&self) -> u64 {
        self.window_ns
    }

    /// Nanoseconds since the Unix epoch.
    pub fn now_ns(&self) -> u64 {
        now_ns()
    }

    /// Start of the window containing `timestamp_ns`.
    pub fn window_start(&self, timestamp_ns: u64) -> u64 {
        timestamp_ns - timestamp_ns % self.window_ns
    }

    /// Exclusive end of the window containing `timestamp_ns`.
    pub fn window_end(&self, timestamp_ns: u64) -> u64 {
        self.window_start(timestamp_ns).saturating_add(self.window_ns)
    }

    /// Register a callback that fires when a window closes.
    pub fn on_window_closed(&self, f: WindowClosedFn) {
        self.callbacks.lock().push(f);
    }

    /// Start the background boundary polling task.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let window_ns = self.window_ns;
        let grace_ns = self.grace_ns;
        let current_window = Arc::clone(&self.current_window);
        let callbacks = Arc::clone(&self.callbacks);
        let cancel = self.cancel.clone();
        let poll = Duration::from_nanos(window_ns / 10)
            .clamp(Duration::from_millis(1), MAX_POLL);

        info!(window_ns, grace_ns, poll = ?poll, "window clock started");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("window clock stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let new_index = window_index(now_ns(), window_ns, grace_ns);
                        let old_index = current_window.load(Ordering::Relaxed);

                        if new_index != old_index {
                            current_window.store(new_index, Ordering::Relaxed);
                            let closed_end = new_index.saturating_mul(window_ns);
                            debug!(window_end_ns = closed_end, "window closed");

                            let cbs = callbacks.lock();
                            for cb in cbs.iter() {
                                cb(closed_end);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Stop the background task.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for WindowClock {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Nanoseconds since the Unix epoch, 0 before it.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Index of the newest window whose end plus grace has not passed yet.
fn window_index(now_ns: u64, window_ns: u64, grace_ns: u64) -> u64 {
    now_ns.saturating_sub(grace_ns) / window_ns
}
