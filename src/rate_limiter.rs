//! Per-client sliding-window admission control
//!
//! Every key (the client IP) owns a fixed-capacity ring of admission
//! timestamps. A request is admitted when fewer than `capacity` admissions
//! happened within the trailing window. Windows whose newest admission has
//! aged out carry no state that affects future decisions, so a periodic sweep
//! evicts them to bound memory under client churn.

use crate::task::PeriodicTask;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Rolling window length used by the relay
pub const WINDOW: Duration = Duration::from_secs(60);

/// Seconds a rejected client is told to wait
pub const RETRY_AFTER_SECS: u64 = 60;

/// Ring of admission timestamps for one key
#[derive(Debug)]
struct SlidingWindow {
    slots: Vec<Option<Instant>>,
    /// Index of the most recently written slot
    cursor: usize,
    last_cleanup: Instant,
}

impl SlidingWindow {
    fn new(capacity: usize, now: Instant) -> Self {
        SlidingWindow {
            slots: vec![None; capacity],
            cursor: capacity - 1,
            last_cleanup: now,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot following the cursor: the oldest admission in write order
    fn oldest_index(&self) -> usize {
        (self.cursor + 1) % self.capacity()
    }

    fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn is_aged(slot: Option<Instant>, now: Instant, window: Duration) -> bool {
        slot.is_some_and(|t| now.saturating_duration_since(t) > window)
    }

    /// Zero aged slots, oldest first, stopping at the first live one
    fn cleanup(&mut self, now: Instant, window: Duration) {
        let mut index = self.oldest_index();
        for _ in 0..self.capacity() {
            if !Self::is_aged(self.slots[index], now, window) {
                break;
            }
            self.slots[index] = None;
            index = (index + 1) % self.capacity();
        }
        self.last_cleanup = now;
    }

    fn admit(&mut self, now: Instant, window: Duration) -> bool {
        if now.saturating_duration_since(self.last_cleanup) > window {
            self.cleanup(now, window);
        }

        let oldest = self.oldest_index();
        if let Some(t) = self.slots[oldest] {
            if now.saturating_duration_since(t) <= window && self.occupied() >= self.capacity() {
                return false;
            }
        }

        self.slots[oldest] = Some(now);
        self.cursor = oldest;
        true
    }

    /// No admission within the window, so dropping the window is lossless
    fn is_idle(&self, now: Instant, window: Duration) -> bool {
        match self.slots[self.cursor] {
            Some(newest) => now.saturating_duration_since(newest) > window,
            None => true,
        }
    }
}

/// Sliding-window rate limiter keyed by client identity
pub struct RateLimiter {
    windows: Mutex<HashMap<String, SlidingWindow>>,
    capacity: usize,
    window: Duration,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl RateLimiter {
    /// Limiter admitting `requests_per_minute` per key per rolling minute
    ///
    /// A capacity of zero is raised to one; configuration validation rejects
    /// it before it gets here.
    pub fn new(requests_per_minute: usize) -> Self {
        Self::with_window(requests_per_minute, WINDOW)
    }

    pub fn with_window(capacity: usize, window: Duration) -> Self {
        RateLimiter {
            windows: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            window,
            sweeper: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit or reject one request for `key`
    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, Instant::now())
    }

    /// [`RateLimiter::admit`] against an explicit clock reading
    pub fn admit_at(&self, key: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        let window = windows
            .entry(key.to_string())
            .or_insert_with(|| SlidingWindow::new(self.capacity, now));

        let admitted = window.admit(now, self.window);
        if !admitted {
            debug!("Rate limit reached for {}", key);
        }
        admitted
    }

    /// Drop windows with no admission inside the trailing window
    ///
    /// # Returns
    /// Number of evicted keys
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, w| !w.is_idle(now, self.window));
        before - windows.len()
    }

    /// Number of keys currently holding a window
    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Start the periodic idle-window sweep
    ///
    /// The task holds a weak reference and ends once the limiter is dropped.
    /// Calling this twice replaces the previous sweep.
    pub fn start(self: &Arc<Self>, sweep_interval: Duration) {
        let limiter: Weak<Self> = Arc::downgrade(self);
        let task = PeriodicTask::spawn("rate-limit-sweep", sweep_interval, move || {
            let Some(limiter) = limiter.upgrade() else {
                return false;
            };
            let evicted = limiter.evict_idle(Instant::now());
            if evicted > 0 {
                info!(
                    "Evicted {} idle rate-limit windows, {} remaining",
                    evicted,
                    limiter.tracked_keys()
                );
            }
            true
        });

        let previous = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if previous.is_some() {
            warn!("Rate limiter sweep restarted");
        }
    }

    /// Stop the idle-window sweep, if running
    pub async fn shutdown(&self) {
        let task = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}
