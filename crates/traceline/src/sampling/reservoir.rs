//! Per-rule rate-limited reservoir.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct WindowState {
    /// Whole seconds elapsed since the reservoir was created.
    window: u64,
    /// Permits handed out in the current window.
    taken: u32,
}

/// A per-second quota of guaranteed-sampled requests.
///
/// The window is tracked against a monotonic clock captured at
/// construction; the counter resets exactly once per elapsed second and
/// never hands out more than `capacity` permits in any one window,
/// regardless of how bursty concurrent access is.
pub struct Reservoir {
    capacity: u32,
    epoch: Instant,
    state: Mutex<WindowState>,
}

impl Reservoir {
    /// Creates a reservoir handing out at most `capacity` permits per
    /// second. A capacity of zero never grants a permit.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            epoch: Instant::now(),
            state: Mutex::new(WindowState {
                window: 0,
                taken: 0,
            }),
        }
    }

    /// Maximum permits per one-second window.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Attempts to take a permit from the current window.
    pub fn take(&self) -> bool {
        self.take_at(self.epoch.elapsed())
    }

    fn take_at(&self, elapsed: Duration) -> bool {
        let window = elapsed.as_secs();
        let mut state = self.lock();
        if state.window != window {
            state.window = window;
            state.taken = 0;
        }
        if state.taken < self.capacity {
            state.taken += 1;
            true
        } else {
            false
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_at_most_capacity_per_window() {
        let reservoir = Reservoir::new(5);
        let now = Duration::from_millis(100);
        let granted = (0..50).filter(|_| reservoir.take_at(now)).count();
        assert_eq!(granted, 5);
    }

    #[test]
    fn window_rollover_resets_once() {
        let reservoir = Reservoir::new(2);
        assert!(reservoir.take_at(Duration::from_millis(100)));
        assert!(reservoir.take_at(Duration::from_millis(200)));
        assert!(!reservoir.take_at(Duration::from_millis(900)));
        // Next second: fresh quota.
        assert!(reservoir.take_at(Duration::from_millis(1100)));
        assert!(reservoir.take_at(Duration::from_millis(1200)));
        assert!(!reservoir.take_at(Duration::from_millis(1300)));
    }

    #[test]
    fn zero_capacity_never_grants() {
        let reservoir = Reservoir::new(0);
        assert!(!reservoir.take_at(Duration::from_millis(10)));
        assert!(!reservoir.take_at(Duration::from_secs(5)));
    }

    #[test]
    fn concurrent_burst_respects_bound() {
        use std::sync::Arc;
        let reservoir = Arc::new(Reservoir::new(8));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let reservoir = Arc::clone(&reservoir);
            handles.push(std::thread::spawn(move || {
                let now = Duration::from_millis(500);
                (0..100).filter(|_| reservoir.take_at(now)).count()
            }));
        }
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 8);
    }
}
