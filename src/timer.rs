//! Per-matrix watchdog countdown. The timer state lives inside the matrix
//! and is only touched under the matrix lock; the generation token lets the
//! daemon's watchdog thread detect that a deadline it captured belongs to a
//! matrix that has since been closed or flushed.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct WatchdogTimer {
    armed: bool,
    deadline: Option<Instant>,
    window: Duration,
    generation: u64,
}

impl WatchdogTimer {
    pub fn new() -> Self {
        WatchdogTimer {
            armed: false,
            deadline: None,
            window: Duration::ZERO,
            generation: 0,
        }
    }

    /// Arms the countdown. Bumps the generation so any snapshot of the
    /// previous arming can no longer fire.
    pub fn start(&mut self, window: Duration) {
        self.generation += 1;
        self.window = window;
        self.deadline = Some(Instant::now() + window);
        self.armed = true;
    }

    /// Explicit cancel. The generation bump is what makes a concurrent
    /// stale fire a no-op.
    pub fn stop(&mut self) {
        self.armed = false;
        self.generation += 1;
    }

    /// Restarts the countdown without changing the timer's identity.
    pub fn rewind(&mut self) {
        if self.armed {
            self.deadline = Some(Instant::now() + self.window);
        }
    }

    /// Called when the owning slot is reset for reuse.
    pub fn invalidate(&mut self) {
        self.stop();
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.armed && self.deadline.map_or(false, |d| now >= d)
    }
}

impl Default for WatchdogTimer {
    fn default() -> Self {
        Self::new()
    }
}
