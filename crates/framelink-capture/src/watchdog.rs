//! Stall detector for the producer loop.
//!
//! No background thread: the loop feeds the watchdog on every published
//! frame and asks `check` on every timeout tick. Time comes from the
//! injected [`Clock`] so expiry is testable without sleeping.

use std::time::{Duration, Instant};

use framelink_foundation::clock::{real_clock, SharedClock};

pub struct FrameWatchdog {
    timeout: Duration,
    clock: SharedClock,
    last_feed: Option<Instant>,
    trigger_count: u64,
}

impl FrameWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self::with_clock(timeout, real_clock())
    }

    pub fn with_clock(timeout: Duration, clock: SharedClock) -> Self {
        Self {
            timeout,
            clock,
            last_feed: None,
            trigger_count: 0,
        }
    }

    /// Start (or restart) the expiry window. Unarmed watchdogs never fire.
    pub fn arm(&mut self) {
        self.last_feed = Some(self.clock.now());
    }

    pub fn disarm(&mut self) {
        self.last_feed = None;
    }

    /// Record frame activity, pushing expiry out by the full timeout.
    pub fn feed(&mut self) {
        self.last_feed = Some(self.clock.now());
    }

    /// True once the window has elapsed without a feed. Firing rearms the
    /// watchdog so the recovery gets a fresh window before the next trigger.
    pub fn check(&mut self) -> bool {
        let Some(last) = self.last_feed else {
            return false;
        };
        if self.clock.now().duration_since(last) < self.timeout {
            return false;
        }
        self.trigger_count += 1;
        self.arm();
        true
    }

    pub fn trigger_count(&self) -> u64 {
        self.trigger_count
    }
}
