//! Bounded spin/yield/park idle strategy for offer-retry loops.

use crate::config::DownstreamConfig;
use std::thread;
use std::time::Duration;

/// Escalates from busy-spinning through yielding to parking with
/// exponentially growing sleeps, capped at a maximum park period.
///
/// [`BackoffIdleStrategy::idle`] returns `true` once the strategy has
/// saturated at the maximum park period; callers use that as the cue to
/// re-check the global failure flag before retrying again.
#[derive(Debug)]
pub struct BackoffIdleStrategy {
    max_spins: u64,
    max_yields: u64,
    min_park: Duration,
    max_park: Duration,
    spins: u64,
    yields: u64,
    park_period: Duration,
}

impl BackoffIdleStrategy {
    pub fn new(config: &DownstreamConfig) -> Self {
        Self {
            max_spins: config.max_spins,
            max_yields: config.max_yields,
            min_park: Duration::from_micros(config.min_park_micros),
            max_park: Duration::from_micros(config.max_park_micros),
            spins: 0,
            yields: 0,
            park_period: Duration::from_micros(config.min_park_micros),
        }
    }

    /// Idles once at the current escalation level. Returns `true` when the
    /// maximum park period has been reached.
    pub fn idle(&mut self) -> bool {
        if self.spins < self.max_spins {
            self.spins += 1;
            std::hint::spin_loop();
            false
        } else if self.yields < self.max_yields {
            self.yields += 1;
            thread::yield_now();
            false
        } else {
            thread::sleep(self.park_period);
            let saturated = self.park_period >= self.max_park;
            if !saturated {
                self.park_period = (self.park_period * 2).min(self.max_park);
            }
            saturated
        }
    }

    /// Resets the escalation after a successful operation.
    pub fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park_period = self.min_park;
    }
}
