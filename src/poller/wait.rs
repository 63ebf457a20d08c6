//! Idle behavior between polling passes.

use crate::config::PollMode;
use std::thread;
use std::time::Duration;

/// Passes that busy polling spins through before yielding the core once.
const BUSY_YIELD_EVERY: u32 = 64;

const SPIN_PASSES: u32 = 1000;
const YIELD_PASSES: u32 = 1100;
const SHORT_SLEEP_PASSES: u32 = 5000;
const SHORT_SLEEP: Duration = Duration::from_micros(10);
const LONG_SLEEP: Duration = Duration::from_micros(100);

/// Decides what a poller does after a pass.
pub trait WaitStrategy: Send {
    /// Called after a pass that found no completions.
    fn idle(&mut self);

    /// Called after a pass that found work.
    fn reset(&mut self);
}

/// Poll continuously.
#[derive(Debug, Default)]
pub struct BusyPoll {
    idle_passes: u32,
}

impl WaitStrategy for BusyPoll {
    fn idle(&mut self) {
        self.idle_passes = self.idle_passes.wrapping_add(1);
        if self.idle_passes % BUSY_YIELD_EVERY == 0 {
            thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }

    fn reset(&mut self) {
        self.idle_passes = 0;
    }
}

/// Spin, then yield, then sleep for growing intervals.
#[derive(Debug, Default)]
pub struct Backoff {
    idle_passes: u32,
}

impl Backoff {
    /// The pause the next idle pass will take.
    fn tier(&self) -> Option<Duration> {
        match self.idle_passes {
            n if n < SPIN_PASSES => None,
            n if n < YIELD_PASSES => Some(Duration::ZERO),
            n if n < SHORT_SLEEP_PASSES => Some(SHORT_SLEEP),
            _ => Some(LONG_SLEEP),
        }
    }
}

impl WaitStrategy for Backoff {
    fn idle(&mut self) {
        match self.tier() {
            None => std::hint::spin_loop(),
            Some(pause) if pause.is_zero() => thread::yield_now(),
            Some(pause) => thread::sleep(pause),
        }
        self.idle_passes = self.idle_passes.saturating_add(1);
    }

    fn reset(&mut self) {
        self.idle_passes = 0;
    }
}

/// Builds the strategy `mode` selects.
pub fn strategy_for(mode: PollMode) -> Box<dyn WaitStrategy> {
    match mode {
        PollMode::Busy => Box::new(BusyPoll::default()),
        PollMode::Backoff => Box::new(Backoff::default()),
    }
}
