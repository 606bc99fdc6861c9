//! The hub's time source. §4.2 requires the clock be monotonic and
//! pluggable ("configurable with any callable returning seconds as a
//! float"); the `GREENHUB_CLOCK` variable (§6, ambient configuration
//! surface) selects between the host monotonic clock and a manually-driven
//! one used by deterministic tests.

use std::cell::Cell;
use std::time::{Duration, Instant};

/// A monotonic time source. `now()` must never go backwards.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// The default clock: the host's monotonic instant, relative to the
/// instant the clock was constructed.
#[derive(Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> MonotonicClock {
        MonotonicClock::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// A clock the test harness advances explicitly, so timer-ordering tests
/// (§8's "timer ordering" scenario) don't depend on wall-clock scheduling
/// jitter. Selected via `GREENHUB_CLOCK=manual`.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Duration>,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock {
            now: Cell::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    pub fn set(&self, at: Duration) {
        self.now.set(at);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

/// The concrete clock a [`Config`](crate::Config) was built with. Only
/// meaningful as the argument/return type for [`crate::ConfigBuilder::clock`]
/// — most embedders never construct this directly.
pub enum AnyClock {
    Monotonic(MonotonicClock),
    Manual(ManualClock),
    Custom(Box<dyn Clock>),
}

impl Clock for AnyClock {
    fn now(&self) -> Duration {
        match self {
            AnyClock::Monotonic(c) => c.now(),
            AnyClock::Manual(c) => c.now(),
            AnyClock::Custom(c) => c.now(),
        }
    }
}
