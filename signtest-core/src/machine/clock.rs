//! Time source for the bring-up loop.

use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use crate::telemetry::TimestampMicros;

/// Injectable clock: timestamps samples and implements every delay the
/// machine takes.
pub trait Clock {
    fn now(&self) -> TimestampMicros;
    fn sleep(&self, duration: Duration);
}

impl<C> Clock for &C
where
    C: Clock + ?Sized,
{
    fn now(&self) -> TimestampMicros {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Wall clock measured from construction; sleeps block the thread.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> TimestampMicros {
        micros(self.epoch.elapsed())
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Virtual clock that only moves when slept on or advanced. Clones share
/// the same time line.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Rc<Cell<TimestampMicros>>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get().saturating_add(micros(duration)));
    }

    /// Total virtual time elapsed since construction.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.now.get())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimestampMicros {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
