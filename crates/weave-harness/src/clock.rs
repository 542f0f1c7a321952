//! Virtual wall clock

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use weave_core::provider::Clock;
use weave_core::Timestamp;

/// Manually driven clock. Clones share the same time.
#[derive(Clone)]
pub struct FakeClock {
    now: Rc<Cell<Timestamp>>,
}

impl FakeClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.set(now);
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    pub fn now(&self) -> Timestamp {
        self.now.get()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Timestamp {
        self.now.get()
    }
}
