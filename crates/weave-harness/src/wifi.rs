//! Recording WiFi provider

use std::cell::RefCell;
use std::rc::Rc;

use weave_core::provider::Wifi;
use weave_core::Timestamp;

use crate::clock::FakeClock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiEvent {
    AccessPointStarted { ssid: String, at: Timestamp },
    AccessPointStopped { at: Timestamp },
}

/// WiFi double that records AP toggles with virtual timestamps.
#[derive(Clone)]
pub struct FakeWifi {
    clock: FakeClock,
    events: Rc<RefCell<Vec<WifiEvent>>>,
}

impl FakeWifi {
    pub fn new(clock: FakeClock) -> Self {
        Self {
            clock,
            events: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Vec<WifiEvent> {
        self.events.borrow().clone()
    }

    pub fn take_events(&self) -> Vec<WifiEvent> {
        self.events.borrow_mut().drain(..).collect()
    }
}

impl Wifi for FakeWifi {
    fn start_access_point(&self, ssid: &str) {
        self.events.borrow_mut().push(WifiEvent::AccessPointStarted {
            ssid: ssid.to_string(),
            at: self.clock.now(),
        });
    }

    fn stop_access_point(&self) {
        self.events
            .borrow_mut()
            .push(WifiEvent::AccessPointStopped {
                at: self.clock.now(),
            });
    }
}
