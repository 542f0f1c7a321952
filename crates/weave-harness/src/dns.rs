//! Recording mDNS provider

use std::cell::RefCell;
use std::rc::Rc;

use weave_core::provider::DnsServiceDiscovery;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsEvent {
    Published {
        service_type: String,
        port: u16,
        txt: Vec<String>,
    },
    Stopped {
        service_type: String,
    },
}

/// mDNS double that records publish/stop calls.
#[derive(Clone)]
pub struct FakeDnsServiceDiscovery {
    events: Rc<RefCell<Vec<DnsEvent>>>,
}

impl FakeDnsServiceDiscovery {
    pub fn new() -> Self {
        Self {
            events: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Vec<DnsEvent> {
        self.events.borrow().clone()
    }

    pub fn last_published_txt(&self) -> Option<Vec<String>> {
        self.events
            .borrow()
            .iter()
            .rev()
            .find_map(|event| match event {
                DnsEvent::Published { txt, .. } => Some(txt.clone()),
                DnsEvent::Stopped { .. } => None,
            })
    }
}

impl Default for FakeDnsServiceDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsServiceDiscovery for FakeDnsServiceDiscovery {
    fn publish_service(&self, service_type: &str, port: u16, txt: &[String]) {
        self.events.borrow_mut().push(DnsEvent::Published {
            service_type: service_type.to_string(),
            port,
            txt: txt.to_vec(),
        });
    }

    fn stop_publishing(&self, service_type: &str) {
        self.events.borrow_mut().push(DnsEvent::Stopped {
            service_type: service_type.to_string(),
        });
    }
}
