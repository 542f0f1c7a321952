//! Stub local HTTP server surface

use std::cell::RefCell;
use std::rc::Rc;

use weave_core::provider::{HttpServer, HttpServerRequestCallback};

/// Fixed-port server double exposing a canned certificate fingerprint.
#[derive(Clone)]
pub struct FakeHttpServer {
    fingerprint: Vec<u8>,
    handlers: Rc<RefCell<Vec<String>>>,
}

impl FakeHttpServer {
    pub fn new() -> Self {
        Self {
            fingerprint: vec![1, 2, 3],
            handlers: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn registered_prefixes(&self) -> Vec<String> {
        self.handlers.borrow().clone()
    }
}

impl Default for FakeHttpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpServer for FakeHttpServer {
    fn http_port(&self) -> u16 {
        11
    }

    fn https_port(&self) -> u16 {
        12
    }

    fn https_certificate_fingerprint(&self) -> Vec<u8> {
        self.fingerprint.clone()
    }

    fn add_request_handler(&self, path_prefix: &str, _callback: HttpServerRequestCallback) {
        self.handlers.borrow_mut().push(path_prefix.to_string());
    }

    fn add_on_state_changed_callback(&self, _callback: Rc<dyn Fn()>) {}
}
