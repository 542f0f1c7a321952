//! Scripted network provider

use std::cell::RefCell;
use std::rc::Rc;

use weave_core::provider::{ConnectionState, Network, SslSocket, TaskRunner};
use weave_core::Error;

use crate::runner::FakeTaskRunner;

struct Inner {
    state: ConnectionState,
    callbacks: Vec<Rc<dyn Fn()>>,
}

/// Network double with a settable connection state. Socket opens fail with
/// a transport error unless a test needs otherwise.
#[derive(Clone)]
pub struct FakeNetwork {
    runner: FakeTaskRunner,
    inner: Rc<RefCell<Inner>>,
}

impl FakeNetwork {
    pub fn new(runner: FakeTaskRunner, state: ConnectionState) -> Self {
        Self {
            runner,
            inner: Rc::new(RefCell::new(Inner {
                state,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Change the reported state and post the change callbacks.
    pub fn set_connection_state(&self, state: ConnectionState) {
        let callbacks = {
            let mut inner = self.inner.borrow_mut();
            inner.state = state;
            inner.callbacks.clone()
        };
        for callback in callbacks {
            self.runner.post(Box::new(move || callback()));
        }
    }
}

impl Network for FakeNetwork {
    fn connection_state(&self) -> ConnectionState {
        self.inner.borrow().state
    }

    fn add_connection_changed_callback(&self, callback: Rc<dyn Fn()>) {
        self.inner.borrow_mut().callbacks.push(callback);
    }

    fn open_ssl_socket(
        &self,
        host: &str,
        _port: u16,
        callback: Box<dyn FnOnce(weave_core::Result<Box<dyn SslSocket>>)>,
    ) {
        let host = host.to_string();
        self.runner.post(Box::new(move || {
            callback(Err(Error::transport(format!(
                "no socket route to '{host}' in tests"
            ))))
        }));
    }
}
