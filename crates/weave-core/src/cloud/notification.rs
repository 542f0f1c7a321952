//! Cloud notification channels
//!
//! Abstraction over how the device learns about new cloud commands: a
//! persistent push socket when the embedder enables it, or a fixed-cadence
//! pull. The push channel treats inbound socket activity as a poll trigger
//! and degrades to pull when the socket cannot be kept alive.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cloud::backoff::Backoff;
use crate::provider::{Network, SslSocket, TaskRunner};

/// Cadence of the pull channel.
pub const PULL_PERIOD: Duration = Duration::from_secs(30);

/// Socket failures tolerated before the push channel gives up.
const MAX_SOCKET_FAILURES: u32 = 5;

// ----------------------------------------------------------------------------
// Delegate
// ----------------------------------------------------------------------------

/// Sink for channel events; implemented by the registration machinery.
pub trait NotificationDelegate {
    fn on_connected(&self, channel_name: &'static str);
    fn on_disconnected(&self);
    /// The channel believes new commands may be queued.
    fn on_command_notification(&self);
    /// The channel cannot recover; the owner should fall back to pull.
    fn on_permanent_failure(&self);
}

pub trait NotificationChannel {
    fn name(&self) -> &'static str;
    fn start(&self, delegate: Rc<dyn NotificationDelegate>);
    fn stop(&self);
}

// ----------------------------------------------------------------------------
// Pull Channel
// ----------------------------------------------------------------------------

struct PullInner {
    delegate: Option<Rc<dyn NotificationDelegate>>,
    generation: u64,
}

/// Fixed-cadence poll trigger. Always available; the fallback for every
/// push failure.
pub struct PullChannel {
    runner: Rc<dyn TaskRunner>,
    period: Duration,
    inner: Rc<RefCell<PullInner>>,
}

impl PullChannel {
    pub fn new(runner: Rc<dyn TaskRunner>) -> Self {
        Self::with_period(runner, PULL_PERIOD)
    }

    pub fn with_period(runner: Rc<dyn TaskRunner>, period: Duration) -> Self {
        Self {
            runner,
            period,
            inner: Rc::new(RefCell::new(PullInner {
                delegate: None,
                generation: 0,
            })),
        }
    }

    fn schedule(
        runner: &Rc<dyn TaskRunner>,
        period: Duration,
        inner: &Rc<RefCell<PullInner>>,
        generation: u64,
    ) {
        let weak: Weak<RefCell<PullInner>> = Rc::downgrade(inner);
        let runner_clone = runner.clone();
        runner.post_delayed(
            period,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let delegate = {
                    let inner_ref = inner.borrow();
                    if inner_ref.generation != generation {
                        return; // stopped or restarted
                    }
                    inner_ref.delegate.clone()
                };
                if let Some(delegate) = delegate {
                    delegate.on_command_notification();
                    Self::schedule(&runner_clone, period, &inner, generation);
                }
            }),
        );
    }
}

impl NotificationChannel for PullChannel {
    fn name(&self) -> &'static str {
        "pull"
    }

    fn start(&self, delegate: Rc<dyn NotificationDelegate>) {
        let generation = {
            let mut inner = self.inner.borrow_mut();
            inner.generation += 1;
            inner.delegate = Some(delegate.clone());
            inner.generation
        };
        delegate.on_connected(self.name());
        Self::schedule(&self.runner, self.period, &self.inner, generation);
    }

    fn stop(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.generation += 1;
        inner.delegate = None;
    }
}

// ----------------------------------------------------------------------------
// Push Channel
// ----------------------------------------------------------------------------

struct PushInner {
    delegate: Option<Rc<dyn NotificationDelegate>>,
    backoff: Backoff,
    failures: u32,
    generation: u64,
}

/// Persistent TLS socket to the notification endpoint. Reconnects on the
/// shared backoff ladder; reports permanent failure after repeated losses.
pub struct PushChannel {
    network: Rc<dyn Network>,
    runner: Rc<dyn TaskRunner>,
    host: String,
    port: u16,
    inner: Rc<RefCell<PushInner>>,
}

impl PushChannel {
    pub fn new(
        network: Rc<dyn Network>,
        runner: Rc<dyn TaskRunner>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            network,
            runner,
            host: host.into(),
            port,
            inner: Rc::new(RefCell::new(PushInner {
                delegate: None,
                backoff: Backoff::new(),
                failures: 0,
                generation: 0,
            })),
        }
    }

    fn connect(self: Rc<Self>, generation: u64) {
        let this = self.clone();
        self.network.open_ssl_socket(
            &self.host,
            self.port,
            Box::new(move |result| this.on_socket(generation, result)),
        );
    }

    fn on_socket(
        self: Rc<Self>,
        generation: u64,
        result: crate::error::Result<Box<dyn SslSocket>>,
    ) {
        let delegate = {
            let inner = self.inner.borrow();
            if inner.generation != generation {
                return;
            }
            inner.delegate.clone()
        };
        let Some(delegate) = delegate else {
            return;
        };
        match result {
            Ok(socket) => {
                info!(host = %self.host, "notification socket connected");
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.backoff.reset();
                    inner.failures = 0;
                }
                delegate.on_connected(self.name());
                let socket: Rc<dyn SslSocket> = Rc::from(socket);
                self.read_loop(generation, socket);
            }
            Err(err) => {
                debug!(%err, "notification socket connect failed");
                self.on_failure(generation, delegate);
            }
        }
    }

    fn read_loop(self: Rc<Self>, generation: u64, socket: Rc<dyn SslSocket>) {
        let this = self.clone();
        let socket_again = socket.clone();
        socket.receive(Box::new(move |result| {
            let delegate = {
                let inner = this.inner.borrow();
                if inner.generation != generation {
                    return;
                }
                inner.delegate.clone()
            };
            let Some(delegate) = delegate else {
                return;
            };
            match result {
                Ok(data) => {
                    if !data.is_empty() {
                        delegate.on_command_notification();
                    }
                    this.read_loop(generation, socket_again);
                }
                Err(err) => {
                    warn!(%err, "notification socket lost");
                    delegate.on_disconnected();
                    this.on_failure(generation, delegate);
                }
            }
        }));
    }

    fn on_failure(self: Rc<Self>, generation: u64, delegate: Rc<dyn NotificationDelegate>) {
        let delay = {
            let mut inner = self.inner.borrow_mut();
            inner.failures += 1;
            if inner.failures > MAX_SOCKET_FAILURES {
                None
            } else {
                Some(inner.backoff.next_delay())
            }
        };
        match delay {
            None => {
                warn!("notification socket failed repeatedly; falling back to pull");
                delegate.on_permanent_failure();
            }
            Some(delay) => {
                let this = self.clone();
                self.runner
                    .post_delayed(delay, Box::new(move || this.connect(generation)));
            }
        }
    }
}

impl NotificationChannel for Rc<PushChannel> {
    fn name(&self) -> &'static str {
        "push"
    }

    fn start(&self, delegate: Rc<dyn NotificationDelegate>) {
        let generation = {
            let mut inner = self.inner.borrow_mut();
            inner.generation += 1;
            inner.delegate = Some(delegate);
            inner.failures = 0;
            inner.generation
        };
        self.clone().connect(generation);
    }

    fn stop(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.generation += 1;
        inner.delegate = None;
    }
}

impl PushChannel {
    fn name(&self) -> &'static str {
        "push"
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;
    use weave_harness::{FakeClock, FakeTaskRunner};

    struct CountingDelegate {
        notifications: RefCell<u32>,
        connected: RefCell<u32>,
    }

    impl NotificationDelegate for CountingDelegate {
        fn on_connected(&self, _channel_name: &'static str) {
            *self.connected.borrow_mut() += 1;
        }
        fn on_disconnected(&self) {}
        fn on_command_notification(&self) {
            *self.notifications.borrow_mut() += 1;
        }
        fn on_permanent_failure(&self) {}
    }

    #[test]
    fn pull_channel_ticks_at_cadence() {
        let clock = FakeClock::new(Timestamp::from_secs(0));
        let runner = FakeTaskRunner::new(clock.clone());
        let channel = PullChannel::with_period(Rc::new(runner.clone()), Duration::from_secs(30));
        let delegate = Rc::new(CountingDelegate {
            notifications: RefCell::new(0),
            connected: RefCell::new(0),
        });

        channel.start(delegate.clone());
        assert_eq!(*delegate.connected.borrow(), 1);
        runner.run_for(Duration::from_secs(95));
        assert_eq!(*delegate.notifications.borrow(), 3);
    }

    #[test]
    fn stop_cancels_future_ticks() {
        let clock = FakeClock::new(Timestamp::from_secs(0));
        let runner = FakeTaskRunner::new(clock.clone());
        let channel = PullChannel::with_period(Rc::new(runner.clone()), Duration::from_secs(30));
        let delegate = Rc::new(CountingDelegate {
            notifications: RefCell::new(0),
            connected: RefCell::new(0),
        });

        channel.start(delegate.clone());
        runner.run_for(Duration::from_secs(35));
        channel.stop();
        runner.run_for(Duration::from_secs(120));
        assert_eq!(*delegate.notifications.borrow(), 1);
    }
}
