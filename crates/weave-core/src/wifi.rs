//! WiFi bootstrap monitor
//!
//! Watches connectivity and falls back to a setup access point when the
//! station stays offline: one minute of lost connectivity starts the AP;
//! with a previously configured SSID the AP stops after five minutes to
//! retry the station, cycling until connectivity returns.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::provider::{Clock, ConnectionState, Network, TaskRunner, Wifi};
use crate::types::Timestamp;

/// Offline dwell before the setup AP starts.
pub const OFFLINE_TIMEOUT: Duration = Duration::from_secs(60);

/// Time spent in AP mode before retrying the station (only with a
/// previously configured SSID to go back to).
pub const ACCESS_POINT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Monitoring,
    AccessPoint,
}

struct Inner {
    config: Config,
    network: Rc<dyn Network>,
    wifi: Rc<dyn Wifi>,
    runner: Rc<dyn TaskRunner>,
    clock: Rc<dyn Clock>,
    state: State,
    offline_since: Option<Timestamp>,
    /// Bumped to invalidate outstanding timers.
    generation: u64,
    on_ap_changed: Vec<Rc<dyn Fn(bool)>>,
}

#[derive(Clone)]
pub struct WifiBootstrapManager {
    inner: Rc<RefCell<Inner>>,
}

impl WifiBootstrapManager {
    pub fn new(
        config: Config,
        network: Rc<dyn Network>,
        wifi: Rc<dyn Wifi>,
        runner: Rc<dyn TaskRunner>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                config,
                network,
                wifi,
                runner,
                clock,
                state: State::Monitoring,
                offline_since: None,
                generation: 0,
                on_ap_changed: Vec::new(),
            })),
        }
    }

    pub fn start(&self) {
        let network = self.inner.borrow().network.clone();
        let this = self.clone();
        network.add_connection_changed_callback(Rc::new(move || this.on_connectivity_changed()));
        self.on_connectivity_changed();
    }

    /// Fires with `true` when the setup AP starts and `false` when it
    /// stops.
    pub fn add_access_point_changed_callback(&self, callback: Rc<dyn Fn(bool)>) {
        self.inner.borrow_mut().on_ap_changed.push(callback);
    }

    pub fn in_access_point_mode(&self) -> bool {
        self.inner.borrow().state == State::AccessPoint
    }

    fn on_connectivity_changed(&self) {
        let connected = {
            let inner = self.inner.borrow();
            inner.network.connection_state() == ConnectionState::Connected
        };
        if connected {
            let stopped_ap = {
                let mut inner = self.inner.borrow_mut();
                inner.generation += 1;
                inner.offline_since = None;
                if inner.state == State::AccessPoint {
                    info!("station reconnected; stopping setup AP");
                    inner.wifi.stop_access_point();
                    inner.state = State::Monitoring;
                    true
                } else {
                    false
                }
            };
            if stopped_ap {
                self.fire_ap_changed(false);
            }
        } else {
            let schedule = {
                let mut inner = self.inner.borrow_mut();
                if inner.state == State::Monitoring && inner.offline_since.is_none() {
                    inner.offline_since = Some(inner.clock.now());
                    Some(inner.generation)
                } else {
                    None
                }
            };
            if let Some(generation) = schedule {
                self.schedule_offline_check(generation);
            }
        }
    }

    fn schedule_offline_check(&self, generation: u64) {
        let this = self.clone();
        let runner = self.inner.borrow().runner.clone();
        runner.post_delayed(
            OFFLINE_TIMEOUT,
            Box::new(move || this.on_offline_timeout(generation)),
        );
    }

    fn on_offline_timeout(&self, generation: u64) {
        let should_cycle = {
            let mut inner = self.inner.borrow_mut();
            if inner.generation != generation || inner.state != State::Monitoring {
                return;
            }
            let offline = inner.network.connection_state() != ConnectionState::Connected;
            let Some(since) = inner.offline_since else {
                return;
            };
            if !offline || inner.clock.now() - since < OFFLINE_TIMEOUT {
                return;
            }
            let ssid = setup_ssid(&inner.config);
            info!(ssid = %ssid, "starting setup AP");
            inner.wifi.start_access_point(&ssid);
            inner.state = State::AccessPoint;
            // Only cycle back to the station if there is a known network
            // to reconnect to.
            !inner.config.settings().last_configured_ssid.is_empty()
        };
        self.fire_ap_changed(true);
        if should_cycle {
            let this = self.clone();
            let runner = self.inner.borrow().runner.clone();
            runner.post_delayed(
                ACCESS_POINT_TIMEOUT,
                Box::new(move || this.on_access_point_timeout(generation)),
            );
        }
    }

    fn on_access_point_timeout(&self, generation: u64) {
        let retry = {
            let mut inner = self.inner.borrow_mut();
            if inner.generation != generation || inner.state != State::AccessPoint {
                return;
            }
            info!("setup AP window over; retrying station");
            inner.wifi.stop_access_point();
            inner.state = State::Monitoring;
            inner.offline_since = Some(inner.clock.now());
            inner.generation
        };
        self.fire_ap_changed(false);
        self.schedule_offline_check(retry);
    }

    fn fire_ap_changed(&self, ap_mode: bool) {
        let callbacks = self.inner.borrow().on_ap_changed.clone();
        for callback in callbacks {
            callback(ap_mode);
        }
    }
}

fn setup_ssid(config: &Config) -> String {
    let name = config.settings().name;
    if name.is_empty() {
        "weave.prv".to_string()
    } else {
        format!("{name}.prv")
    }
}
