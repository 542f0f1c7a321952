//! Local discovery announcement
//!
//! Assembles the privet mDNS TXT record and keeps it published while local
//! discovery is enabled, republishing when settings, registration state,
//! or connectivity change.

use std::cell::Cell;
use std::rc::Rc;

use tracing::debug;

use crate::cloud::DeviceRegistration;
use crate::config::Config;
use crate::provider::{ConnectionState, DnsServiceDiscovery, Network};
use crate::settings::Settings;
use crate::types::GcdState;

pub const PRIVET_SERVICE_TYPE: &str = "_privet._tcp";
const TXT_VERSION: &str = "3";

// ----------------------------------------------------------------------------
// TXT Assembly
// ----------------------------------------------------------------------------

/// Build the privet TXT record. Flags: first char `A` in setup-AP mode,
/// `B` with the station connected, `C` otherwise; second char `B` when
/// registered, `D` when not.
pub fn build_txt(
    settings: &Settings,
    registered: bool,
    station_connected: bool,
    ap_mode: bool,
) -> Vec<String> {
    let connection_flag = if ap_mode {
        'A'
    } else if station_connected {
        'B'
    } else {
        'C'
    };
    let registration_flag = if registered { 'B' } else { 'D' };

    let mut txt = vec![
        format!("txtvers={TXT_VERSION}"),
        format!("ty={}", settings.name),
        format!("id={}", settings.device_id),
        format!("mmid={}", settings.model_id),
        "services=_base".to_string(),
        format!("flags={connection_flag}{registration_flag}"),
    ];
    if registered {
        txt.push(format!("gcd_id={}", settings.device_id));
    }
    txt
}

// ----------------------------------------------------------------------------
// Publisher
// ----------------------------------------------------------------------------

pub struct PrivetPublisher {
    dns_sd: Rc<dyn DnsServiceDiscovery>,
    config: Config,
    registration: DeviceRegistration,
    network: Option<Rc<dyn Network>>,
    http_port: u16,
    ap_mode: Cell<bool>,
    published: Cell<bool>,
}

impl PrivetPublisher {
    pub fn new(
        dns_sd: Rc<dyn DnsServiceDiscovery>,
        config: Config,
        registration: DeviceRegistration,
        network: Option<Rc<dyn Network>>,
        http_port: u16,
    ) -> Rc<Self> {
        let publisher = Rc::new(Self {
            dns_sd,
            config,
            registration,
            network,
            http_port,
            ap_mode: Cell::new(false),
            published: Cell::new(false),
        });

        {
            let this = publisher.clone();
            publisher
                .config
                .add_on_changed_callback(Rc::new(move |_| this.publish()));
        }
        {
            let this = publisher.clone();
            publisher
                .registration
                .add_gcd_state_changed_callback(Rc::new(move |_| this.publish()));
        }
        if let Some(network) = &publisher.network {
            let this = publisher.clone();
            network.add_connection_changed_callback(Rc::new(move || this.publish()));
        }

        publisher
    }

    /// The WiFi bootstrap monitor reports setup-AP transitions here.
    pub fn set_ap_mode(&self, ap_mode: bool) {
        self.ap_mode.set(ap_mode);
        self.publish();
    }

    pub fn publish(&self) {
        let settings = self.config.settings();
        if !settings.local_discovery_enabled {
            if self.published.replace(false) {
                debug!("stopping local discovery");
                self.dns_sd.stop_publishing(PRIVET_SERVICE_TYPE);
            }
            return;
        }

        let registered = matches!(
            self.registration.gcd_state(),
            GcdState::Connecting
                | GcdState::Connected
                | GcdState::Disconnected
                | GcdState::InvalidCredentials
        );
        let station_connected = self
            .network
            .as_ref()
            .map(|network| network.connection_state() == ConnectionState::Connected)
            .unwrap_or(false);

        let txt = build_txt(&settings, registered, station_connected, self.ap_mode.get());
        self.dns_sd
            .publish_service(PRIVET_SERVICE_TYPE, self.http_port, &txt);
        self.published.set(true);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.name = "TEST_NAME".into();
        settings.device_id = "TEST_DEVICE_ID".into();
        settings.model_id = "ABCDE".into();
        settings
    }

    #[test]
    fn txt_for_unregistered_station() {
        let txt = build_txt(&settings(), false, true, false);
        assert!(txt.contains(&"txtvers=3".to_string()));
        assert!(txt.contains(&"ty=TEST_NAME".to_string()));
        assert!(txt.contains(&"id=TEST_DEVICE_ID".to_string()));
        assert!(txt.contains(&"mmid=ABCDE".to_string()));
        assert!(txt.contains(&"services=_base".to_string()));
        assert!(txt.contains(&"flags=BD".to_string()));
        assert!(!txt.iter().any(|entry| entry.starts_with("gcd_id=")));
    }

    #[test]
    fn txt_for_registered_device() {
        let mut settings = settings();
        settings.device_id = "CLOUD_ID".into();
        let txt = build_txt(&settings, true, true, false);
        assert!(txt.contains(&"flags=BB".to_string()));
        assert!(txt.contains(&"gcd_id=CLOUD_ID".to_string()));
    }

    #[test]
    fn txt_in_setup_ap_mode() {
        let txt = build_txt(&settings(), false, false, true);
        assert!(txt.contains(&"flags=AD".to_string()));
    }
}
