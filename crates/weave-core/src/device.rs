//! Device manager façade
//!
//! Composes the sub-managers into the single surface an embedder talks
//! to. Ownership is strictly one-way: the device owns its managers;
//! managers receive each other only as borrowed handles at construction.

use std::rc::Rc;

use serde_json::{Map, Value};

use crate::auth::AuthManager;
use crate::cloud::{CloudOptions, DeviceRegistration};
use crate::command::{Command, CommandHandler, CommandOrigin};
use crate::component::ComponentManager;
use crate::config::{Config, SettingsChangedCallback};
use crate::error::Result;
use crate::handlers::{AccessApiHandler, BaseApiHandler};
use crate::privet::PrivetPublisher;
use crate::provider::{
    Clock, ConfigStore, DnsServiceDiscovery, HttpClient, HttpServer, Network, TaskRunner, Wifi,
};
use crate::revocation::AccessRevocationManager;
use crate::settings::Settings;
use crate::types::{GcdState, RegistrationData, UserRole};
use crate::wifi::WifiBootstrapManager;

// ----------------------------------------------------------------------------
// Providers
// ----------------------------------------------------------------------------

/// External collaborators injected by the embedder. Optional providers
/// disable the features that need them.
pub struct Providers {
    pub task_runner: Rc<dyn TaskRunner>,
    pub clock: Rc<dyn Clock>,
    pub config_store: Rc<dyn ConfigStore>,
    pub http_client: Rc<dyn HttpClient>,
    pub network: Option<Rc<dyn Network>>,
    pub dns_sd: Option<Rc<dyn DnsServiceDiscovery>>,
    pub http_server: Option<Rc<dyn HttpServer>>,
    pub wifi: Option<Rc<dyn Wifi>>,
}

// ----------------------------------------------------------------------------
// Device
// ----------------------------------------------------------------------------

pub struct Device {
    config: Config,
    components: ComponentManager,
    auth: Option<AuthManager>,
    revocation: Option<AccessRevocationManager>,
    registration: DeviceRegistration,
    privet: Option<Rc<PrivetPublisher>>,
    wifi_bootstrap: Option<WifiBootstrapManager>,
    // Handlers stay alive for the device's lifetime.
    _base_handler: BaseApiHandler,
    _access_handler: Option<AccessApiHandler>,
}

impl Device {
    /// Assemble and start a device. `defaults` seed the settings for a
    /// first boot; persisted settings win afterwards.
    pub fn new(defaults: Settings, cloud_options: CloudOptions, providers: Providers) -> Device {
        let config = Config::new(providers.config_store.clone(), defaults);
        let components =
            ComponentManager::new(providers.task_runner.clone(), providers.clock.clone());

        // Local auth only exists when local clients can actually reach us.
        let (auth, revocation, access_handler) = match &providers.http_server {
            None => (None, None, None),
            Some(http_server) => {
                let revocation = AccessRevocationManager::new(
                    providers.config_store.clone(),
                    providers.task_runner.clone(),
                    providers.clock.clone(),
                );
                let auth = AuthManager::new(
                    config.clone(),
                    Some(revocation.clone()),
                    http_server.https_certificate_fingerprint(),
                    providers.clock.clone(),
                );
                let access_handler = AccessApiHandler::new(
                    components.clone(),
                    revocation.clone(),
                    providers.clock.clone(),
                );
                (Some(auth), Some(revocation), Some(access_handler))
            }
        };

        let registration = DeviceRegistration::new(
            config.clone(),
            components.clone(),
            providers.task_runner.clone(),
            providers.clock.clone(),
            providers.http_client.clone(),
            providers.network.clone(),
            cloud_options,
        );
        let base_handler = BaseApiHandler::new(components.clone(), config.clone());
        registration.start();

        let privet = match (&providers.dns_sd, &providers.http_server) {
            (Some(dns_sd), Some(http_server)) => Some(PrivetPublisher::new(
                dns_sd.clone(),
                config.clone(),
                registration.clone(),
                providers.network.clone(),
                http_server.http_port(),
            )),
            _ => None,
        };

        let wifi_bootstrap = match (&providers.wifi, &providers.network) {
            (Some(wifi), Some(network)) => {
                let bootstrap = WifiBootstrapManager::new(
                    config.clone(),
                    network.clone(),
                    wifi.clone(),
                    providers.task_runner.clone(),
                    providers.clock.clone(),
                );
                if let Some(privet) = &privet {
                    let privet = privet.clone();
                    bootstrap.add_access_point_changed_callback(Rc::new(move |ap_mode| {
                        privet.set_ap_mode(ap_mode);
                    }));
                }
                bootstrap.start();
                Some(bootstrap)
            }
            _ => None,
        };

        Device {
            config,
            components,
            auth,
            revocation,
            registration,
            privet,
            wifi_bootstrap,
            _base_handler: base_handler,
            _access_handler: access_handler,
        }
    }

    // ------------------------------------------------------------------
    // Model
    // ------------------------------------------------------------------

    pub fn add_trait_definitions(&self, dict: &Value) -> Result<()> {
        self.components.load_traits(dict)
    }

    pub fn add_trait_definitions_from_json(&self, json: &str) -> Result<()> {
        self.components.load_traits_from_json(json)
    }

    pub fn traits(&self) -> Map<String, Value> {
        self.components.traits()
    }

    pub fn add_traits_changed_callback(&self, callback: Rc<dyn Fn()>) {
        self.components.add_trait_def_changed_callback(callback);
    }

    pub fn add_component(&self, name: &str, traits: &[&str]) -> Result<()> {
        self.components.add_component("", name, traits)
    }

    pub fn remove_component(&self, name: &str) -> Result<()> {
        self.components.remove_component("", name)
    }

    pub fn components(&self) -> Map<String, Value> {
        self.components.components()
    }

    pub fn add_components_changed_callback(&self, callback: Rc<dyn Fn()>) {
        self.components.add_component_tree_changed_callback(callback);
    }

    /// Direct handle for nested-component and array operations.
    pub fn component_manager(&self) -> &ComponentManager {
        &self.components
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn set_state_properties(&self, component: &str, dict: Map<String, Value>) -> Result<()> {
        self.components.set_state_properties(component, dict)
    }

    pub fn set_state_properties_from_json(&self, component: &str, json: &str) -> Result<()> {
        self.components.set_state_properties_from_json(component, json)
    }

    pub fn set_state_property(&self, component: &str, name: &str, value: Value) -> Result<()> {
        self.components.set_state_property(component, name, value)
    }

    pub fn get_state_property(&self, component: &str, name: &str) -> Result<Value> {
        self.components.get_state_property(component, name)
    }

    pub fn add_state_changed_callback(&self, callback: Rc<dyn Fn()>) {
        self.components.add_state_changed_callback(callback);
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    pub fn add_command_handler(
        &self,
        component: impl Into<String>,
        command_name: impl Into<String>,
        handler: CommandHandler,
    ) {
        self.components
            .add_command_handler(component, command_name, handler);
    }

    /// Submit a local command as the device owner. Returns the command id.
    pub fn add_command(&self, command: &Value) -> Result<String> {
        let command = self
            .components
            .parse_command_instance(command, CommandOrigin::Local, UserRole::Owner)
            .map_err(|parse_error| parse_error.error)?;
        let id = command.id();
        self.components.add_command(command);
        Ok(id)
    }

    pub fn find_command(&self, id: &str) -> Option<Command> {
        self.components.find_command(id)
    }

    // ------------------------------------------------------------------
    // Settings and Cloud
    // ------------------------------------------------------------------

    pub fn settings(&self) -> Settings {
        self.config.settings()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn add_settings_changed_callback(&self, callback: SettingsChangedCallback) {
        self.config.add_on_changed_callback(callback);
    }

    pub fn register(&self, data: RegistrationData, done: crate::cloud::DoneCallback) {
        self.registration.register_device(data, done);
    }

    pub fn gcd_state(&self) -> GcdState {
        self.registration.gcd_state()
    }

    pub fn add_gcd_state_changed_callback(&self, callback: Rc<dyn Fn(GcdState)>) {
        self.registration.add_gcd_state_changed_callback(callback);
    }

    // ------------------------------------------------------------------
    // Local Access
    // ------------------------------------------------------------------

    pub fn auth_manager(&self) -> Option<&AuthManager> {
        self.auth.as_ref()
    }

    pub fn revocation_manager(&self) -> Option<&AccessRevocationManager> {
        self.revocation.as_ref()
    }

    pub fn privet_publisher(&self) -> Option<&Rc<PrivetPublisher>> {
        self.privet.as_ref()
    }

    pub fn wifi_bootstrap(&self) -> Option<&WifiBootstrapManager> {
        self.wifi_bootstrap.as_ref()
    }
}
