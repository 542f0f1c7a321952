//! Settings storage with transactional mutation
//!
//! Settings are mutated only through a [`Transaction`]: setters act on a
//! clone, and commit atomically swaps it in, persists the serialized blob,
//! and runs change callbacks with the new snapshot. A transaction dropped
//! without an explicit commit commits implicitly.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{error, warn};

use crate::provider::ConfigStore;
use crate::settings::Settings;
use crate::types::{AuthScope, RootClientTokenOwner};

/// Name of the settings blob in the config store.
pub const SETTINGS_NAME: &str = "settings";

pub type SettingsChangedCallback = Rc<dyn Fn(&Settings)>;

// ----------------------------------------------------------------------------
// Config
// ----------------------------------------------------------------------------

struct Inner {
    store: Rc<dyn ConfigStore>,
    settings: Settings,
    on_changed: Vec<SettingsChangedCallback>,
}

#[derive(Clone)]
pub struct Config {
    inner: Rc<RefCell<Inner>>,
}

impl Config {
    /// Load stored settings over `defaults`; fields absent from the blob
    /// keep the default value.
    pub fn new(store: Rc<dyn ConfigStore>, defaults: Settings) -> Self {
        let settings = match store.load_settings(SETTINGS_NAME) {
            None => defaults,
            Some(blob) => merge_blob(defaults, &blob),
        };
        Self {
            inner: Rc::new(RefCell::new(Inner {
                store,
                settings,
                on_changed: Vec::new(),
            })),
        }
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> Settings {
        self.inner.borrow().settings.clone()
    }

    /// The callback runs immediately with the current settings and again
    /// after every committed transaction.
    pub fn add_on_changed_callback(&self, callback: SettingsChangedCallback) {
        self.inner.borrow_mut().on_changed.push(callback.clone());
        let snapshot = self.settings();
        callback(&snapshot);
    }

    pub fn transaction(&self) -> Transaction {
        Transaction {
            config: self.clone(),
            settings: self.settings(),
            committed: false,
        }
    }

    fn commit(&self, settings: Settings) {
        let (callbacks, committed) = {
            let mut inner = self.inner.borrow_mut();
            if inner.settings == settings {
                return;
            }
            let blob = match serde_json::to_string(&settings) {
                Ok(blob) => blob,
                Err(err) => {
                    error!(%err, "failed to serialize settings; transaction discarded");
                    return;
                }
            };
            if let Err(err) = inner.store.save_settings(SETTINGS_NAME, &blob) {
                error!(%err, "failed to persist settings; transaction discarded");
                return;
            }
            inner.settings = settings.clone();
            (inner.on_changed.clone(), settings)
        };
        for callback in callbacks {
            callback(&committed);
        }
    }
}

fn merge_blob(defaults: Settings, blob: &str) -> Settings {
    // Layer the stored fields over the serialized defaults so unknown or
    // missing keys fall back cleanly.
    let mut base = match serde_json::to_value(&defaults) {
        Ok(serde_json::Value::Object(base)) => base,
        _ => return defaults,
    };
    match serde_json::from_str::<serde_json::Value>(blob) {
        Ok(serde_json::Value::Object(stored)) => {
            for (key, value) in stored {
                base.insert(key, value);
            }
        }
        Ok(_) | Err(_) => {
            warn!("stored settings blob is malformed; using defaults");
            return defaults;
        }
    }
    serde_json::from_value(serde_json::Value::Object(base)).unwrap_or(defaults)
}

// ----------------------------------------------------------------------------
// Transaction
// ----------------------------------------------------------------------------

/// Pending settings mutation. Setters touch only the captured clone;
/// nothing is observable until commit.
pub struct Transaction {
    config: Config,
    settings: Settings,
    committed: bool,
}

impl Transaction {
    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.settings.name = name.into();
        self
    }

    pub fn set_description(&mut self, description: impl Into<String>) -> &mut Self {
        self.settings.description = description.into();
        self
    }

    pub fn set_location(&mut self, location: impl Into<String>) -> &mut Self {
        self.settings.location = location.into();
        self
    }

    pub fn set_local_anonymous_access_role(&mut self, role: AuthScope) -> &mut Self {
        self.settings.local_anonymous_access_role = role;
        self
    }

    pub fn set_local_discovery_enabled(&mut self, enabled: bool) -> &mut Self {
        self.settings.local_discovery_enabled = enabled;
        self
    }

    pub fn set_local_pairing_enabled(&mut self, enabled: bool) -> &mut Self {
        self.settings.local_pairing_enabled = enabled;
        self
    }

    pub fn set_secret(&mut self, secret: Vec<u8>) -> &mut Self {
        self.settings.secret = secret;
        self
    }

    pub fn set_root_client_token_owner(&mut self, owner: RootClientTokenOwner) -> &mut Self {
        self.settings.root_client_token_owner = owner;
        self
    }

    pub fn set_last_configured_ssid(&mut self, ssid: impl Into<String>) -> &mut Self {
        self.settings.last_configured_ssid = ssid.into();
        self
    }

    pub fn set_device_id(&mut self, device_id: impl Into<String>) -> &mut Self {
        self.settings.device_id = device_id.into();
        self
    }

    pub fn set_refresh_token(&mut self, token: impl Into<String>) -> &mut Self {
        self.settings.refresh_token = token.into();
        self
    }

    pub fn set_robot_account(&mut self, account: impl Into<String>) -> &mut Self {
        self.settings.robot_account = account.into();
        self
    }

    /// Swap the mutated settings in, persist them, and notify observers.
    pub fn commit(mut self) {
        self.committed = true;
        self.config.commit(self.settings.clone());
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.committed {
            self.config.commit(self.settings.clone());
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
