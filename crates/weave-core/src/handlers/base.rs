//! Built-in `base` trait
//!
//! Translates `base.updateBaseConfiguration` and `base.updateDeviceInfo`
//! into config transactions and mirrors the resulting settings into the
//! `base` component's state, so local and cloud clients see one source of
//! truth.

use std::rc::Rc;

use serde_json::{json, Map};
use tracing::warn;

use crate::command::{Command, WeakCommand};
use crate::component::ComponentManager;
use crate::config::Config;
use crate::error::{domains, Error, ErrorCode};
use crate::types::AuthScope;

const COMPONENT: &str = "base";
const TRAIT: &str = "base";

const BASE_TRAIT_JSON: &str = r#"{
  "base": {
    "commands": {
      "updateBaseConfiguration": {
        "minimalRole": "manager",
        "parameters": {
          "localAnonymousAccessMaxRole": {
            "enum": [ "none", "viewer", "user" ],
            "type": "string"
          },
          "localDiscoveryEnabled": {
            "type": "boolean"
          },
          "localPairingEnabled": {
            "type": "boolean"
          }
        }
      },
      "updateDeviceInfo": {
        "minimalRole": "manager",
        "parameters": {
          "description": {
            "type": "string"
          },
          "location": {
            "type": "string"
          },
          "name": {
            "type": "string"
          }
        }
      }
    },
    "state": {
      "firmwareVersion": { "type": "string", "isRequired": true },
      "localDiscoveryEnabled": { "type": "boolean", "isRequired": true },
      "localAnonymousAccessMaxRole": { "type": "string", "isRequired": true },
      "localPairingEnabled": { "type": "boolean", "isRequired": true }
    }
  }
}"#;

// ----------------------------------------------------------------------------
// Handler
// ----------------------------------------------------------------------------

pub struct BaseApiHandler {
    _components: ComponentManager,
    _config: Config,
}

impl BaseApiHandler {
    pub fn new(components: ComponentManager, config: Config) -> Self {
        components
            .load_traits_from_json(BASE_TRAIT_JSON)
            .expect("base trait definition is well formed");
        components
            .add_component("", COMPONENT, &[TRAIT])
            .expect("base component registered once");

        // Settings are the source of truth; any committed change (command
        // or direct transaction) refreshes the mirrored state.
        {
            let components = components.clone();
            config.add_on_changed_callback(Rc::new(move |settings| {
                let state = json!({
                    TRAIT: {
                        "firmwareVersion": settings.firmware_version,
                        "localDiscoveryEnabled": settings.local_discovery_enabled,
                        "localAnonymousAccessMaxRole": settings.local_anonymous_access_role.as_str(),
                        "localPairingEnabled": settings.local_pairing_enabled,
                    }
                });
                let state = state.as_object().expect("literal object").clone();
                if let Err(err) = components.set_state_properties(COMPONENT, state) {
                    warn!(%err, "failed to mirror settings into base state");
                }
            }));
        }

        {
            let config = config.clone();
            components.add_command_handler(
                COMPONENT,
                "base.updateBaseConfiguration",
                Rc::new(move |cmd| update_base_configuration(&config, cmd)),
            );
        }
        {
            let config = config.clone();
            components.add_command_handler(
                COMPONENT,
                "base.updateDeviceInfo",
                Rc::new(move |cmd| update_device_info(&config, cmd)),
            );
        }

        Self {
            _components: components,
            _config: config,
        }
    }
}

// ----------------------------------------------------------------------------
// Command Handlers
// ----------------------------------------------------------------------------

fn update_base_configuration(config: &Config, cmd: WeakCommand) {
    let Some(command) = cmd.upgrade() else {
        return;
    };
    let parameters = command.parameters();

    // Validate everything before opening the transaction: a dropped
    // transaction commits.
    let discovery = match optional_bool(&parameters, "localDiscoveryEnabled") {
        Ok(value) => value,
        Err(name) => return abort_bad_param(&command, name),
    };
    let pairing = match optional_bool(&parameters, "localPairingEnabled") {
        Ok(value) => value,
        Err(name) => return abort_bad_param(&command, name),
    };
    let role = match parameters.get("localAnonymousAccessMaxRole") {
        None => None,
        Some(value) => match value.as_str().and_then(|role| AuthScope::from_str(role).ok()) {
            Some(role) => Some(role),
            None => return abort_bad_param(&command, "localAnonymousAccessMaxRole"),
        },
    };

    let mut change = config.transaction();
    if let Some(enabled) = discovery {
        change.set_local_discovery_enabled(enabled);
    }
    if let Some(role) = role {
        change.set_local_anonymous_access_role(role);
    }
    if let Some(enabled) = pairing {
        change.set_local_pairing_enabled(enabled);
    }
    change.commit();

    let _ = command.complete(Map::new());
}

fn update_device_info(config: &Config, cmd: WeakCommand) {
    let Some(command) = cmd.upgrade() else {
        return;
    };
    let parameters = command.parameters();

    let mut fields = Vec::new();
    for name in ["name", "description", "location"] {
        match parameters.get(name) {
            None => {}
            Some(value) => match value.as_str() {
                Some(value) => fields.push((name, value.to_string())),
                None => return abort_bad_param(&command, name),
            },
        }
    }

    let mut change = config.transaction();
    for (name, value) in fields {
        match name {
            "name" => change.set_name(value),
            "description" => change.set_description(value),
            _ => change.set_location(value),
        };
    }
    change.commit();

    let _ = command.complete(Map::new());
}

fn optional_bool(
    parameters: &Map<String, serde_json::Value>,
    name: &'static str,
) -> std::result::Result<Option<bool>, &'static str> {
    match parameters.get(name) {
        None => Ok(None),
        Some(value) => value.as_bool().map(Some).ok_or(name),
    }
}

fn abort_bad_param(command: &Command, name: &str) {
    let _ = command.abort(Some(Error::new(
        domains::COMMANDS,
        ErrorCode::InvalidPropValue,
        format!("Invalid value for parameter '{name}'"),
    )));
}
