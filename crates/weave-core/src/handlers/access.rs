//! Built-in `_accessRevocationList` trait
//!
//! Exposes the revocation manager to owners: `revoke` inserts an entry,
//! `list` dumps the live entries, and the `capacity` state property
//! advertises the list bound.

use std::rc::Rc;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::command::{Command, CommandState, WeakCommand};
use crate::component::ComponentManager;
use crate::error::{domains, Error, ErrorCode};
use crate::provider::Clock;
use crate::revocation::{AccessRevocationManager, RevocationEntry};
use crate::types::Timestamp;

const COMPONENT: &str = "accessControl";
const TRAIT: &str = "_accessRevocationList";

const ACCESS_TRAIT_JSON: &str = r#"{
  "_accessRevocationList": {
    "commands": {
      "revoke": {
        "minimalRole": "owner",
        "parameters": {
          "userId": {
            "type": "string"
          },
          "applicationId": {
            "type": "string"
          },
          "expirationTime": {
            "type": "integer"
          }
        }
      },
      "list": {
        "minimalRole": "owner",
        "parameters": {},
        "results": {
          "revocationListEntries": {
            "type": "array",
            "items": {
              "type": "object",
              "properties": {
                "userId": {
                  "type": "string"
                },
                "applicationId": {
                  "type": "string"
                },
                "expirationTime": {
                  "type": "integer"
                }
              },
              "additionalProperties": false
            }
          }
        }
      }
    },
    "state": {
      "capacity": {
        "type": "integer",
        "isRequired": true
      }
    }
  }
}"#;

// ----------------------------------------------------------------------------
// Handler
// ----------------------------------------------------------------------------

pub struct AccessApiHandler {
    _components: ComponentManager,
    _revocation: AccessRevocationManager,
}

impl AccessApiHandler {
    pub fn new(
        components: ComponentManager,
        revocation: AccessRevocationManager,
        clock: Rc<dyn Clock>,
    ) -> Self {
        components
            .load_traits_from_json(ACCESS_TRAIT_JSON)
            .expect("access trait definition is well formed");
        components
            .add_component("", COMPONENT, &[TRAIT])
            .expect("access component registered once");
        update_state(&components, &revocation);

        {
            let components = components.clone();
            let revocation = revocation.clone();
            let clock = clock.clone();
            let handler_components = components.clone();
            components.add_command_handler(
                COMPONENT,
                "_accessRevocationList.revoke",
                Rc::new(move |cmd| {
                    revoke(&handler_components, &revocation, clock.clone(), cmd)
                }),
            );
        }
        {
            let revocation = revocation.clone();
            components.add_command_handler(
                COMPONENT,
                "_accessRevocationList.list",
                Rc::new(move |cmd| list(&revocation, cmd)),
            );
        }

        Self {
            _components: components,
            _revocation: revocation,
        }
    }
}

fn update_state(components: &ComponentManager, revocation: &AccessRevocationManager) {
    let state = json!({ TRAIT: { "capacity": revocation.capacity() } });
    let state = state.as_object().expect("literal object").clone();
    if let Err(err) = components.set_state_properties(COMPONENT, state) {
        warn!(%err, "failed to update access control state");
    }
}

// ----------------------------------------------------------------------------
// Command Handlers
// ----------------------------------------------------------------------------

fn revoke(
    components: &ComponentManager,
    revocation: &AccessRevocationManager,
    clock: Rc<dyn Clock>,
    cmd: WeakCommand,
) {
    let Some(command) = cmd.upgrade() else {
        return;
    };
    assert_eq!(command.state(), CommandState::Queued, "revoke dispatched twice");
    let _ = command.set_progress(Map::new());

    let parameters = command.parameters();
    let (user_id, app_id) = match decode_ids(&parameters) {
        Ok(ids) => ids,
        Err(err) => {
            let _ = command.abort(Some(err));
            return;
        }
    };
    let Some(expiration) = parameters.get("expirationTime").and_then(Value::as_u64) else {
        let _ = command.abort(Some(Error::new(
            domains::COMMANDS,
            ErrorCode::InvalidPropValue,
            "Expiration time is missing",
        )));
        return;
    };

    let entry = RevocationEntry {
        user_id,
        app_id,
        issued_before: clock.now(),
        expiration: Timestamp::from_secs(expiration),
    };
    let components = components.clone();
    let done_revocation = revocation.clone();
    revocation.block(
        entry,
        Box::new(move |result| {
            update_state(&components, &done_revocation);
            let Some(command) = cmd.upgrade() else {
                return;
            };
            match result {
                Ok(()) => {
                    let _ = command.complete(Map::new());
                }
                Err(err) => {
                    let _ = command.abort(Some(err));
                }
            }
        }),
    );
}

fn list(revocation: &AccessRevocationManager, cmd: WeakCommand) {
    let Some(command) = cmd.upgrade() else {
        return;
    };
    assert_eq!(command.state(), CommandState::Queued, "list dispatched twice");
    let _ = command.set_progress(Map::new());

    let entries: Vec<Value> = revocation
        .entries()
        .iter()
        .map(|entry| {
            json!({
                "userId": BASE64_STANDARD.encode(&entry.user_id),
                "applicationId": BASE64_STANDARD.encode(&entry.app_id),
                "expirationTime": entry.expiration.as_secs(),
            })
        })
        .collect();

    let results = json!({ "revocationListEntries": entries });
    let _ = command.complete(results.as_object().expect("literal object").clone());
}

fn decode_ids(parameters: &Map<String, Value>) -> crate::error::Result<(Vec<u8>, Vec<u8>)> {
    let user_id = parameters
        .get("userId")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let user_id = BASE64_STANDARD.decode(user_id.as_bytes()).map_err(|_| {
        Error::new(
            domains::COMMANDS,
            ErrorCode::InvalidPropValue,
            format!("Invalid user id '{user_id}'"),
        )
    })?;

    let app_id = parameters
        .get("applicationId")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let app_id = BASE64_STANDARD.decode(app_id.as_bytes()).map_err(|_| {
        Error::new(
            domains::COMMANDS,
            ErrorCode::InvalidPropValue,
            format!("Invalid app id '{app_id}'"),
        )
    })?;

    Ok((user_id, app_id))
}
