//! Base API handler scenarios

mod common;

use serde_json::json;

use common::{fixture, test_settings};
use weave_core::provider::ConnectionState;
use weave_core::{AuthScope, CommandState};

#[test]
fn update_base_configuration_updates_settings_and_state() {
    let fixture = fixture(test_settings(), ConnectionState::Connected);
    let device = &fixture.device;

    let id = device
        .add_command(&json!({
            "name": "base.updateBaseConfiguration",
            "parameters": {
                "localDiscoveryEnabled": false,
                "localAnonymousAccessMaxRole": "none",
                "localPairingEnabled": false
            }
        }))
        .unwrap();
    assert_eq!(device.find_command(&id).unwrap().state(), CommandState::Done);

    let settings = device.settings();
    assert_eq!(settings.local_anonymous_access_role, AuthScope::None);
    assert!(!settings.local_discovery_enabled);
    assert!(!settings.local_pairing_enabled);

    assert_eq!(
        device
            .get_state_property("base", "base.localAnonymousAccessMaxRole")
            .unwrap(),
        json!("none")
    );
    assert_eq!(
        device
            .get_state_property("base", "base.localDiscoveryEnabled")
            .unwrap(),
        json!(false)
    );
    assert_eq!(
        device
            .get_state_property("base", "base.localPairingEnabled")
            .unwrap(),
        json!(false)
    );
    assert_eq!(
        device
            .get_state_property("base", "base.firmwareVersion")
            .unwrap(),
        json!("TEST_FIRMWARE")
    );
}

#[test]
fn follow_up_transaction_updates_state_without_a_command() {
    let fixture = fixture(test_settings(), ConnectionState::Connected);
    let device = &fixture.device;

    device
        .add_command(&json!({
            "name": "base.updateBaseConfiguration",
            "parameters": {
                "localDiscoveryEnabled": true,
                "localAnonymousAccessMaxRole": "user",
                "localPairingEnabled": true
            }
        }))
        .unwrap();
    assert_eq!(
        device
            .get_state_property("base", "base.localAnonymousAccessMaxRole")
            .unwrap(),
        json!("user")
    );

    let mut change = device.config().transaction();
    change.set_local_anonymous_access_role(AuthScope::Viewer);
    change.commit();

    assert_eq!(
        device.settings().local_anonymous_access_role,
        AuthScope::Viewer
    );
    assert_eq!(
        device
            .get_state_property("base", "base.localAnonymousAccessMaxRole")
            .unwrap(),
        json!("viewer")
    );
}

#[test]
fn update_device_info_applies_present_fields_only() {
    let fixture = fixture(test_settings(), ConnectionState::Connected);
    let device = &fixture.device;

    device
        .add_command(&json!({
            "name": "base.updateDeviceInfo",
            "parameters": {
                "name": "testName",
                "description": "testDescription",
                "location": "testLocation"
            }
        }))
        .unwrap();

    let settings = device.settings();
    assert_eq!(settings.name, "testName");
    assert_eq!(settings.description, "testDescription");
    assert_eq!(settings.location, "testLocation");

    device
        .add_command(&json!({
            "name": "base.updateDeviceInfo",
            "parameters": { "location": "newLocation" }
        }))
        .unwrap();

    let settings = device.settings();
    assert_eq!(settings.name, "testName");
    assert_eq!(settings.description, "testDescription");
    assert_eq!(settings.location, "newLocation");
}

#[test]
fn invalid_parameter_aborts_without_touching_settings() {
    let fixture = fixture(test_settings(), ConnectionState::Connected);
    let device = &fixture.device;

    let id = device
        .add_command(&json!({
            "name": "base.updateBaseConfiguration",
            "parameters": {
                "localDiscoveryEnabled": "not-a-bool",
                "localPairingEnabled": false
            }
        }))
        .unwrap();

    assert_eq!(
        device.find_command(&id).unwrap().state(),
        CommandState::Aborted
    );
    let settings = device.settings();
    assert!(settings.local_discovery_enabled);
    assert!(settings.local_pairing_enabled);
}
