//! Command routing and cloud command scenarios

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde_json::json;

use common::{fixture, test_settings, OAUTH_URL, SERVICE_URL};
use weave_core::provider::{ConnectionState, HttpMethod};
use weave_core::{CommandState, ErrorCode};

const LAMP_TRAIT: &str = r#"{
  "onOff": {
    "commands": {
      "setConfig": {
        "minimalRole": "user",
        "parameters": { "state": { "type": "string" } }
      }
    },
    "state": { "state": { "type": "string" } }
  }
}"#;

const TOKEN_RESPONSE: &str = r#"{
  "access_token": "ACCESS_TOKEN",
  "token_type": "Bearer",
  "expires_in": 3599,
  "refresh_token": "REFRESH_TOKEN"
}"#;

#[test]
fn unknown_trait_command_is_unrouted() {
    let fixture = fixture(test_settings(), ConnectionState::Connected);
    let device = &fixture.device;

    device
        .add_trait_definitions_from_json(r#"{"foo": {"commands": {"bar": {"minimalRole": "user"}}}}"#)
        .unwrap();

    let err = device.add_command(&json!({ "name": "foo.bar" })).unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnroutedCommand);
}

#[test]
fn local_command_routes_to_component_handler() {
    let fixture = fixture(test_settings(), ConnectionState::Connected);
    let device = &fixture.device;

    device.add_trait_definitions_from_json(LAMP_TRAIT).unwrap();
    device.add_component("lamp", &["onOff"]).unwrap();

    let handled = Rc::new(RefCell::new(Vec::new()));
    let log = handled.clone();
    device.add_command_handler("lamp", "onOff.setConfig", Rc::new(move |cmd| {
        let command = cmd.upgrade().expect("live during dispatch");
        log.borrow_mut().push(command.parameters()["state"].clone());
        command.set_progress(Default::default()).unwrap();
        command.complete(Default::default()).unwrap();
    }));

    let id = device
        .add_command(&json!({
            "name": "onOff.setConfig",
            "parameters": { "state": "on" }
        }))
        .unwrap();

    assert_eq!(*handled.borrow(), vec![json!("on")]);
    assert_eq!(device.find_command(&id).unwrap().state(), CommandState::Done);

    // Delayed removal frees the command after the grace period.
    fixture.runner.run_for(Duration::from_secs(6));
    assert!(device.find_command(&id).is_none());
}

#[test]
fn cloud_commands_execute_and_report_status() {
    let mut settings = test_settings();
    settings.device_id = "CLOUD_ID".into();
    settings.refresh_token = "REFRESH_TOKEN".into();
    let fixture = fixture(settings, ConnectionState::Connected);
    let device = &fixture.device;

    device.add_trait_definitions_from_json(LAMP_TRAIT).unwrap();
    device.add_component("lamp", &["onOff"]).unwrap();
    device.add_command_handler("lamp", "onOff.setConfig", Rc::new(move |cmd| {
        let command = cmd.upgrade().expect("live during dispatch");
        let results = json!({"accepted": true});
        command
            .complete(results.as_object().unwrap().clone())
            .unwrap();
    }));

    fixture
        .http
        .expect(HttpMethod::Post, OAUTH_URL, 200, TOKEN_RESPONSE);
    fixture.http.expect(
        HttpMethod::Get,
        format!("{SERVICE_URL}commands?deviceId=CLOUD_ID&state=queued"),
        200,
        r#"{"commands": [
            {"id": "cloud-1", "name": "onOff.setConfig", "component": "lamp",
             "parameters": {"state": "on"}}
        ]}"#,
    );
    fixture.http.stub(
        HttpMethod::Get,
        format!("{SERVICE_URL}commands?deviceId=CLOUD_ID"),
        200,
        r#"{"commands": []}"#,
    );
    fixture.http.stub(
        HttpMethod::Post,
        format!("{SERVICE_URL}devices/CLOUD_ID/patchState"),
        200,
        "{}",
    );
    fixture.http.stub(
        HttpMethod::Patch,
        format!("{SERVICE_URL}commands/cloud-1"),
        200,
        "{}",
    );

    fixture.runner.run_for(Duration::from_secs(1));

    // The command ran and its terminal status was pushed back.
    let status_patches: Vec<serde_json::Value> = fixture
        .http
        .requests()
        .iter()
        .filter(|request| request.url.ends_with("commands/cloud-1"))
        .filter_map(|request| request.body.as_deref())
        .map(|body| serde_json::from_str(body).unwrap())
        .collect();
    assert!(!status_patches.is_empty());
    let last = status_patches.last().unwrap();
    assert_eq!(last["state"], "done");
    assert_eq!(last["results"]["accepted"], true);
}

#[test]
fn malformed_cloud_command_is_aborted_remotely() {
    let mut settings = test_settings();
    settings.device_id = "CLOUD_ID".into();
    settings.refresh_token = "REFRESH_TOKEN".into();
    let fixture = fixture(settings, ConnectionState::Connected);

    fixture
        .http
        .expect(HttpMethod::Post, OAUTH_URL, 200, TOKEN_RESPONSE);
    fixture.http.expect(
        HttpMethod::Get,
        format!("{SERVICE_URL}commands?deviceId=CLOUD_ID&state=queued"),
        200,
        r#"{"commands": [
            {"id": "cloud-9", "name": "ghost.run"}
        ]}"#,
    );
    fixture.http.stub(
        HttpMethod::Get,
        format!("{SERVICE_URL}commands?deviceId=CLOUD_ID"),
        200,
        r#"{"commands": []}"#,
    );
    fixture.http.stub(
        HttpMethod::Post,
        format!("{SERVICE_URL}devices/CLOUD_ID/patchState"),
        200,
        "{}",
    );
    fixture.http.stub(
        HttpMethod::Patch,
        format!("{SERVICE_URL}commands/cloud-9"),
        200,
        "{}",
    );

    fixture.runner.run_for(Duration::from_secs(1));

    let abort = fixture
        .http
        .requests()
        .iter()
        .find(|request| request.url.ends_with("commands/cloud-9"))
        .and_then(|request| request.body.as_deref())
        .map(|body| serde_json::from_str::<serde_json::Value>(body).unwrap())
        .expect("abort patch was sent");
    assert_eq!(abort["state"], "aborted");
    assert_eq!(abort["error"]["code"], "invalid_command_name");
}

#[test]
fn server_errors_retry_with_backoff() {
    let mut settings = test_settings();
    settings.device_id = "CLOUD_ID".into();
    settings.refresh_token = "REFRESH_TOKEN".into();
    let fixture = fixture(settings, ConnectionState::Connected);

    fixture
        .http
        .expect(HttpMethod::Post, OAUTH_URL, 200, TOKEN_RESPONSE);
    fixture.http.expect(
        HttpMethod::Get,
        format!("{SERVICE_URL}commands?deviceId=CLOUD_ID&state=queued"),
        503,
        r#"{"error": "backend unavailable"}"#,
    );
    fixture.http.stub(
        HttpMethod::Get,
        format!("{SERVICE_URL}commands?deviceId=CLOUD_ID"),
        200,
        r#"{"commands": []}"#,
    );
    fixture.http.stub(
        HttpMethod::Post,
        format!("{SERVICE_URL}devices/CLOUD_ID/patchState"),
        200,
        "{}",
    );

    fixture.runner.run_for(Duration::from_secs(2));

    let polls = fixture
        .http
        .requests()
        .iter()
        .filter(|request| request.method == "GET")
        .count();
    // First attempt hit the 503; the jittered retry (under 1 s) succeeded.
    assert!(polls >= 2, "expected a retry after the 503, saw {polls} polls");
}

#[test]
fn expired_token_is_refreshed_once_on_401() {
    let mut settings = test_settings();
    settings.device_id = "CLOUD_ID".into();
    settings.refresh_token = "REFRESH_TOKEN".into();
    let fixture = fixture(settings, ConnectionState::Connected);

    fixture
        .http
        .expect(HttpMethod::Post, OAUTH_URL, 200, TOKEN_RESPONSE);
    fixture.http.expect(
        HttpMethod::Get,
        format!("{SERVICE_URL}commands?deviceId=CLOUD_ID&state=queued"),
        401,
        r#"{"error": "unauthorized"}"#,
    );
    fixture
        .http
        .expect(HttpMethod::Post, OAUTH_URL, 200, TOKEN_RESPONSE);
    fixture.http.stub(
        HttpMethod::Get,
        format!("{SERVICE_URL}commands?deviceId=CLOUD_ID"),
        200,
        r#"{"commands": []}"#,
    );
    fixture.http.stub(
        HttpMethod::Post,
        format!("{SERVICE_URL}devices/CLOUD_ID/patchState"),
        200,
        "{}",
    );

    fixture.runner.run_for(Duration::from_secs(2));

    assert_eq!(fixture.http.remaining_expectations(), 0);
    let refreshes = fixture
        .http
        .requests()
        .iter()
        .filter(|request| request.url == OAUTH_URL)
        .count();
    assert_eq!(refreshes, 2);
}
