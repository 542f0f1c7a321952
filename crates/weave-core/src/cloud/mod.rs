//! Device registration and cloud synchronization
//!
//! Owns the device's relationship with the cloud registry: the ticket
//! registration exchange, the OAuth token cache, and the sync loop that
//! polls for commands, flushes state deltas, and pushes command status.
//! The three sync channels are independent and single-flight; every cloud
//! failure is retried on a full-jitter backoff ladder.

pub mod backoff;
pub mod notification;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::command::{CommandEvent, CommandOrigin, CommandState};
use crate::component::{ComponentManager, ComponentStateChange};
use crate::config::Config;
use crate::error::{domains, Error, ErrorCode, Result};
use crate::provider::{
    Clock, ConnectionState, HttpClient, HttpMethod, HttpRequest, HttpResponse, Network, TaskRunner,
};
use crate::types::{GcdState, RegistrationData, UserRole};

use backoff::Backoff;
use notification::{NotificationChannel, NotificationDelegate, PullChannel, PushChannel};

/// Access tokens are considered expired this long before their real
/// deadline, so an in-flight request never races the expiry.
const TOKEN_EXPIRATION_MARGIN: Duration = Duration::from_secs(60);

pub type DoneCallback = Box<dyn FnOnce(Result<String>)>;

// ----------------------------------------------------------------------------
// Options
// ----------------------------------------------------------------------------

/// Embedder knobs for the cloud connection.
#[derive(Debug, Clone)]
pub struct CloudOptions {
    /// Keep a persistent notification socket instead of polling.
    pub push_notifications_enabled: bool,
    pub notification_host: String,
    pub notification_port: u16,
}

impl Default for CloudOptions {
    fn default() -> Self {
        Self {
            push_notifications_enabled: false,
            notification_host: String::new(),
            notification_port: 5223,
        }
    }
}

// ----------------------------------------------------------------------------
// Device Registration
// ----------------------------------------------------------------------------

struct Inner {
    config: Config,
    components: ComponentManager,
    runner: Rc<dyn TaskRunner>,
    clock: Rc<dyn Clock>,
    http: Rc<dyn HttpClient>,
    network: Option<Rc<dyn Network>>,
    options: CloudOptions,

    gcd_state: GcdState,
    on_gcd_changed: Vec<Rc<dyn Fn(GcdState)>>,

    access_token: String,
    access_token_expiration: crate::types::Timestamp,
    refresh_in_flight: bool,
    token_waiters: Vec<Box<dyn FnOnce(Result<String>)>>,

    command_poll_in_flight: bool,
    poll_backoff: Backoff,
    state_flush_in_flight: bool,
    flush_backoff: Backoff,
    pending_state: Vec<ComponentStateChange>,
    pending_update_id: u64,
    status_push_in_flight: bool,
    push_backoff: Backoff,
    pending_status_updates: VecDeque<(String, Value)>,

    channel: Option<Box<dyn NotificationChannel>>,
    sync_started: bool,
}

#[derive(Clone)]
pub struct DeviceRegistration {
    inner: Rc<RefCell<Inner>>,
}

impl DeviceRegistration {
    pub fn new(
        config: Config,
        components: ComponentManager,
        runner: Rc<dyn TaskRunner>,
        clock: Rc<dyn Clock>,
        http: Rc<dyn HttpClient>,
        network: Option<Rc<dyn Network>>,
        options: CloudOptions,
    ) -> Self {
        let settings = config.settings();
        let gcd_state = if !settings.is_cloud_configured() {
            GcdState::Unconfigured
        } else if !settings.is_registered() {
            GcdState::Unregistered
        } else {
            GcdState::Connecting
        };
        Self {
            inner: Rc::new(RefCell::new(Inner {
                config,
                components,
                runner,
                clock,
                http,
                network,
                options,
                gcd_state,
                on_gcd_changed: Vec::new(),
                access_token: String::new(),
                access_token_expiration: Default::default(),
                refresh_in_flight: false,
                token_waiters: Vec::new(),
                command_poll_in_flight: false,
                poll_backoff: Backoff::new(),
                state_flush_in_flight: false,
                flush_backoff: Backoff::new(),
                pending_state: Vec::new(),
                pending_update_id: 0,
                status_push_in_flight: false,
                push_backoff: Backoff::new(),
                pending_status_updates: VecDeque::new(),
                channel: None,
                sync_started: false,
            })),
        }
    }

    /// Wire up callbacks and, for an already registered device, begin
    /// connecting.
    pub fn start(&self) {
        let (network, registered) = {
            let inner = self.inner.borrow();
            (inner.network.clone(), inner.config.settings().is_registered())
        };

        if let Some(network) = network {
            let this = self.clone();
            network.add_connection_changed_callback(Rc::new(move || {
                this.on_connectivity_changed();
            }));
        }

        {
            let this = self.clone();
            let components = self.inner.borrow().components.clone();
            components.add_state_changed_callback(Rc::new(move || {
                this.schedule_state_flush();
            }));
            let this = self.clone();
            components.add_command_added_callback(Rc::new(move |command| {
                if command.origin() == CommandOrigin::Cloud {
                    this.watch_cloud_command(command);
                }
            }));
        }

        if registered {
            self.connect();
        }
    }

    pub fn gcd_state(&self) -> GcdState {
        self.inner.borrow().gcd_state
    }

    pub fn add_gcd_state_changed_callback(&self, callback: Rc<dyn Fn(GcdState)>) {
        self.inner.borrow_mut().on_gcd_changed.push(callback.clone());
        callback(self.gcd_state());
    }

    fn set_gcd_state(&self, state: GcdState) {
        let callbacks = {
            let mut inner = self.inner.borrow_mut();
            if inner.gcd_state == state {
                return;
            }
            debug!(from = inner.gcd_state.as_str(), to = state.as_str(), "gcd state");
            inner.gcd_state = state;
            inner.on_gcd_changed.clone()
        };
        for callback in callbacks {
            callback(state);
        }
    }

    fn online(&self) -> bool {
        self.inner
            .borrow()
            .network
            .as_ref()
            .map(|network| network.connection_state() == ConnectionState::Connected)
            .unwrap_or(true)
    }

    fn on_connectivity_changed(&self) {
        let registered = self.inner.borrow().config.settings().is_registered();
        if !registered {
            return;
        }
        if self.online() {
            info!("network online; resuming cloud sync");
            {
                let mut inner = self.inner.borrow_mut();
                inner.poll_backoff.reset();
                inner.flush_backoff.reset();
                inner.push_backoff.reset();
            }
            self.connect();
        } else if self.gcd_state() == GcdState::Connected {
            self.set_gcd_state(GcdState::Disconnected);
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Run the registration ticket exchange. On success the device holds a
    /// robot account refresh token and its cloud id, and the sync loop is
    /// live. The callback receives the cloud device id.
    pub fn register_device(&self, data: RegistrationData, done: DoneCallback) {
        let settings = self.inner.borrow().config.settings();
        let service_url = data.service_url.clone().unwrap_or(settings.service_url);
        let api_key = data.api_key.clone().unwrap_or(settings.api_key);
        let client_id = data.client_id.clone().unwrap_or(settings.client_id);
        let client_secret = data.client_secret.clone().unwrap_or(settings.client_secret);
        let oauth_url = data.oauth_url.clone().unwrap_or(settings.oauth_url);
        let ticket_id = data.ticket_id;

        if service_url.is_empty() || api_key.is_empty() || client_id.is_empty() {
            done(Err(Error::invalid_state(
                domains::CLOUD,
                "Cloud registration is not configured",
            )));
            return;
        }

        self.set_gcd_state(GcdState::Connecting);

        let draft = self.build_device_resource();
        let ticket_url = format!(
            "{}registrationTickets/{}?key={}",
            with_trailing_slash(&service_url),
            ticket_id,
            api_key
        );
        let body = json!({
            "deviceDraft": draft,
            "oauthClientId": client_id.clone(),
        });

        let this = self.clone();
        let request = HttpRequest::new(HttpMethod::Patch, &ticket_url).with_json(&body);
        self.send(request, Box::new(move |result| {
            match this.expect_json(result) {
                Err(err) => this.fail_registration(done, err),
                Ok(_ticket) => {
                    let finalize_url = format!(
                        "{}registrationTickets/{}/finalize?key={}",
                        with_trailing_slash(&service_url),
                        ticket_id,
                        api_key
                    );
                    let again = this.clone();
                    let request = HttpRequest::new(HttpMethod::Post, &finalize_url);
                    this.send(request, Box::new(move |result| {
                        match again.expect_json(result) {
                            Err(err) => again.fail_registration(done, err),
                            Ok(ticket) => again.finish_registration(
                                ticket,
                                oauth_url,
                                client_id,
                                client_secret,
                                done,
                            ),
                        }
                    }));
                }
            }
        }));
    }

    fn finish_registration(
        &self,
        ticket: Value,
        oauth_url: String,
        client_id: String,
        client_secret: String,
        done: DoneCallback,
    ) {
        let device_id = ticket
            .get("deviceId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let robot_account = ticket
            .get("robotAccountEmail")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let auth_code = ticket
            .get("robotAccountAuthorizationCode")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if device_id.is_empty() || auth_code.is_empty() {
            self.fail_registration(
                done,
                Error::object_expected("Finalize response is missing the robot account"),
            );
            return;
        }

        let request = HttpRequest::new(HttpMethod::Post, &oauth_url).with_form(&[
            ("code", auth_code.as_str()),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("redirect_uri", "oob"),
            ("grant_type", "authorization_code"),
        ]);
        let this = self.clone();
        self.send(request, Box::new(move |result| {
            let tokens = match this.expect_json(result) {
                Err(err) => return this.fail_registration(done, err),
                Ok(tokens) => tokens,
            };
            let refresh_token = tokens
                .get("refresh_token")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if refresh_token.is_empty() {
                return this.fail_registration(
                    done,
                    Error::object_expected("Token response is missing refresh_token"),
                );
            }
            this.cache_access_token(&tokens);

            {
                let config = this.inner.borrow().config.clone();
                let mut change = config.transaction();
                change.set_device_id(device_id.clone());
                change.set_refresh_token(refresh_token.clone());
                change.set_robot_account(robot_account.clone());
                change.commit();
            }
            info!(device_id = %device_id, "device registered");
            this.set_gcd_state(GcdState::Connected);
            this.start_sync();
            done(Ok(device_id));
        }));
    }

    fn fail_registration(&self, done: DoneCallback, error: Error) {
        warn!(%error, "registration failed");
        let registered = self.inner.borrow().config.settings().is_registered();
        self.set_gcd_state(if registered {
            GcdState::Connected
        } else {
            GcdState::Unregistered
        });
        done(Err(error));
    }

    /// The self-describing resource sent as the registration draft.
    fn build_device_resource(&self) -> Value {
        let inner = self.inner.borrow();
        let settings = inner.config.settings();
        let mut draft = Map::new();
        draft.insert("name".into(), settings.name.clone().into());
        if !settings.description.is_empty() {
            draft.insert("description".into(), settings.description.clone().into());
        }
        if !settings.location.is_empty() {
            draft.insert("location".into(), settings.location.clone().into());
        }
        draft.insert("modelManifestId".into(), settings.model_id.clone().into());
        let supported_type = if inner.options.push_notifications_enabled {
            "xmpp"
        } else {
            "pull"
        };
        draft.insert("channel".into(), json!({ "supportedType": supported_type }));
        draft.insert("traits".into(), Value::Object(inner.components.traits()));
        draft.insert(
            "components".into(),
            Value::Object(inner.components.get_components_for_user_role(UserRole::Owner)),
        );
        Value::Object(draft)
    }

    // ------------------------------------------------------------------
    // Connection and Token Cache
    // ------------------------------------------------------------------

    fn connect(&self) {
        if !self.online() {
            self.set_gcd_state(GcdState::Disconnected);
            return;
        }
        self.set_gcd_state(GcdState::Connecting);
        let this = self.clone();
        self.ensure_access_token(Box::new(move |result| match result {
            Ok(_) => {
                this.set_gcd_state(GcdState::Connected);
                this.start_sync();
            }
            Err(err) => {
                if err.code() != ErrorCode::InvalidCredentials {
                    this.set_gcd_state(GcdState::Disconnected);
                }
                warn!(%err, "cloud connect failed");
            }
        }));
    }

    fn ensure_access_token(&self, done: Box<dyn FnOnce(Result<String>)>) {
        let cached = {
            let inner = self.inner.borrow();
            let now = inner.clock.now();
            (!inner.access_token.is_empty() && inner.access_token_expiration > now)
                .then(|| inner.access_token.clone())
        };
        if let Some(token) = cached {
            done(Ok(token));
            return;
        }
        let start_refresh = {
            let mut inner = self.inner.borrow_mut();
            inner.token_waiters.push(done);
            if inner.refresh_in_flight {
                false
            } else {
                inner.refresh_in_flight = true;
                true
            }
        };
        if start_refresh {
            self.refresh_access_token();
        }
    }

    fn refresh_access_token(&self) {
        let settings = self.inner.borrow().config.settings();
        if settings.refresh_token.is_empty() {
            self.on_invalid_credentials();
            return;
        }
        let request = HttpRequest::new(HttpMethod::Post, &settings.oauth_url).with_form(&[
            ("refresh_token", settings.refresh_token.as_str()),
            ("client_id", settings.client_id.as_str()),
            ("client_secret", settings.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ]);
        let this = self.clone();
        self.send(request, Box::new(move |result| match result {
            Err(err) => this.finish_refresh(Err(err)),
            Ok(response) => {
                if response.is_success() {
                    match response.json() {
                        Ok(tokens) => {
                            let token = this.cache_access_token(&tokens);
                            this.finish_refresh(Ok(token));
                        }
                        Err(err) => this.finish_refresh(Err(err)),
                    }
                } else if is_invalid_grant(&response) {
                    this.on_invalid_credentials();
                } else {
                    this.finish_refresh(Err(Error::cloud(
                        response.status,
                        "OAuth token refresh failed",
                    )));
                }
            }
        }));
    }

    fn cache_access_token(&self, tokens: &Value) -> String {
        let token = tokens
            .get("access_token")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let expires_in = tokens.get("expires_in").and_then(Value::as_u64).unwrap_or(0);
        let mut inner = self.inner.borrow_mut();
        inner.access_token = token.clone();
        inner.access_token_expiration = inner.clock.now()
            + Duration::from_secs(expires_in).saturating_sub(TOKEN_EXPIRATION_MARGIN);
        token
    }

    /// The refresh token was rejected: stay registered but disable sync
    /// until settings change.
    fn on_invalid_credentials(&self) {
        warn!("cloud rejected the refresh token");
        {
            let config = self.inner.borrow().config.clone();
            let mut change = config.transaction();
            change.set_refresh_token("");
            change.commit();
        }
        self.set_gcd_state(GcdState::InvalidCredentials);
        self.finish_refresh(Err(Error::new(
            domains::CLOUD,
            ErrorCode::InvalidCredentials,
            "Device credentials are no longer valid",
        )));
    }

    fn finish_refresh(&self, result: Result<String>) {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            inner.refresh_in_flight = false;
            std::mem::take(&mut inner.token_waiters)
        };
        for waiter in waiters {
            waiter(result.clone());
        }
    }

    /// Drop the cached token so the next exchange refreshes first. Used on
    /// a 401 response.
    fn invalidate_access_token(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.access_token.clear();
    }

    // ------------------------------------------------------------------
    // Sync Loop
    // ------------------------------------------------------------------

    fn start_sync(&self) {
        let start_channel = {
            let mut inner = self.inner.borrow_mut();
            if inner.sync_started {
                None
            } else {
                inner.sync_started = true;
                let channel: Box<dyn NotificationChannel> =
                    if inner.options.push_notifications_enabled && inner.network.is_some() {
                        Box::new(Rc::new(PushChannel::new(
                            inner.network.clone().expect("checked above"),
                            inner.runner.clone(),
                            inner.options.notification_host.clone(),
                            inner.options.notification_port,
                        )))
                    } else {
                        Box::new(PullChannel::new(inner.runner.clone()))
                    };
                Some(channel)
            }
        };
        if let Some(channel) = start_channel {
            info!(channel = channel.name(), "cloud sync started");
            channel.start(Rc::new(self.clone()));
            self.inner.borrow_mut().channel = Some(channel);
        }
        // Kick every channel once right away.
        self.poll_commands();
        self.schedule_state_flush();
        self.push_status_updates();
    }

    fn device_url(&self, suffix: &str) -> String {
        let settings = self.inner.borrow().config.settings();
        format!("{}{}", with_trailing_slash(&settings.service_url), suffix)
    }

    fn sync_ready(&self) -> bool {
        let settings = self.inner.borrow().config.settings();
        settings.is_registered()
            && self.online()
            && self.gcd_state() != GcdState::InvalidCredentials
    }

    // --- Command poll -------------------------------------------------

    fn poll_commands(&self) {
        if !self.sync_ready() {
            return;
        }
        {
            let mut inner = self.inner.borrow_mut();
            if inner.command_poll_in_flight {
                return;
            }
            inner.command_poll_in_flight = true;
        }
        self.poll_commands_attempt(false);
    }

    fn poll_commands_attempt(&self, retried_auth: bool) {
        let device_id = self.inner.borrow().config.settings().device_id;
        let url = self.device_url(&format!("commands?deviceId={device_id}&state=queued"));
        let this = self.clone();
        self.with_token(move |this2, token| {
            let request =
                HttpRequest::new(HttpMethod::Get, &url).with_header("Authorization", format!("Bearer {token}"));
            let again = this2.clone();
            this2.send(request, Box::new(move |result| {
                again.on_poll_response(result, retried_auth);
            }));
        }, Box::new(move |err| {
            this.inner.borrow_mut().command_poll_in_flight = false;
            debug!(%err, "command poll skipped: no access token");
        }));
    }

    fn on_poll_response(&self, result: Result<HttpResponse>, retried_auth: bool) {
        match self.classify(result, retried_auth) {
            Outcome::RetryAuth => self.poll_commands_attempt(true),
            Outcome::RetryLater(err) => {
                let delay = {
                    let mut inner = self.inner.borrow_mut();
                    inner.command_poll_in_flight = false;
                    inner.poll_backoff.next_delay()
                };
                debug!(%err, ?delay, "command poll failed; retrying");
                let this = self.clone();
                self.inner
                    .borrow()
                    .runner
                    .post_delayed(delay, Box::new(move || this.poll_commands()));
            }
            Outcome::Failed(err) => {
                self.inner.borrow_mut().command_poll_in_flight = false;
                warn!(%err, "command poll failed");
            }
            Outcome::Success(body) => {
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.command_poll_in_flight = false;
                    inner.poll_backoff.reset();
                }
                let commands = body
                    .get("commands")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for command in &commands {
                    self.accept_cloud_command(command);
                }
            }
        }
    }

    fn accept_cloud_command(&self, command: &Value) {
        let components = self.inner.borrow().components.clone();
        match components.parse_command_instance(command, CommandOrigin::Cloud, UserRole::Owner) {
            Ok(command) => components.add_command(command),
            Err(parse_error) => {
                warn!(error = %parse_error.error, "rejecting cloud command");
                if let Some(id) = parse_error.id {
                    self.enqueue_status_update(
                        id,
                        json!({
                            "state": CommandState::Aborted.as_str(),
                            "error": parse_error.error.to_json(),
                        }),
                    );
                }
            }
        }
    }

    /// Mirror every lifecycle change of a cloud command back to the
    /// registry.
    fn watch_cloud_command(&self, command: &crate::command::Command) {
        let this = self.clone();
        let weak = command.downgrade();
        let id = command.id();
        command.add_observer(Rc::new(move |event| {
            if event == CommandEvent::Destroyed {
                return;
            }
            let Some(command) = weak.upgrade() else {
                return;
            };
            let mut patch = Map::new();
            patch.insert("state".into(), command.state().as_str().into());
            patch.insert("progress".into(), Value::Object(command.progress()));
            patch.insert("results".into(), Value::Object(command.results()));
            if let Some(error) = command.error() {
                patch.insert("error".into(), error.to_json());
            }
            this.enqueue_status_update(id.clone(), Value::Object(patch));
        }));
    }

    fn enqueue_status_update(&self, id: String, patch: Value) {
        self.inner
            .borrow_mut()
            .pending_status_updates
            .push_back((id, patch));
        self.push_status_updates();
    }

    fn push_status_updates(&self) {
        if !self.sync_ready() {
            return;
        }
        {
            let mut inner = self.inner.borrow_mut();
            if inner.status_push_in_flight || inner.pending_status_updates.is_empty() {
                return;
            }
            inner.status_push_in_flight = true;
        }
        self.push_status_attempt(false);
    }

    fn push_status_attempt(&self, retried_auth: bool) {
        let front = self.inner.borrow().pending_status_updates.front().cloned();
        let Some((id, patch)) = front else {
            self.inner.borrow_mut().status_push_in_flight = false;
            return;
        };
        let url = self.device_url(&format!("commands/{id}"));
        let this = self.clone();
        self.with_token(move |this2, token| {
            let request = HttpRequest::new(HttpMethod::Patch, &url)
                .with_header("Authorization", format!("Bearer {token}"))
                .with_json(&patch);
            let again = this2.clone();
            this2.send(request, Box::new(move |result| {
                again.on_status_response(result, retried_auth);
            }));
        }, Box::new(move |err| {
            this.inner.borrow_mut().status_push_in_flight = false;
            debug!(%err, "status push skipped: no access token");
        }));
    }

    fn on_status_response(&self, result: Result<HttpResponse>, retried_auth: bool) {
        match self.classify(result, retried_auth) {
            Outcome::RetryAuth => self.push_status_attempt(true),
            Outcome::RetryLater(err) => {
                let delay = {
                    let mut inner = self.inner.borrow_mut();
                    inner.status_push_in_flight = false;
                    inner.push_backoff.next_delay()
                };
                debug!(%err, ?delay, "status push failed; retrying");
                let this = self.clone();
                self.inner
                    .borrow()
                    .runner
                    .post_delayed(delay, Box::new(move || this.push_status_updates()));
            }
            Outcome::Failed(err) => {
                // The command is gone or rejected; drop the update.
                let mut inner = self.inner.borrow_mut();
                inner.pending_status_updates.pop_front();
                inner.status_push_in_flight = false;
                warn!(%err, "dropping command status update");
                drop(inner);
                self.push_status_updates();
            }
            Outcome::Success(_) => {
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.pending_status_updates.pop_front();
                    inner.status_push_in_flight = false;
                    inner.push_backoff.reset();
                }
                self.push_status_updates();
            }
        }
    }

    // --- State flush --------------------------------------------------

    fn schedule_state_flush(&self) {
        let this = self.clone();
        let runner = self.inner.borrow().runner.clone();
        runner.post(Box::new(move || this.flush_state()));
    }

    fn flush_state(&self) {
        if !self.sync_ready() {
            return;
        }
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state_flush_in_flight {
                return;
            }
            let components = inner.components.clone();
            drop(inner);
            let snapshot = components.get_and_clear_recorded_state_changes();
            let mut inner = self.inner.borrow_mut();
            if !snapshot.state_changes.is_empty() {
                inner.pending_state.extend(snapshot.state_changes);
                inner.pending_update_id = snapshot.update_id;
            }
            if inner.pending_state.is_empty() {
                return;
            }
            inner.state_flush_in_flight = true;
        }
        self.flush_state_attempt(false);
    }

    fn flush_state_attempt(&self, retried_auth: bool) {
        let (device_id, body) = {
            let inner = self.inner.borrow();
            let device_id = inner.config.settings().device_id;
            let patches: Vec<Value> = inner
                .pending_state
                .iter()
                .map(|change| {
                    json!({
                        "timeMs": change.timestamp.as_millis(),
                        "component": change.component.clone(),
                        "state": Value::Object(change.changed_properties.clone()),
                    })
                })
                .collect();
            let body = json!({
                "requestTimeMs": inner.clock.now().as_millis(),
                "patches": patches,
            });
            (device_id, body)
        };
        let url = self.device_url(&format!("devices/{device_id}/patchState"));
        let this = self.clone();
        self.with_token(move |this2, token| {
            let request = HttpRequest::new(HttpMethod::Post, &url)
                .with_header("Authorization", format!("Bearer {token}"))
                .with_json(&body);
            let again = this2.clone();
            this2.send(request, Box::new(move |result| {
                again.on_flush_response(result, retried_auth);
            }));
        }, Box::new(move |err| {
            this.inner.borrow_mut().state_flush_in_flight = false;
            debug!(%err, "state flush skipped: no access token");
        }));
    }

    fn on_flush_response(&self, result: Result<HttpResponse>, retried_auth: bool) {
        match self.classify(result, retried_auth) {
            Outcome::RetryAuth => self.flush_state_attempt(true),
            Outcome::RetryLater(err) => {
                let delay = {
                    let mut inner = self.inner.borrow_mut();
                    inner.state_flush_in_flight = false;
                    inner.flush_backoff.next_delay()
                };
                debug!(%err, ?delay, "state flush failed; retrying");
                let this = self.clone();
                self.inner
                    .borrow()
                    .runner
                    .post_delayed(delay, Box::new(move || this.flush_state()));
            }
            Outcome::Failed(err) => {
                let mut inner = self.inner.borrow_mut();
                inner.pending_state.clear();
                inner.state_flush_in_flight = false;
                warn!(%err, "state flush rejected; dropping deltas");
            }
            Outcome::Success(_) => {
                let (components, update_id) = {
                    let mut inner = self.inner.borrow_mut();
                    inner.pending_state.clear();
                    inner.state_flush_in_flight = false;
                    inner.flush_backoff.reset();
                    (inner.components.clone(), inner.pending_update_id)
                };
                components.notify_state_updated_on_server(update_id);
                // More may have accumulated while the flush was in flight.
                self.schedule_state_flush();
            }
        }
    }

    // ------------------------------------------------------------------
    // Request Plumbing
    // ------------------------------------------------------------------

    fn send(&self, request: HttpRequest, callback: crate::provider::HttpCallback) {
        let http = self.inner.borrow().http.clone();
        http.send_request(request, callback);
    }

    fn with_token(
        &self,
        then: impl FnOnce(&DeviceRegistration, String) + 'static,
        or_else: Box<dyn FnOnce(Error)>,
    ) {
        let this = self.clone();
        self.ensure_access_token(Box::new(move |result| match result {
            Ok(token) => then(&this, token),
            Err(err) => or_else(err),
        }));
    }

    fn expect_json(&self, result: Result<HttpResponse>) -> Result<Value> {
        let response = result?;
        if !response.is_success() {
            return Err(Error::cloud(
                response.status,
                format!("Cloud request failed with HTTP {}", response.status),
            ));
        }
        response.json()
    }

    fn classify(&self, result: Result<HttpResponse>, retried_auth: bool) -> Outcome {
        match result {
            Err(err) => Outcome::RetryLater(err),
            Ok(response) if response.is_success() => {
                let body = response.json().unwrap_or(Value::Null);
                Outcome::Success(body)
            }
            Ok(response) if response.status == 401 && !retried_auth => {
                self.invalidate_access_token();
                Outcome::RetryAuth
            }
            Ok(response) if response.status >= 500 => Outcome::RetryLater(Error::cloud(
                response.status,
                "Cloud request failed with a server error",
            )),
            Ok(response) => Outcome::Failed(Error::cloud(
                response.status,
                format!("Cloud request failed with HTTP {}", response.status),
            )),
        }
    }
}

enum Outcome {
    Success(Value),
    RetryAuth,
    RetryLater(Error),
    Failed(Error),
}

// ----------------------------------------------------------------------------
// Notification Delegate
// ----------------------------------------------------------------------------

impl NotificationDelegate for DeviceRegistration {
    fn on_connected(&self, channel_name: &'static str) {
        debug!(channel = channel_name, "notification channel up");
    }

    fn on_disconnected(&self) {
        debug!("notification channel down");
    }

    fn on_command_notification(&self) {
        self.poll_commands();
    }

    fn on_permanent_failure(&self) {
        // Swap the broken push channel for the always-working pull.
        let (runner, old) = {
            let mut inner = self.inner.borrow_mut();
            (inner.runner.clone(), inner.channel.take())
        };
        if let Some(old) = old {
            old.stop();
        }
        let channel: Box<dyn NotificationChannel> = Box::new(PullChannel::new(runner));
        channel.start(Rc::new(self.clone()));
        self.inner.borrow_mut().channel = Some(channel);
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

fn is_invalid_grant(response: &HttpResponse) -> bool {
    if !(400..500).contains(&response.status) {
        return false;
    }
    response
        .json()
        .ok()
        .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
        .is_some_and(|error| error == "invalid_grant")
}
