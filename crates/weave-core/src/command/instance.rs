//! A single command instance and its lifecycle state machine
//!
//! Commands are owned by the command queue; handlers and observers hold
//! weak references and must tolerate the command disappearing underneath
//! them.

use core::fmt;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde_json::{Map, Value};

use crate::error::{domains, Error, ErrorCode, Result};
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// State and Origin
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOrigin {
    Local,
    Cloud,
}

impl CommandOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandOrigin::Local => "local",
            CommandOrigin::Cloud => "cloud",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Queued,
    InProgress,
    Paused,
    Error,
    Done,
    Cancelled,
    Aborted,
    Expired,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Queued => "queued",
            CommandState::InProgress => "inProgress",
            CommandState::Paused => "paused",
            CommandState::Error => "error",
            CommandState::Done => "done",
            CommandState::Cancelled => "cancelled",
            CommandState::Aborted => "aborted",
            CommandState::Expired => "expired",
        }
    }

    /// Terminal states are absorbing: no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandState::Done
                | CommandState::Cancelled
                | CommandState::Aborted
                | CommandState::Expired
        )
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Observers
// ----------------------------------------------------------------------------

/// Change notifications delivered to command observers, in state-machine
/// order, synchronously on the task runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEvent {
    StateChanged,
    ProgressChanged,
    ResultsChanged,
    ErrorChanged,
    /// The queue dropped the command; weak references are now dead.
    Destroyed,
}

pub type CommandObserver = Rc<dyn Fn(CommandEvent)>;

// ----------------------------------------------------------------------------
// Command Instance
// ----------------------------------------------------------------------------

pub(crate) struct CommandInstance {
    id: String,
    name: String,
    origin: CommandOrigin,
    component_path: String,
    parameters: Map<String, Value>,
    progress: Map<String, Value>,
    results: Map<String, Value>,
    error: Option<Error>,
    state: CommandState,
    expiration: Option<Timestamp>,
    observers: Vec<CommandObserver>,
    /// Installed by the queue; schedules the delayed removal of this id.
    remover: Option<Box<dyn Fn(&str)>>,
}

impl Drop for CommandInstance {
    fn drop(&mut self) {
        for observer in self.observers.drain(..) {
            observer(CommandEvent::Destroyed);
        }
    }
}

// ----------------------------------------------------------------------------
// Owning and Weak Handles
// ----------------------------------------------------------------------------

/// Shared handle to a live command. The queue holds the owning copy;
/// everything reachable from handlers goes through [`WeakCommand`].
#[derive(Clone)]
pub struct Command {
    inner: Rc<RefCell<CommandInstance>>,
}

#[derive(Clone)]
pub struct WeakCommand {
    inner: Weak<RefCell<CommandInstance>>,
}

impl WeakCommand {
    pub fn upgrade(&self) -> Option<Command> {
        self.inner.upgrade().map(|inner| Command { inner })
    }
}

impl Command {
    pub(crate) fn from_parts(
        id: String,
        name: String,
        origin: CommandOrigin,
        component_path: String,
        parameters: Map<String, Value>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(CommandInstance {
                id,
                name,
                origin,
                component_path,
                parameters,
                progress: Map::new(),
                results: Map::new(),
                error: None,
                state: CommandState::Queued,
                expiration: None,
                observers: Vec::new(),
                remover: None,
            })),
        }
    }

    /// Parse a command dictionary: `{id?, name, component?, parameters?}`.
    ///
    /// On failure the caller still receives any id present in the input so
    /// cloud commands can be aborted remotely.
    pub fn from_json(value: &Value, origin: CommandOrigin) -> Result<Command> {
        let json = value
            .as_object()
            .ok_or_else(|| Error::object_expected("Command instance is not a JSON object"))?;

        let id = json
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let name = json
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::property_missing(domains::COMMANDS, "Command name is missing")
            })?
            .to_string();

        let component_path = json
            .get("component")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let parameters = match json.get("parameters") {
            None => Map::new(),
            Some(Value::Object(params)) => params.clone(),
            Some(_) => {
                let cause = Error::object_expected("Property 'parameters' must be a JSON object");
                return Err(Error::with_cause(
                    domains::COMMANDS,
                    ErrorCode::CommandFailed,
                    format!("Failed to validate command '{name}'"),
                    cause,
                ));
            }
        };

        Ok(Command::from_parts(id, name, origin, component_path, parameters))
    }

    pub fn downgrade(&self) -> WeakCommand {
        WeakCommand {
            inner: Rc::downgrade(&self.inner),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn id(&self) -> String {
        self.inner.borrow().id.clone()
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    /// The `trait` half of the `trait.command` name.
    pub fn trait_name(&self) -> String {
        let inner = self.inner.borrow();
        inner
            .name
            .split_once('.')
            .map(|(t, _)| t.to_string())
            .unwrap_or_else(|| inner.name.clone())
    }

    pub fn origin(&self) -> CommandOrigin {
        self.inner.borrow().origin
    }

    pub fn component_path(&self) -> String {
        self.inner.borrow().component_path.clone()
    }

    pub fn state(&self) -> CommandState {
        self.inner.borrow().state
    }

    pub fn parameters(&self) -> Map<String, Value> {
        self.inner.borrow().parameters.clone()
    }

    pub fn progress(&self) -> Map<String, Value> {
        self.inner.borrow().progress.clone()
    }

    pub fn results(&self) -> Map<String, Value> {
        self.inner.borrow().results.clone()
    }

    pub fn error(&self) -> Option<Error> {
        self.inner.borrow().error.clone()
    }

    pub fn expiration(&self) -> Option<Timestamp> {
        self.inner.borrow().expiration
    }

    pub(crate) fn set_id(&self, id: impl Into<String>) {
        self.inner.borrow_mut().id = id.into();
    }

    pub(crate) fn set_component_path(&self, path: impl Into<String>) {
        self.inner.borrow_mut().component_path = path.into();
    }

    pub(crate) fn set_expiration(&self, expiration: Timestamp) {
        self.inner.borrow_mut().expiration = Some(expiration);
    }

    pub(crate) fn set_remover(&self, remover: Box<dyn Fn(&str)>) {
        self.inner.borrow_mut().remover = Some(remover);
    }

    pub fn add_observer(&self, observer: CommandObserver) {
        self.inner.borrow_mut().observers.push(observer);
    }

    /// Full JSON form used for cloud status patches and local inspection.
    pub fn to_json(&self) -> Value {
        let inner = self.inner.borrow();
        let mut obj = Map::new();
        obj.insert("id".into(), inner.id.clone().into());
        obj.insert("name".into(), inner.name.clone().into());
        obj.insert("component".into(), inner.component_path.clone().into());
        obj.insert("parameters".into(), Value::Object(inner.parameters.clone()));
        obj.insert("progress".into(), Value::Object(inner.progress.clone()));
        obj.insert("results".into(), Value::Object(inner.results.clone()));
        obj.insert("state".into(), inner.state.as_str().into());
        if let Some(error) = &inner.error {
            obj.insert("error".into(), error.to_json());
        }
        Value::Object(obj)
    }

    // ------------------------------------------------------------------
    // State Machine
    // ------------------------------------------------------------------

    /// Merge new progress and move to `inProgress`. The status transition
    /// happens even when the progress dictionary is unchanged, because the
    /// transition itself matters to subscribers.
    pub fn set_progress(&self, progress: Map<String, Value>) -> Result<()> {
        self.set_status(CommandState::InProgress)?;
        let changed = {
            let mut inner = self.inner.borrow_mut();
            if inner.progress != progress {
                inner.progress = progress;
                true
            } else {
                false
            }
        };
        if changed {
            self.fire(CommandEvent::ProgressChanged);
        }
        Ok(())
    }

    /// Record results, move to `done`, and schedule removal from the
    /// queue.
    pub fn complete(&self, results: Map<String, Value>) -> Result<()> {
        let changed = {
            let mut inner = self.inner.borrow_mut();
            if inner.results != results {
                inner.results = results;
                true
            } else {
                false
            }
        };
        if changed {
            self.fire(CommandEvent::ResultsChanged);
        }
        let status = self.set_status(CommandState::Done);
        self.remove_from_queue();
        status
    }

    /// Record an error and move to the (non-terminal) `error` state.
    pub fn set_error(&self, error: Error) -> Result<()> {
        self.inner.borrow_mut().error = Some(error);
        self.fire(CommandEvent::ErrorChanged);
        self.set_status(CommandState::Error)
    }

    /// Record an error, move to `aborted`, and schedule removal.
    pub fn abort(&self, error: Option<Error>) -> Result<()> {
        self.inner.borrow_mut().error = error;
        self.fire(CommandEvent::ErrorChanged);
        let status = self.set_status(CommandState::Aborted);
        self.remove_from_queue();
        status
    }

    /// Move to `cancelled` and schedule removal.
    pub fn cancel(&self) -> Result<()> {
        let status = self.set_status(CommandState::Cancelled);
        self.remove_from_queue();
        status
    }

    pub fn pause(&self) -> Result<()> {
        self.set_status(CommandState::Paused)
    }

    pub(crate) fn mark_expired(&self) -> Result<()> {
        self.set_status(CommandState::Expired)
    }

    fn set_status(&self, status: CommandState) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if status == inner.state {
                return Ok(());
            }
            if status == CommandState::Queued || inner.state.is_terminal() {
                return Err(Error::invalid_state(
                    domains::COMMANDS,
                    format!(
                        "State switch impossible: '{}' -> '{}'",
                        inner.state, status
                    ),
                ));
            }
            inner.state = status;
        }
        self.fire(CommandEvent::StateChanged);
        Ok(())
    }

    fn fire(&self, event: CommandEvent) {
        let observers: Vec<CommandObserver> = self.inner.borrow().observers.clone();
        for observer in observers {
            observer(event);
        }
    }

    fn remove_from_queue(&self) {
        let (remover, id) = {
            let mut inner = self.inner.borrow_mut();
            (inner.remover.take(), inner.id.clone())
        };
        if let Some(remover) = remover {
            remover(&id);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Command")
            .field("id", &inner.id)
            .field("name", &inner.name)
            .field("state", &inner.state)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    fn command(name: &str) -> Command {
        Command::from_json(&json!({ "name": name }), CommandOrigin::Local).unwrap()
    }

    #[test]
    fn parses_minimal_command() {
        let cmd = Command::from_json(
            &json!({"name": "base.reboot", "parameters": {"delay": 5}}),
            CommandOrigin::Local,
        )
        .unwrap();
        assert_eq!(cmd.name(), "base.reboot");
        assert_eq!(cmd.trait_name(), "base");
        assert_eq!(cmd.state(), CommandState::Queued);
        assert_eq!(cmd.parameters()["delay"], 5);
    }

    #[test]
    fn missing_name_is_property_missing() {
        let err = Command::from_json(&json!({"id": "5"}), CommandOrigin::Local).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PropertyMissing);
    }

    #[test]
    fn non_object_is_object_expected() {
        let err = Command::from_json(&json!([1, 2]), CommandOrigin::Cloud).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ObjectExpected);
    }

    #[test]
    fn bad_parameters_fail_with_cause() {
        let err = Command::from_json(
            &json!({"name": "base.reboot", "parameters": [1]}),
            CommandOrigin::Local,
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CommandFailed);
        assert_eq!(err.caused_by().unwrap().code(), ErrorCode::ObjectExpected);
    }

    #[test]
    fn progress_transitions_to_in_progress() {
        let cmd = command("base.reboot");
        cmd.set_progress(Map::new()).unwrap();
        assert_eq!(cmd.state(), CommandState::InProgress);
        // Identical progress keeps the state transition valid.
        cmd.set_progress(Map::new()).unwrap();
        assert_eq!(cmd.state(), CommandState::InProgress);
    }

    #[test]
    fn pause_resume_cycle() {
        let cmd = command("base.reboot");
        cmd.set_progress(Map::new()).unwrap();
        cmd.pause().unwrap();
        assert_eq!(cmd.state(), CommandState::Paused);
        cmd.set_progress(json!({"pct": 50}).as_object().unwrap().clone())
            .unwrap();
        assert_eq!(cmd.state(), CommandState::InProgress);
    }

    #[test]
    fn error_state_is_not_terminal() {
        let cmd = command("base.reboot");
        cmd.set_progress(Map::new()).unwrap();
        cmd.set_error(Error::invalid_state(domains::COMMANDS, "boom"))
            .unwrap();
        assert_eq!(cmd.state(), CommandState::Error);
        cmd.complete(Map::new()).unwrap();
        assert_eq!(cmd.state(), CommandState::Done);
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let cmd = command("base.reboot");
        cmd.cancel().unwrap();
        assert_eq!(cmd.state(), CommandState::Cancelled);
        assert!(cmd.set_progress(Map::new()).is_err());
        assert!(cmd.complete(Map::new()).is_err());
        assert!(cmd.pause().is_err());
        assert!(cmd.abort(None).is_err());
        assert_eq!(cmd.state(), CommandState::Cancelled);
    }

    #[test]
    fn queued_is_unreachable() {
        let cmd = command("base.reboot");
        cmd.set_progress(Map::new()).unwrap();
        // No public mutator targets queued; the machine rejects it even for
        // an internal request.
        let err = cmd.set_status(CommandState::Queued).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
    }

    #[test]
    fn observers_see_ordered_events() {
        let cmd = command("base.reboot");
        let events = Rc::new(RefCell::new(Vec::new()));
        let log = events.clone();
        cmd.add_observer(Rc::new(move |event| log.borrow_mut().push(event)));

        cmd.set_progress(json!({"pct": 10}).as_object().unwrap().clone())
            .unwrap();
        cmd.complete(json!({"ok": true}).as_object().unwrap().clone())
            .unwrap();

        assert_eq!(
            *events.borrow(),
            vec![
                CommandEvent::StateChanged,
                CommandEvent::ProgressChanged,
                CommandEvent::ResultsChanged,
                CommandEvent::StateChanged,
            ]
        );
    }

    #[test]
    fn destruction_notifies_observers() {
        let destroyed = Rc::new(RefCell::new(false));
        let flag = destroyed.clone();
        {
            let cmd = command("base.reboot");
            cmd.add_observer(Rc::new(move |event| {
                if event == CommandEvent::Destroyed {
                    *flag.borrow_mut() = true;
                }
            }));
        }
        assert!(*destroyed.borrow());
    }

    #[test]
    fn weak_handle_dies_with_command() {
        let weak = {
            let cmd = command("base.reboot");
            cmd.downgrade()
        };
        assert!(weak.upgrade().is_none());
    }
}
