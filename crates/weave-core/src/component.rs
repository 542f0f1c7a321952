//! Trait dictionary and component tree
//!
//! The component manager owns the device's typed capability model: the
//! append-only trait definitions, the component tree with per-component
//! state, the per-component state-change journals, and the command queue.
//! Every mutation runs on the task runner; snapshots handed out are deep
//! copies.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::command::{
    Command, CommandCallback, CommandHandler, CommandOrigin, CommandQueue,
};
use crate::error::{domains, Error, ErrorCode, Result};
use crate::path;
use crate::provider::{Clock, TaskRunner};
use crate::state_queue::{StateChangeQueue, MAX_STATE_CHANGE_QUEUE_SIZE};
use crate::types::{Timestamp, UserRole};

// ----------------------------------------------------------------------------
// Snapshots
// ----------------------------------------------------------------------------

/// One recorded state delta attributed to a component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentStateChange {
    pub timestamp: Timestamp,
    pub component: String,
    pub changed_properties: Map<String, Value>,
}

/// Everything the cloud state flush needs: the watermark and the ordered
/// deltas since the last flush.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub update_id: u64,
    pub state_changes: Vec<ComponentStateChange>,
}

/// Parse failure that still surfaces the command id (if the input carried
/// one) so cloud commands can be aborted remotely.
#[derive(Debug)]
pub struct CommandParseError {
    pub id: Option<String>,
    pub error: Error,
}

// ----------------------------------------------------------------------------
// Component Manager
// ----------------------------------------------------------------------------

struct Inner {
    clock: Rc<dyn Clock>,
    traits: Map<String, Value>,
    components: Map<String, Value>,
    state_change_queues: HashMap<String, StateChangeQueue>,
    last_update_id: u64,
    next_command_id: u64,
    on_trait_changed: Vec<Rc<dyn Fn()>>,
    on_component_tree_changed: Vec<Rc<dyn Fn()>>,
    on_state_changed: Vec<Rc<dyn Fn()>>,
    on_server_state_updated: Vec<Rc<dyn Fn(u64)>>,
}

/// Cheap-to-clone handle to the shared model.
#[derive(Clone)]
pub struct ComponentManager {
    inner: Rc<RefCell<Inner>>,
    queue: CommandQueue,
}

impl ComponentManager {
    pub fn new(runner: Rc<dyn TaskRunner>, clock: Rc<dyn Clock>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                clock: clock.clone(),
                traits: Map::new(),
                components: Map::new(),
                state_change_queues: HashMap::new(),
                last_update_id: 0,
                next_command_id: 0,
                on_trait_changed: Vec::new(),
                on_component_tree_changed: Vec::new(),
                on_state_changed: Vec::new(),
                on_server_state_updated: Vec::new(),
            })),
            queue: CommandQueue::new(runner, clock),
        }
    }

    // ------------------------------------------------------------------
    // Traits
    // ------------------------------------------------------------------

    /// Load a `{name -> definition}` map of trait definitions. Traits are
    /// append-only: redefinition with a different body fails, and nothing
    /// is committed unless the whole input validates.
    pub fn load_traits(&self, dict: &Value) -> Result<()> {
        let dict = dict
            .as_object()
            .ok_or_else(|| Error::object_expected("Trait definitions must be a JSON object"))?;

        let modified = {
            let mut inner = self.inner.borrow_mut();
            for (name, definition) in dict {
                if !definition.is_object() {
                    return Err(Error::type_mismatch(
                        domains::COMPONENTS,
                        format!("Trait '{name}' must be an object"),
                    ));
                }
                if let Some(existing) = inner.traits.get(name) {
                    if existing != definition {
                        return Err(Error::type_mismatch(
                            domains::COMPONENTS,
                            format!("Trait '{name}' cannot be redefined"),
                        ));
                    }
                }
            }
            let mut modified = false;
            for (name, definition) in dict {
                if !inner.traits.contains_key(name) {
                    inner.traits.insert(name.clone(), definition.clone());
                    modified = true;
                }
            }
            modified
        };

        if modified {
            self.fire(|inner| inner.on_trait_changed.clone());
        }
        Ok(())
    }

    pub fn load_traits_from_json(&self, json: &str) -> Result<()> {
        let value: Value = serde_json::from_str(json)
            .map_err(|err| Error::object_expected(format!("Malformed trait JSON: {err}")))?;
        self.load_traits(&value)
    }

    pub fn traits(&self) -> Map<String, Value> {
        self.inner.borrow().traits.clone()
    }

    pub fn find_trait_definition(&self, name: &str) -> Option<Value> {
        self.inner.borrow().traits.get(name).cloned()
    }

    pub fn add_trait_def_changed_callback(&self, callback: Rc<dyn Fn()>) {
        self.inner.borrow_mut().on_trait_changed.push(callback.clone());
        callback();
    }

    /// Definition of a `trait.command` pair, if registered.
    pub fn find_command_definition(&self, command_name: &str) -> Option<Value> {
        let (trait_name, command) = command_name.split_once('.')?;
        if command.contains('.') {
            return None;
        }
        self.inner
            .borrow()
            .traits
            .get(trait_name)?
            .get("commands")?
            .get(command)
            .cloned()
    }

    pub fn get_command_minimal_role(&self, command_name: &str) -> Result<UserRole> {
        let definition = self.find_command_definition(command_name).ok_or_else(|| {
            Error::new(
                domains::COMMANDS,
                ErrorCode::InvalidCommandName,
                format!("Command definition for '{command_name}' not found"),
            )
        })?;
        minimal_role_of(&definition)
    }

    pub fn get_state_minimal_role(&self, state_property_name: &str) -> Result<UserRole> {
        let inner = self.inner.borrow();
        let definition = find_state_definition(&inner.traits, state_property_name)
            .ok_or_else(|| {
                Error::invalid_state(
                    domains::COMPONENTS,
                    format!("State definition for '{state_property_name}' not found"),
                )
            })?;
        minimal_role_of(definition)
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    /// Add a component under `path` (empty path adds at the root). Every
    /// declared trait must already be defined.
    pub fn add_component(&self, path: &str, name: &str, traits: &[&str]) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.check_traits_defined(traits)?;
            let root = inner.graft_node(path)?;
            if root.contains_key(name) {
                return Err(Error::invalid_state(
                    domains::COMPONENTS,
                    format!("Component '{name}' already exists at path '{path}'"),
                ));
            }
            root.insert(name.to_string(), new_component(traits));
        }
        self.fire(|inner| inner.on_component_tree_changed.clone());
        Ok(())
    }

    /// Append a component to the array named `name` under `path`, creating
    /// the array on first use.
    pub fn add_component_array_item(&self, path: &str, name: &str, traits: &[&str]) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.check_traits_defined(traits)?;
            let root = inner.graft_node(path)?;
            if !root.contains_key(name) {
                root.insert(name.to_string(), Value::Array(Vec::new()));
            }
            let array = root.get_mut(name).and_then(Value::as_array_mut).ok_or_else(|| {
                Error::type_mismatch(
                    domains::COMPONENTS,
                    format!("Element '{name}' at path '{path}' is not an array"),
                )
            })?;
            array.push(new_component(traits));
        }
        self.fire(|inner| inner.on_component_tree_changed.clone());
        Ok(())
    }

    pub fn remove_component(&self, path: &str, name: &str) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            let root = inner.graft_node(path)?;
            if root.remove(name).is_none() {
                return Err(Error::invalid_state(
                    domains::COMPONENTS,
                    format!("Component '{name}' does not exist at path '{path}'"),
                ));
            }
        }
        self.fire(|inner| inner.on_component_tree_changed.clone());
        Ok(())
    }

    pub fn remove_component_array_item(&self, path: &str, name: &str, index: usize) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            let root = inner.graft_node(path)?;
            let array = root.get_mut(name).and_then(Value::as_array_mut).ok_or_else(|| {
                Error::invalid_state(
                    domains::COMPONENTS,
                    format!("There is no component array named '{name}' at path '{path}'"),
                )
            })?;
            if index >= array.len() {
                return Err(Error::invalid_state(
                    domains::COMPONENTS,
                    format!(
                        "Component array '{name}' at path '{path}' does not have an element {index}"
                    ),
                ));
            }
            array.remove(index);
        }
        self.fire(|inner| inner.on_component_tree_changed.clone());
        Ok(())
    }

    pub fn add_component_tree_changed_callback(&self, callback: Rc<dyn Fn()>) {
        self.inner
            .borrow_mut()
            .on_component_tree_changed
            .push(callback.clone());
        callback();
    }

    /// Deep copy of the whole tree.
    pub fn components(&self) -> Map<String, Value> {
        self.inner.borrow().components.clone()
    }

    /// Deep copy of the component at `path`.
    pub fn find_component(&self, path: &str) -> Result<Map<String, Value>> {
        let inner = self.inner.borrow();
        path::find_component(&inner.components, path).cloned()
    }

    /// Deep copy of the tree with every state property above `role`
    /// removed. Empty state objects are dropped along the way.
    pub fn get_components_for_user_role(&self, role: UserRole) -> Map<String, Value> {
        let inner = self.inner.borrow();
        let mut components = inner.components.clone();
        for component in components.values_mut() {
            if let Some(component) = component.as_object_mut() {
                remove_inaccessible_state(&inner.traits, component, role);
            }
        }
        components
    }

    /// Pre-order search for the first component declaring `trait_name`.
    pub fn find_component_with_trait(&self, trait_name: &str) -> Option<String> {
        let inner = self.inner.borrow();
        find_with_trait(&inner.components, trait_name, "")
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Validate a command dictionary against the model and produce a live
    /// command, assigning an id and a route where the input left them out.
    pub fn parse_command_instance(
        &self,
        value: &Value,
        origin: CommandOrigin,
        role: UserRole,
    ) -> std::result::Result<Command, CommandParseError> {
        let supplied_id = value
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let fail = |error: Error| CommandParseError {
            id: supplied_id.clone(),
            error,
        };

        let command = Command::from_json(value, origin).map_err(fail)?;

        let minimal_role = self
            .get_command_minimal_role(&command.name())
            .map_err(fail)?;
        if role < minimal_role {
            return Err(fail(Error::new(
                domains::COMMANDS,
                ErrorCode::AccessDenied,
                format!("User role '{role}' less than minimal: '{minimal_role}'"),
            )));
        }

        if command.component_path().is_empty() {
            let trait_name = command.trait_name();
            let component_path = self.find_component_with_trait(&trait_name).ok_or_else(|| {
                fail(Error::new(
                    domains::COMMANDS,
                    ErrorCode::UnroutedCommand,
                    format!(
                        "Unable to route command '{}' because no component supports trait '{}'",
                        command.name(),
                        trait_name
                    ),
                ))
            })?;
            command.set_component_path(component_path);
        }

        let component = self.find_component(&command.component_path()).map_err(fail)?;
        let trait_name = command.trait_name();
        let declares = component
            .get("traits")
            .and_then(Value::as_array)
            .is_some_and(|traits| traits.iter().any(|t| t.as_str() == Some(trait_name.as_str())));
        if !declares {
            return Err(fail(Error::new(
                domains::COMMANDS,
                ErrorCode::TraitNotSupported,
                format!(
                    "Component '{}' doesn't support trait '{}'",
                    command.component_path(),
                    trait_name
                ),
            )));
        }

        if command.id().is_empty() {
            let mut inner = self.inner.borrow_mut();
            inner.next_command_id += 1;
            command.set_id(inner.next_command_id.to_string());
        }

        Ok(command)
    }

    pub fn add_command(&self, command: Command) {
        self.queue.add(command);
    }

    pub fn find_command(&self, id: &str) -> Option<Command> {
        self.queue.find(id)
    }

    /// Register a handler for commands routed to `(component_path,
    /// command_name)`. A named command must be defined; empty names widen
    /// the match.
    pub fn add_command_handler(
        &self,
        component_path: impl Into<String>,
        command_name: impl Into<String>,
        handler: CommandHandler,
    ) {
        let component_path = component_path.into();
        let command_name = command_name.into();
        if !command_name.is_empty() {
            assert!(
                self.find_command_definition(&command_name).is_some(),
                "command undefined: {command_name}"
            );
        }
        self.queue
            .add_command_handler(component_path, command_name, handler);
    }

    pub fn add_command_added_callback(&self, callback: CommandCallback) {
        self.queue.add_command_added_callback(callback);
    }

    pub fn add_command_removed_callback(&self, callback: CommandCallback) {
        self.queue.add_command_removed_callback(callback);
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    /// Merge `dict` into the component's state, bump the update id, and
    /// journal the delta. Top-level keys must be traits the component
    /// declares.
    pub fn set_state_properties(&self, component_path: &str, dict: Map<String, Value>) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            let now = inner.clock.now();

            {
                let component = path::find_component(&inner.components, component_path)?;
                let declared = component
                    .get("traits")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for trait_name in dict.keys() {
                    let listed = declared
                        .iter()
                        .any(|t| t.as_str() == Some(trait_name.as_str()));
                    if !listed {
                        return Err(Error::new(
                            domains::COMPONENTS,
                            ErrorCode::TraitNotSupported,
                            format!(
                                "Component '{component_path}' doesn't support trait '{trait_name}'"
                            ),
                        ));
                    }
                }
            }

            let component = path::find_component_mut(&mut inner.components, component_path)?;
            if !matches!(component.get("state"), Some(Value::Object(_))) {
                component.insert("state".to_string(), Value::Object(Map::new()));
            }
            let state = component
                .get_mut("state")
                .and_then(Value::as_object_mut)
                .expect("state object ensured above");
            path::merge_objects(state, &dict);

            inner.last_update_id += 1;
            inner
                .state_change_queues
                .entry(component_path.to_string())
                .or_insert_with(|| StateChangeQueue::new(MAX_STATE_CHANGE_QUEUE_SIZE))
                .notify_properties_updated(now, dict);
            debug!(component = component_path, update_id = inner.last_update_id, "state updated");
        }
        self.fire(|inner| inner.on_state_changed.clone());
        Ok(())
    }

    pub fn set_state_properties_from_json(&self, component_path: &str, json: &str) -> Result<()> {
        let value: Value = serde_json::from_str(json)
            .map_err(|err| Error::object_expected(format!("Malformed state JSON: {err}")))?;
        let dict = value
            .as_object()
            .ok_or_else(|| Error::object_expected("State properties must be a JSON object"))?;
        self.set_state_properties(component_path, dict.clone())
    }

    /// Set one `"trait.prop"` state property.
    pub fn set_state_property(&self, component_path: &str, name: &str, value: Value) -> Result<()> {
        let dict = path::nest_property(name, value)?;
        self.set_state_properties(component_path, dict)
    }

    pub fn get_state_property(&self, component_path: &str, name: &str) -> Result<Value> {
        let component = self.find_component(component_path)?;
        let (package, prop) = name.split_once('.').ok_or_else(|| {
            Error::property_missing(
                domains::COMPONENTS,
                format!("State property name not specified in '{name}'"),
            )
        })?;
        component
            .get("state")
            .and_then(|state| state.get(package))
            .and_then(|package| package.get(prop))
            .cloned()
            .ok_or_else(|| {
                Error::property_missing(
                    domains::COMPONENTS,
                    format!("State property '{name}' not found in component '{component_path}'"),
                )
            })
    }

    pub fn add_state_changed_callback(&self, callback: Rc<dyn Fn()>) {
        self.inner.borrow_mut().on_state_changed.push(callback.clone());
        // Force consumers to read the current state.
        callback();
    }

    pub fn last_state_change_id(&self) -> u64 {
        self.inner.borrow().last_update_id
    }

    /// Drain every per-component journal into one snapshot, sorted by
    /// timestamp (stable for equal stamps).
    pub fn get_and_clear_recorded_state_changes(&self) -> StateSnapshot {
        let mut inner = self.inner.borrow_mut();
        let mut snapshot = StateSnapshot {
            update_id: inner.last_update_id,
            state_changes: Vec::new(),
        };
        let mut components: Vec<String> = inner.state_change_queues.keys().cloned().collect();
        components.sort();
        for component in components {
            if let Some(queue) = inner.state_change_queues.get_mut(&component) {
                for change in queue.get_and_clear_recorded_state_changes() {
                    snapshot.state_changes.push(ComponentStateChange {
                        timestamp: change.timestamp,
                        component: component.clone(),
                        changed_properties: change.changed_properties,
                    });
                }
            }
        }
        snapshot.state_changes.sort_by_key(|change| change.timestamp);
        inner.state_change_queues.clear();
        snapshot
    }

    /// The cloud acked a state flush with this update id.
    pub fn notify_state_updated_on_server(&self, update_id: u64) {
        let callbacks = self.inner.borrow().on_server_state_updated.clone();
        for callback in callbacks {
            callback(update_id);
        }
    }

    pub fn add_server_state_updated_callback(&self, callback: Rc<dyn Fn(u64)>) {
        let run_now = {
            let mut inner = self.inner.borrow_mut();
            inner.on_server_state_updated.push(callback.clone());
            inner
                .state_change_queues
                .values()
                .all(StateChangeQueue::is_empty)
                .then_some(inner.last_update_id)
        };
        if let Some(update_id) = run_now {
            callback(update_id);
        }
    }

    fn fire(&self, select: impl FnOnce(&Inner) -> Vec<Rc<dyn Fn()>>) {
        let callbacks = select(&self.inner.borrow());
        for callback in callbacks {
            callback();
        }
    }
}

impl Inner {
    fn check_traits_defined(&self, traits: &[&str]) -> Result<()> {
        for name in traits {
            if !self.traits.contains_key(*name) {
                return Err(Error::new(
                    domains::COMPONENTS,
                    ErrorCode::InvalidPropValue,
                    format!("Trait '{name}' is undefined"),
                ));
            }
        }
        Ok(())
    }

    /// The map that children of `path` live in: the root map for an empty
    /// path, otherwise the component's `"components"` child (created on
    /// demand).
    fn graft_node(&mut self, path: &str) -> Result<&mut Map<String, Value>> {
        if path.is_empty() {
            return Ok(&mut self.components);
        }
        let component = path::find_component_mut(&mut self.components, path)?;
        if !matches!(component.get("components"), Some(Value::Object(_))) {
            component.insert("components".to_string(), Value::Object(Map::new()));
        }
        Ok(component
            .get_mut("components")
            .and_then(Value::as_object_mut)
            .unwrap())
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn new_component(traits: &[&str]) -> Value {
    let mut dict = Map::new();
    dict.insert(
        "traits".to_string(),
        Value::Array(traits.iter().map(|t| Value::String(t.to_string())).collect()),
    );
    Value::Object(dict)
}

fn minimal_role_of(definition: &Value) -> Result<UserRole> {
    match definition.get("minimalRole") {
        None => Ok(UserRole::User),
        Some(Value::String(role)) => UserRole::from_str(role),
        Some(_) => Err(Error::type_mismatch(
            domains::COMPONENTS,
            "minimalRole must be a string",
        )),
    }
}

fn find_state_definition<'a>(
    traits: &'a Map<String, Value>,
    state_property_name: &str,
) -> Option<&'a Value> {
    let (trait_name, prop) = state_property_name.split_once('.')?;
    if prop.contains('.') {
        return None;
    }
    traits.get(trait_name)?.get("state")?.get(prop)
}

fn remove_inaccessible_state(traits: &Map<String, Value>, component: &mut Map<String, Value>, role: UserRole) {
    if let Some(Value::Object(state)) = component.get_mut("state") {
        let mut empty_traits = Vec::new();
        for (trait_name, props) in state.iter_mut() {
            let Some(props) = props.as_object_mut() else {
                continue;
            };
            props.retain(|prop, _| {
                match find_state_definition(traits, &format!("{trait_name}.{prop}")) {
                    Some(definition) => {
                        minimal_role_of(definition).map_or(true, |minimal| minimal <= role)
                    }
                    // Undefined properties are left in place.
                    None => true,
                }
            });
            if props.is_empty() {
                empty_traits.push(trait_name.clone());
            }
        }
        for trait_name in empty_traits {
            state.remove(&trait_name);
        }
        if state.is_empty() {
            component.remove("state");
        }
    }

    if let Some(Value::Object(children)) = component.get_mut("components") {
        for child in children.values_mut() {
            match child {
                Value::Object(child) => remove_inaccessible_state(traits, child, role),
                Value::Array(items) => {
                    for item in items.iter_mut().filter_map(Value::as_object_mut) {
                        remove_inaccessible_state(traits, item, role);
                    }
                }
                _ => {}
            }
        }
    }
}

fn find_with_trait(components: &Map<String, Value>, trait_name: &str, prefix: &str) -> Option<String> {
    for (name, component) in components {
        match component {
            Value::Object(component) => {
                if let Some(path) =
                    find_with_trait_in(component, trait_name, &join_path(prefix, name))
                {
                    return Some(path);
                }
            }
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    if let Some(item) = item.as_object() {
                        let path = format!("{}[{}]", join_path(prefix, name), index);
                        if let Some(path) = find_with_trait_in(item, trait_name, &path) {
                            return Some(path);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn find_with_trait_in(
    component: &Map<String, Value>,
    trait_name: &str,
    path: &str,
) -> Option<String> {
    let declares = component
        .get("traits")
        .and_then(Value::as_array)
        .is_some_and(|traits| traits.iter().any(|t| t.as_str() == Some(trait_name)));
    if declares {
        return Some(path.to_string());
    }
    component
        .get("components")
        .and_then(Value::as_object)
        .and_then(|children| find_with_trait(children, trait_name, path))
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
