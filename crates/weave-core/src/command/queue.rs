//! Owning queue of live commands
//!
//! Routes newly added commands to registered handlers, delays removal of
//! finished commands so observers can read their final state, and expires
//! commands that were never picked up.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::command::instance::{Command, WeakCommand};
use crate::provider::{Clock, TaskRunner};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Grace period between a terminal transition and removal from the queue.
pub const COMMAND_REMOVE_DELAY: Duration = Duration::from_secs(5);

/// Commands not expired explicitly die this long after creation.
pub const DEFAULT_COMMAND_EXPIRATION: Duration = Duration::from_secs(3600);

/// Cadence of the expiry sweep while commands are queued.
const EXPIRATION_SWEEP_PERIOD: Duration = Duration::from_secs(10);

pub type CommandCallback = Rc<dyn Fn(&Command)>;
pub type CommandHandler = Rc<dyn Fn(WeakCommand)>;

// ----------------------------------------------------------------------------
// Command Queue
// ----------------------------------------------------------------------------

struct Inner {
    runner: Rc<dyn TaskRunner>,
    clock: Rc<dyn Clock>,
    commands: HashMap<String, Command>,
    on_command_added: Vec<CommandCallback>,
    on_command_removed: Vec<CommandCallback>,
    handlers: HashMap<(String, String), CommandHandler>,
    sweep_scheduled: bool,
}

/// Cheap-to-clone handle; the queue owns every live command.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Rc<RefCell<Inner>>,
}

impl CommandQueue {
    pub fn new(runner: Rc<dyn TaskRunner>, clock: Rc<dyn Clock>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                runner,
                clock,
                commands: HashMap::new(),
                on_command_added: Vec::new(),
                on_command_removed: Vec::new(),
                handlers: HashMap::new(),
                sweep_scheduled: false,
            })),
        }
    }

    pub fn add_command_added_callback(&self, callback: CommandCallback) {
        self.inner.borrow_mut().on_command_added.push(callback);
    }

    pub fn add_command_removed_callback(&self, callback: CommandCallback) {
        self.inner.borrow_mut().on_command_removed.push(callback);
    }

    /// Register a handler for `(component_path, command_name)`. Empty
    /// strings widen the match: `(path, "")` handles every command on the
    /// component, `("", "")` is the global default.
    pub fn add_command_handler(
        &self,
        component_path: impl Into<String>,
        command_name: impl Into<String>,
        handler: CommandHandler,
    ) {
        let key = (component_path.into(), command_name.into());
        let previous = self.inner.borrow_mut().handlers.insert(key.clone(), handler);
        assert!(
            previous.is_none(),
            "duplicate command handler for '{}' on component '{}'",
            key.1,
            key.0
        );
    }

    /// Take ownership of a command, notify the added callbacks, and
    /// dispatch it to the best-matching handler.
    pub fn add(&self, command: Command) {
        let id = command.id();
        let (callbacks, handler) = {
            let mut inner = self.inner.borrow_mut();
            assert!(
                !inner.commands.contains_key(&id),
                "duplicate command id '{id}'"
            );

            if command.expiration().is_none() {
                command.set_expiration(inner.clock.now() + DEFAULT_COMMAND_EXPIRATION);
            }

            let weak_inner = Rc::downgrade(&self.inner);
            command.set_remover(Box::new(move |id: &str| {
                Self::schedule_remove(&weak_inner, id.to_string());
            }));

            let handler = inner
                .handlers
                .get(&(command.component_path(), command.name()))
                .or_else(|| inner.handlers.get(&(command.component_path(), String::new())))
                .or_else(|| inner.handlers.get(&(String::new(), String::new())))
                .cloned();

            inner.commands.insert(id.clone(), command.clone());

            if !inner.sweep_scheduled {
                inner.sweep_scheduled = true;
                let weak_inner = Rc::downgrade(&self.inner);
                inner.runner.post_delayed(
                    EXPIRATION_SWEEP_PERIOD,
                    Box::new(move || Self::sweep(&weak_inner)),
                );
            }

            (inner.on_command_added.clone(), handler)
        };

        debug!(id = %id, name = %command.name(), "command added");
        for callback in callbacks {
            callback(&command);
        }
        match handler {
            Some(handler) => handler(command.downgrade()),
            None => warn!(name = %command.name(), "no handler for command"),
        }
    }

    pub fn find(&self, id: &str) -> Option<Command> {
        self.inner.borrow().commands.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().commands.is_empty()
    }

    fn schedule_remove(weak_inner: &Weak<RefCell<Inner>>, id: String) {
        let Some(inner) = weak_inner.upgrade() else {
            return;
        };
        let weak_inner = weak_inner.clone();
        inner.borrow().runner.post_delayed(
            COMMAND_REMOVE_DELAY,
            Box::new(move || Self::remove(&weak_inner, &id)),
        );
    }

    fn remove(weak_inner: &Weak<RefCell<Inner>>, id: &str) {
        let Some(inner) = weak_inner.upgrade() else {
            return;
        };
        let (removed, callbacks) = {
            let mut inner = inner.borrow_mut();
            let removed = inner.commands.remove(id);
            (removed, inner.on_command_removed.clone())
        };
        if let Some(command) = removed {
            debug!(id = %id, "command removed");
            for callback in callbacks {
                callback(&command);
            }
            // Last owning reference drops here; observers get Destroyed.
        }
    }

    /// Expire commands whose deadline passed. Commands with equal
    /// deadlines expire in id order, numerically where ids are numeric.
    fn sweep(weak_inner: &Weak<RefCell<Inner>>) {
        let Some(inner_rc) = weak_inner.upgrade() else {
            return;
        };
        let mut expired: Vec<Command> = {
            let inner = inner_rc.borrow();
            let now = inner.clock.now();
            inner
                .commands
                .values()
                .filter(|cmd| !cmd.state().is_terminal())
                .filter(|cmd| cmd.expiration().is_some_and(|exp| exp <= now))
                .cloned()
                .collect()
        };
        expired.sort_by(|a, b| {
            (a.expiration(), id_sort_key(&a.id())).cmp(&(b.expiration(), id_sort_key(&b.id())))
        });

        for command in expired {
            let id = command.id();
            warn!(id = %id, name = %command.name(), "command expired");
            if let Err(err) = command.mark_expired() {
                debug!(id = %id, %err, "expiry raced a terminal transition");
            }
            Self::remove(weak_inner, &id);
        }

        let mut inner = inner_rc.borrow_mut();
        if inner.commands.is_empty() {
            inner.sweep_scheduled = false;
        } else {
            let weak_inner = weak_inner.clone();
            inner.runner.post_delayed(
                EXPIRATION_SWEEP_PERIOD,
                Box::new(move || Self::sweep(&weak_inner)),
            );
        }
    }
}

/// Numeric ids order numerically; everything else falls back to
/// lexicographic order after the numeric block.
fn id_sort_key(id: &str) -> (u8, u64, String) {
    match id.parse::<u64>() {
        Ok(n) => (0, n, String::new()),
        Err(_) => (1, 0, id.to_string()),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
