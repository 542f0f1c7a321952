//! Command lifecycle: instances, the owning queue, and handler dispatch

mod instance;
mod queue;

pub use instance::{Command, CommandEvent, CommandObserver, CommandOrigin, CommandState, WeakCommand};
pub use queue::{
    CommandCallback, CommandHandler, CommandQueue, COMMAND_REMOVE_DELAY,
    DEFAULT_COMMAND_EXPIRATION,
};
