//! Weave Core
//!
//! On-device control layer of the weave IoT agent. The crate sits between
//! transport providers (HTTP, network, persistence — injected through the
//! [`provider`] traits) and user command handlers:
//!
//! - [`component`]: the typed capability model — traits, the component
//!   tree, schema-checked state, and the state-change journal.
//! - [`command`]: command instances with a small per-command state
//!   machine, and the owning queue that routes them to handlers.
//! - [`config`] / [`settings`]: typed settings with transactional
//!   mutation over an opaque persisted blob.
//! - [`auth`] / [`revocation`]: HMAC access tokens, the root-client-token
//!   claim/confirm handshake, and the revocation list.
//! - [`cloud`]: registration ticket exchange, OAuth token cache, and the
//!   command/state sync loop with retry and backoff.
//! - [`device`]: the façade composing all of the above.
//!
//! ## Concurrency
//!
//! Everything runs cooperatively on one externally provided
//! [`provider::TaskRunner`]; no two callbacks ever overlap, so the crate
//! uses `Rc`/`RefCell` handles and no locks. Nothing here is `Send`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use weave_core::{CloudOptions, Device, Providers, Settings};
//! # fn providers() -> Providers { unimplemented!() }
//!
//! let mut defaults = Settings::default();
//! defaults.name = "Lamp".into();
//! defaults.model_id = "AAAAA".into();
//!
//! let device = Device::new(defaults, CloudOptions::default(), providers());
//! device.add_trait_definitions_from_json(
//!     r#"{"onOff": {"commands": {"setConfig": {"minimalRole": "user",
//!        "parameters": {"state": {"type": "string"}}}}}}"#,
//! ).unwrap();
//! device.add_component("lamp", &["onOff"]).unwrap();
//! device.add_command_handler("lamp", "onOff.setConfig", Rc::new(|cmd| {
//!     if let Some(command) = cmd.upgrade() {
//!         command.complete(Default::default()).unwrap();
//!     }
//! }));
//! ```

pub mod auth;
pub mod cloud;
pub mod command;
pub mod component;
pub mod config;
pub mod device;
pub mod error;
pub mod path;
pub mod privet;
pub mod provider;
pub mod revocation;
pub mod settings;
pub mod state_queue;
pub mod types;
pub mod wifi;

mod handlers;

pub use auth::AuthManager;
pub use cloud::{CloudOptions, DeviceRegistration};
pub use command::{Command, CommandEvent, CommandOrigin, CommandState, WeakCommand};
pub use component::{ComponentManager, ComponentStateChange, StateSnapshot};
pub use config::{Config, Transaction};
pub use device::{Device, Providers};
pub use error::{Error, ErrorCode, Result};
pub use revocation::{AccessRevocationManager, RevocationEntry};
pub use settings::Settings;
pub use types::{
    AuthScope, GcdState, PairingType, RegistrationData, RootClientTokenOwner, Timestamp, UserInfo,
    UserRole,
};
