//! In-memory config store

use std::cell::RefCell;
use std::collections::HashMap;

use weave_core::provider::ConfigStore;
use weave_core::{Error, Result};

/// Name-keyed blob store with an optional injected save failure.
pub struct MemoryConfigStore {
    blobs: RefCell<HashMap<String, String>>,
    fail_next_save: RefCell<bool>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self {
            blobs: RefCell::new(HashMap::new()),
            fail_next_save: RefCell::new(false),
        }
    }

    /// The next `save_settings` call reports a write failure.
    pub fn fail_next_save(&self) {
        *self.fail_next_save.borrow_mut() = true;
    }
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load_settings(&self, name: &str) -> Option<String> {
        self.blobs.borrow().get(name).cloned()
    }

    fn save_settings(&self, name: &str, value: &str) -> Result<()> {
        if std::mem::take(&mut *self.fail_next_save.borrow_mut()) {
            return Err(Error::invalid_state(
                weave_core::error::domains::CONFIG,
                "injected save failure",
            ));
        }
        self.blobs
            .borrow_mut()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}
