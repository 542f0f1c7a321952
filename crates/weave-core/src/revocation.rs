//! Access revocation list
//!
//! A bounded list of `(user, app)` revocations persisted as an opaque blob
//! in the config store. The auth manager consults it when validating
//! access tokens.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{domains, Error, ErrorCode, Result};
use crate::provider::{Clock, ConfigStore, TaskRunner};
use crate::types::Timestamp;

/// Name of the revocation blob in the config store.
pub const REVOCATION_LIST_NAME: &str = "access_revocation_list";

/// Upper bound on stored revocations.
pub const REVOCATION_LIST_CAPACITY: usize = 1024;

pub type DoneCallback = Box<dyn FnOnce(Result<()>)>;

// ----------------------------------------------------------------------------
// Entries
// ----------------------------------------------------------------------------

/// Revokes every token for `(user_id, app_id)` issued before
/// `issued_before`. The entry itself lapses at `expiration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevocationEntry {
    #[serde(with = "base64_bytes")]
    pub user_id: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub app_id: Vec<u8>,
    pub issued_before: Timestamp,
    pub expiration: Timestamp,
}

mod base64_bytes {
    use base64::prelude::{Engine as _, BASE64_STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        BASE64_STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

struct Inner {
    store: Rc<dyn ConfigStore>,
    runner: Rc<dyn TaskRunner>,
    clock: Rc<dyn Clock>,
    entries: Vec<RevocationEntry>,
}

#[derive(Clone)]
pub struct AccessRevocationManager {
    inner: Rc<RefCell<Inner>>,
}

impl AccessRevocationManager {
    pub fn new(
        store: Rc<dyn ConfigStore>,
        runner: Rc<dyn TaskRunner>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let entries = store
            .load_settings(REVOCATION_LIST_NAME)
            .and_then(|blob| match serde_json::from_str(&blob) {
                Ok(entries) => Some(entries),
                Err(err) => {
                    warn!(%err, "stored revocation list is malformed; starting empty");
                    None
                }
            })
            .unwrap_or_default();
        Self {
            inner: Rc::new(RefCell::new(Inner {
                store,
                runner,
                clock,
                entries,
            })),
        }
    }

    pub fn capacity(&self) -> usize {
        REVOCATION_LIST_CAPACITY
    }

    pub fn entries(&self) -> Vec<RevocationEntry> {
        self.inner.borrow().entries.clone()
    }

    /// Insert a revocation. Lapsed entries are evicted first; a still-full
    /// list fails with `list_full`. The done callback is posted on the
    /// runner after persistence.
    pub fn block(&self, entry: RevocationEntry, done: DoneCallback) {
        let result = {
            let mut inner = self.inner.borrow_mut();
            let now = inner.clock.now();
            inner.entries.retain(|existing| existing.expiration >= now);
            if inner.entries.len() >= REVOCATION_LIST_CAPACITY {
                Err(Error::new(
                    domains::AUTH,
                    ErrorCode::ListFull,
                    "Revocation list is full",
                ))
            } else {
                // Refresh rather than duplicate an existing pair.
                inner
                    .entries
                    .retain(|existing| !(existing.user_id == entry.user_id && existing.app_id == entry.app_id));
                inner.entries.push(entry);
                inner.persist()
            }
        };
        self.inner
            .borrow()
            .runner
            .post(Box::new(move || done(result)));
    }

    /// Remove every revocation for `(user_id, app_id)`.
    pub fn unblock(&self, user_id: &[u8], app_id: &[u8], done: DoneCallback) {
        let result = {
            let mut inner = self.inner.borrow_mut();
            let before = inner.entries.len();
            inner
                .entries
                .retain(|existing| !(existing.user_id == user_id && existing.app_id == app_id));
            if inner.entries.len() != before {
                inner.persist()
            } else {
                Ok(())
            }
        };
        self.inner
            .borrow()
            .runner
            .post(Box::new(move || done(result)));
    }

    /// A credential for `(user_id, app_id)` issued at `issued_at` is
    /// revoked if a live entry covers that issue time.
    pub fn is_blocked(&self, user_id: &[u8], app_id: &[u8], issued_at: Timestamp) -> bool {
        let inner = self.inner.borrow();
        let now = inner.clock.now();
        inner.entries.iter().any(|entry| {
            entry.user_id == user_id
                && entry.app_id == app_id
                && entry.expiration >= now
                && entry.issued_before >= issued_at
        })
    }
}

impl Inner {
    fn persist(&self) -> Result<()> {
        let blob = serde_json::to_string(&self.entries)
            .map_err(|err| Error::invalid_state(domains::AUTH, err.to_string()))?;
        self.store.save_settings(REVOCATION_LIST_NAME, &blob)
    }
}

