//! Local authentication: device secret, access tokens, and the root
//! client token claim/confirm handshake
//!
//! Access tokens are HMAC-authenticated and opaque to peers:
//!
//! ```text
//! payload = "{scope}:{user_id}:{issued_at_s}"        (ASCII decimals)
//! token   = HMAC-SHA256(secret, payload) || payload
//! ```
//!
//! The root client token is a fixed 42-byte record minted under the device
//! secret. A claim mints the token under a fresh pending secret; the
//! matching confirm adopts that secret as the device secret, so every
//! claim/confirm cycle rotates local credentials.

use std::cell::RefCell;
use std::rc::Rc;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{domains, Error, Result};
use crate::provider::Clock;
use crate::revocation::AccessRevocationManager;
use crate::types::{AuthScope, RootClientTokenOwner, Timestamp, UserInfo};

type HmacSha256 = Hmac<Sha256>;

/// Minimum (and generated) secret length.
pub const SECRET_SIZE: usize = 32;

/// Pending root-token claims kept before the oldest is evicted.
pub const MAX_PENDING_CLAIMS: usize = 16;

const ROOT_TOKEN_VERSION: u8 = 2;
const ROOT_TOKEN_PREFIX_SIZE: usize = 10;
const ROOT_TOKEN_SIZE: usize = ROOT_TOKEN_PREFIX_SIZE + 32;

// ----------------------------------------------------------------------------
// Auth Manager
// ----------------------------------------------------------------------------

struct Inner {
    config: Option<Config>,
    secret: Vec<u8>,
    certificate_fingerprint: Vec<u8>,
    clock: Rc<dyn Clock>,
    revocation: Option<AccessRevocationManager>,
    /// Owner mirror used when no config is attached.
    root_client_token_owner: RootClientTokenOwner,
    pending_claims: Vec<(RootClientTokenOwner, Vec<u8>)>,
}

#[derive(Clone)]
pub struct AuthManager {
    inner: Rc<RefCell<Inner>>,
}

impl AuthManager {
    /// Production constructor: loads the persisted secret (generating and
    /// persisting a fresh one when absent or too short).
    pub fn new(
        config: Config,
        revocation: Option<AccessRevocationManager>,
        certificate_fingerprint: Vec<u8>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let settings = config.settings();
        let secret = if settings.secret.len() >= SECRET_SIZE {
            settings.secret.clone()
        } else {
            let secret = generate_secret();
            info!("generated new device secret");
            let mut change = config.transaction();
            change.set_secret(secret.clone());
            change.commit();
            secret
        };
        debug!(
            fingerprint = %hex::encode(&certificate_fingerprint),
            "auth manager ready"
        );
        Self {
            inner: Rc::new(RefCell::new(Inner {
                config: Some(config),
                secret,
                certificate_fingerprint,
                clock,
                revocation,
                root_client_token_owner: settings.root_client_token_owner,
                pending_claims: Vec::new(),
            })),
        }
    }

    /// Test constructor with an explicit secret and no persistence.
    pub fn with_secret(
        secret: Vec<u8>,
        certificate_fingerprint: Vec<u8>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let secret = if secret.len() >= SECRET_SIZE {
            secret
        } else {
            generate_secret()
        };
        Self {
            inner: Rc::new(RefCell::new(Inner {
                config: None,
                secret,
                certificate_fingerprint,
                clock,
                revocation: None,
                root_client_token_owner: RootClientTokenOwner::None,
                pending_claims: Vec::new(),
            })),
        }
    }

    pub fn secret(&self) -> Vec<u8> {
        self.inner.borrow().secret.clone()
    }

    pub fn certificate_fingerprint(&self) -> Vec<u8> {
        self.inner.borrow().certificate_fingerprint.clone()
    }

    // ------------------------------------------------------------------
    // Access Tokens
    // ------------------------------------------------------------------

    /// Deterministic for a given (secret, user, clock second).
    pub fn create_access_token(&self, user: &UserInfo) -> Vec<u8> {
        let inner = self.inner.borrow();
        let payload = format!(
            "{}:{}:{}",
            user.scope().wire_value(),
            user.user_id(),
            inner.clock.now().as_secs()
        );
        let mut token = hmac_sha256(&inner.secret, payload.as_bytes()).to_vec();
        token.extend_from_slice(payload.as_bytes());
        token
    }

    /// Verify and decode an access token minted by this device. Returns
    /// `None` when the HMAC does not verify under the current secret, the
    /// payload is malformed, or the `(user, issue time)` has been revoked.
    pub fn parse_access_token(&self, token: &[u8]) -> Option<(UserInfo, Timestamp)> {
        let inner = self.inner.borrow();
        if token.len() <= 32 {
            return None;
        }
        let (tag, payload) = token.split_at(32);
        let mut mac = HmacSha256::new_from_slice(&inner.secret).expect("any key size is valid");
        mac.update(payload);
        if mac.verify_slice(tag).is_err() {
            return None;
        }

        let payload = std::str::from_utf8(payload).ok()?;
        let mut parts = payload.splitn(3, ':');
        let scope = AuthScope::from_wire_value(parts.next()?.parse().ok()?)?;
        let user_id: u64 = parts.next()?.parse().ok()?;
        let issued_at = Timestamp::from_secs(parts.next()?.parse().ok()?);

        if let Some(revocation) = &inner.revocation {
            if revocation.is_blocked(&user_id.to_be_bytes(), &[], issued_at) {
                return None;
            }
        }
        Some((UserInfo::new(scope, user_id), issued_at))
    }

    // ------------------------------------------------------------------
    // Root Client Token
    // ------------------------------------------------------------------

    /// The current root client token, minted under the device secret.
    pub fn root_client_auth_token(&self) -> Vec<u8> {
        let inner = self.inner.borrow();
        mint_root_token(&inner.secret, inner.clock.now())
    }

    /// True iff the token was minted by this device under its current
    /// secret.
    pub fn is_valid_auth_token(&self, token: &[u8]) -> bool {
        let inner = self.inner.borrow();
        verify_root_token(&inner.secret, token).is_some()
    }

    /// Mint a root token under a fresh pending secret for `claimer`. The
    /// token becomes valid only once confirmed. Claim precedence: the
    /// cloud may always claim; a local client only when nobody holds the
    /// token yet. Claiming for `none` is a programming error.
    pub fn claim_root_client_auth_token(
        &self,
        claimer: RootClientTokenOwner,
    ) -> Result<Vec<u8>> {
        assert!(
            claimer != RootClientTokenOwner::None,
            "root client token cannot be claimed for 'none'"
        );
        let mut inner = self.inner.borrow_mut();
        let current = match &inner.config {
            Some(config) => config.settings().root_client_token_owner,
            None => inner.root_client_token_owner,
        };
        let allowed = match claimer {
            RootClientTokenOwner::Cloud => true,
            RootClientTokenOwner::Client => current == RootClientTokenOwner::None,
            RootClientTokenOwner::None => unreachable!(),
        };
        if !allowed {
            return Err(Error::invalid_state(
                domains::AUTH,
                format!("Root client token already owned by '{}'", current.as_str()),
            ));
        }

        let secret = generate_secret();
        let token = mint_root_token(&secret, inner.clock.now());
        if inner.pending_claims.len() >= MAX_PENDING_CLAIMS {
            inner.pending_claims.remove(0);
        }
        inner.pending_claims.push((claimer, secret));
        Ok(token)
    }

    /// Complete a claim: adopt the pending secret as the device secret and
    /// record the new owner. Re-confirming an already valid token succeeds;
    /// an evicted or unknown token fails.
    pub fn confirm_client_auth_token(&self, token: &[u8]) -> bool {
        if self.is_valid_auth_token(token) {
            return true;
        }
        let adopted = {
            let mut inner = self.inner.borrow_mut();
            let matched = inner
                .pending_claims
                .iter()
                .position(|(_, secret)| verify_root_token(secret, token).is_some());
            matched.map(|index| {
                let (owner, secret) = inner.pending_claims[index].clone();
                inner.pending_claims.clear();
                inner.secret = secret.clone();
                inner.root_client_token_owner = owner;
                (owner, secret, inner.config.clone())
            })
        };
        let Some((owner, secret, config)) = adopted else {
            return false;
        };
        if let Some(config) = config {
            let mut change = config.transaction();
            change.set_secret(secret);
            change.set_root_client_token_owner(owner);
            change.commit();
        }
        info!(owner = owner.as_str(), "root client token confirmed");
        true
    }
}

// ----------------------------------------------------------------------------
// Token Primitives
// ----------------------------------------------------------------------------

fn hmac_sha256(secret: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("any key size is valid");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn generate_secret() -> Vec<u8> {
    let mut secret = vec![0u8; SECRET_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    secret
}

/// `version || scope || issued_at_s (u64 BE) || HMAC-SHA256(secret, prefix)`
fn mint_root_token(secret: &[u8], issued_at: Timestamp) -> Vec<u8> {
    let mut token = Vec::with_capacity(ROOT_TOKEN_SIZE);
    token.push(ROOT_TOKEN_VERSION);
    token.push(AuthScope::Owner.wire_value());
    token.extend_from_slice(&issued_at.as_secs().to_be_bytes());
    let tag = hmac_sha256(secret, &token);
    token.extend_from_slice(&tag);
    token
}

fn verify_root_token(secret: &[u8], token: &[u8]) -> Option<(AuthScope, Timestamp)> {
    if token.len() != ROOT_TOKEN_SIZE || token[0] != ROOT_TOKEN_VERSION {
        return None;
    }
    let (prefix, tag) = token.split_at(ROOT_TOKEN_PREFIX_SIZE);
    let mut mac = HmacSha256::new_from_slice(secret).expect("any key size is valid");
    mac.update(prefix);
    mac.verify_slice(tag).ok()?;
    let scope = AuthScope::from_wire_value(prefix[1])?;
    let secs = u64::from_be_bytes(prefix[2..10].try_into().expect("prefix is 10 bytes"));
    Some((scope, Timestamp::from_secs(secs)))
}
