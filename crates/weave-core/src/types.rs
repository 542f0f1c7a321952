//! Core types shared across the control layer
//!
//! Newtypes and enums used throughout the crate, with string registries for
//! the JSON boundary.

use core::fmt;
use core::ops::{Add, Sub};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{domains, Error, ErrorCode, Result};

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Whole seconds since the epoch. Token timestamps have one-second
    /// resolution.
    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    pub fn saturating_sub(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs.as_millis() as u64)
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.saturating_sub(rhs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ----------------------------------------------------------------------------
// Roles and Scopes
// ----------------------------------------------------------------------------

/// Role required by a trait command or state property. Ordered by
/// privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Viewer,
    User,
    Manager,
    Owner,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Viewer => "viewer",
            UserRole::User => "user",
            UserRole::Manager => "manager",
            UserRole::Owner => "owner",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "viewer" => Ok(UserRole::Viewer),
            "user" => Ok(UserRole::User),
            "manager" => Ok(UserRole::Manager),
            "owner" => Ok(UserRole::Owner),
            other => Err(Error::new(
                domains::COMMANDS,
                ErrorCode::InvalidPropValue,
                format!("Unknown user role '{other}'"),
            )),
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication scope of a local client. `None` is an unauthenticated
/// peer; the remaining values mirror [`UserRole`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AuthScope {
    #[default]
    None,
    Viewer,
    User,
    Manager,
    Owner,
}

impl AuthScope {
    /// Wire number used inside access tokens.
    pub fn wire_value(&self) -> u8 {
        match self {
            AuthScope::None => 0,
            AuthScope::Viewer => 1,
            AuthScope::User => 2,
            AuthScope::Manager => 3,
            AuthScope::Owner => 4,
        }
    }

    pub fn from_wire_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(AuthScope::None),
            1 => Some(AuthScope::Viewer),
            2 => Some(AuthScope::User),
            3 => Some(AuthScope::Manager),
            4 => Some(AuthScope::Owner),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScope::None => "none",
            AuthScope::Viewer => "viewer",
            AuthScope::User => "user",
            AuthScope::Manager => "manager",
            AuthScope::Owner => "owner",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(AuthScope::None),
            "viewer" => Ok(AuthScope::Viewer),
            "user" => Ok(AuthScope::User),
            "manager" => Ok(AuthScope::Manager),
            "owner" => Ok(AuthScope::Owner),
            other => Err(Error::new(
                domains::AUTH,
                ErrorCode::InvalidPropValue,
                format!("Unknown auth scope '{other}'"),
            )),
        }
    }

    /// The command-dispatch role this scope is entitled to act as.
    pub fn to_user_role(&self) -> Option<UserRole> {
        match self {
            AuthScope::None => None,
            AuthScope::Viewer => Some(UserRole::Viewer),
            AuthScope::User => Some(UserRole::User),
            AuthScope::Manager => Some(UserRole::Manager),
            AuthScope::Owner => Some(UserRole::Owner),
        }
    }
}

impl fmt::Display for AuthScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity carried by an access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserInfo {
    scope: AuthScope,
    user_id: u64,
}

impl UserInfo {
    /// An unauthenticated scope carries no user identity.
    pub fn new(scope: AuthScope, user_id: u64) -> Self {
        let user_id = if scope == AuthScope::None { 0 } else { user_id };
        Self { scope, user_id }
    }

    pub fn scope(&self) -> AuthScope {
        self.scope
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }
}

// ----------------------------------------------------------------------------
// Root Client Token Owner
// ----------------------------------------------------------------------------

/// Which kind of peer currently holds the root client token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootClientTokenOwner {
    #[default]
    None,
    Client,
    Cloud,
}

impl RootClientTokenOwner {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootClientTokenOwner::None => "none",
            RootClientTokenOwner::Client => "client",
            RootClientTokenOwner::Cloud => "cloud",
        }
    }

    /// Wire number used inside root client tokens.
    pub fn wire_value(&self) -> u8 {
        match self {
            RootClientTokenOwner::None => 0,
            RootClientTokenOwner::Client => 1,
            RootClientTokenOwner::Cloud => 2,
        }
    }

    pub fn from_wire_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(RootClientTokenOwner::None),
            1 => Some(RootClientTokenOwner::Client),
            2 => Some(RootClientTokenOwner::Cloud),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// GCD State
// ----------------------------------------------------------------------------

/// Registration/connectivity status of the device as exposed to embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GcdState {
    /// Cloud credentials (client id / API key) are not configured.
    Unconfigured,
    /// Configured but not registered with the cloud.
    Unregistered,
    /// Registered; establishing or refreshing the cloud session.
    Connecting,
    Connected,
    /// Registered but currently unreachable.
    Disconnected,
    /// Registered but the refresh token was rejected; sync is disabled
    /// until settings change.
    InvalidCredentials,
}

impl GcdState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GcdState::Unconfigured => "unconfigured",
            GcdState::Unregistered => "unregistered",
            GcdState::Connecting => "connecting",
            GcdState::Connected => "connected",
            GcdState::Disconnected => "disconnected",
            GcdState::InvalidCredentials => "invalidCredentials",
        }
    }
}

// ----------------------------------------------------------------------------
// Pairing
// ----------------------------------------------------------------------------

/// Pairing confirmation modes a device may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PairingType {
    PinCode,
    EmbeddedCode,
}

// ----------------------------------------------------------------------------
// Registration Data
// ----------------------------------------------------------------------------

/// Input to [`crate::device::Device::register`]. Optional fields override
/// the corresponding settings for this registration only.
#[derive(Debug, Clone, Default)]
pub struct RegistrationData {
    pub ticket_id: String,
    pub oauth_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub api_key: Option<String>,
    pub service_url: Option<String>,
}

impl RegistrationData {
    pub fn with_ticket(ticket_id: impl Into<String>) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            ..Default::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
