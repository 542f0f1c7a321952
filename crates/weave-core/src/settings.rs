//! Typed device settings
//!
//! The settings record round-trips through the opaque JSON blob handed to
//! the config store. Fields absent from a stored blob keep their defaults.

use serde::{Deserialize, Serialize};

use crate::types::{AuthScope, PairingType, RootClientTokenOwner};

// ----------------------------------------------------------------------------
// Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Cloud identity.
    pub client_id: String,
    pub client_secret: String,
    pub api_key: String,
    pub oauth_url: String,
    pub service_url: String,

    // Device description.
    pub name: String,
    pub description: String,
    pub location: String,
    pub model_id: String,
    pub oem_name: String,
    pub firmware_version: String,

    // Local access policy.
    pub local_anonymous_access_role: AuthScope,
    pub local_discovery_enabled: bool,
    pub local_pairing_enabled: bool,
    pub local_access_enabled: bool,
    pub pairing_modes: Vec<PairingType>,
    pub embedded_code: String,

    // Device credentials.
    #[serde(with = "base64_bytes")]
    pub secret: Vec<u8>,
    pub root_client_token_owner: RootClientTokenOwner,

    // Connectivity and registration state.
    pub last_configured_ssid: String,
    pub device_id: String,
    pub refresh_token: String,
    pub robot_account: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_key: String::new(),
            oauth_url: String::new(),
            service_url: String::new(),
            name: String::new(),
            description: String::new(),
            location: String::new(),
            model_id: String::new(),
            oem_name: String::new(),
            firmware_version: String::new(),
            local_anonymous_access_role: AuthScope::Viewer,
            local_discovery_enabled: true,
            local_pairing_enabled: true,
            local_access_enabled: true,
            pairing_modes: vec![PairingType::PinCode],
            embedded_code: String::new(),
            secret: Vec::new(),
            root_client_token_owner: RootClientTokenOwner::None,
            last_configured_ssid: String::new(),
            device_id: String::new(),
            refresh_token: String::new(),
            robot_account: String::new(),
        }
    }
}

impl Settings {
    /// Cloud settings are complete enough to attempt registration.
    pub fn is_cloud_configured(&self) -> bool {
        !self.client_id.is_empty()
            && !self.api_key.is_empty()
            && !self.oauth_url.is_empty()
            && !self.service_url.is_empty()
    }

    /// The device holds cloud credentials from a past registration.
    pub fn is_registered(&self) -> bool {
        !self.device_id.is_empty() && !self.refresh_token.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Secret Encoding
// ----------------------------------------------------------------------------

/// Byte fields persist as base64 strings inside the settings blob.
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
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut settings = Settings::default();
        settings.name = "TEST_NAME".into();
        settings.secret = vec![1, 2, 3, 255];
        settings.local_anonymous_access_role = AuthScope::None;
        settings.root_client_token_owner = RootClientTokenOwner::Cloud;

        let blob = serde_json::to_string(&settings).unwrap();
        let restored: Settings = serde_json::from_str(&blob).unwrap();
        assert_eq!(restored, settings);
    }

    #[test]
    fn absent_fields_keep_defaults() {
        let restored: Settings =
            serde_json::from_str(r#"{"last_configured_ssid": "TEST_ssid"}"#).unwrap();
        assert_eq!(restored.last_configured_ssid, "TEST_ssid");
        assert!(restored.local_discovery_enabled);
        assert_eq!(restored.local_anonymous_access_role, AuthScope::Viewer);
    }

    #[test]
    fn registration_predicates() {
        let mut settings = Settings::default();
        assert!(!settings.is_cloud_configured());
        assert!(!settings.is_registered());
        settings.client_id = "c".into();
        settings.api_key = "k".into();
        settings.oauth_url = "https://oauth".into();
        settings.service_url = "https://svc".into();
        assert!(settings.is_cloud_configured());
        settings.device_id = "CLOUD_ID".into();
        settings.refresh_token = "REFRESH".into();
        assert!(settings.is_registered());
    }
}
