//! Error types for the weave control layer
//!
//! One structured error type is used throughout the crate. Schema and
//! routing errors are reported to the caller of the API that detected them;
//! cloud transport errors are recovered by the sync loop; contract
//! violations inside the device's own code abort the process.

use core::fmt;
use std::panic::Location;

// ----------------------------------------------------------------------------
// Error Codes
// ----------------------------------------------------------------------------

/// Machine-readable error categories surfaced by the control layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidState,
    PropertyMissing,
    InvalidPropValue,
    InvalidCommandName,
    TypeMismatch,
    AccessDenied,
    TraitNotSupported,
    UnroutedCommand,
    CommandDestroyed,
    CommandFailed,
    ObjectExpected,
    ListFull,
    TransportError,
    CloudError { http_status: u16 },
    InvalidCredentials,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::PropertyMissing => "property_missing",
            ErrorCode::InvalidPropValue => "invalid_prop_value",
            ErrorCode::InvalidCommandName => "invalid_command_name",
            ErrorCode::TypeMismatch => "type_mismatch",
            ErrorCode::AccessDenied => "access_denied",
            ErrorCode::TraitNotSupported => "trait_not_supported",
            ErrorCode::UnroutedCommand => "unrouted_command",
            ErrorCode::CommandDestroyed => "command_destroyed",
            ErrorCode::CommandFailed => "command_failed",
            ErrorCode::ObjectExpected => "object_expected",
            ErrorCode::ListFull => "list_full",
            ErrorCode::TransportError => "transport_error",
            ErrorCode::CloudError { .. } => "cloud_error",
            ErrorCode::InvalidCredentials => "invalid_credentials",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::CloudError { http_status } => {
                write!(f, "cloud_error({http_status})")
            }
            _ => f.write_str(self.as_str()),
        }
    }
}

// ----------------------------------------------------------------------------
// Error
// ----------------------------------------------------------------------------

/// A single error with domain, code, message, source location, and an
/// optional cause chain.
#[derive(Debug, thiserror::Error)]
#[error("[{domain}:{code}] {message}")]
pub struct Error {
    domain: &'static str,
    code: ErrorCode,
    message: String,
    location: &'static Location<'static>,
    #[source]
    caused_by: Option<Box<Error>>,
}

impl Error {
    #[track_caller]
    pub fn new(domain: &'static str, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            domain,
            code,
            message: message.into(),
            location: Location::caller(),
            caused_by: None,
        }
    }

    #[track_caller]
    pub fn with_cause(
        domain: &'static str,
        code: ErrorCode,
        message: impl Into<String>,
        cause: Error,
    ) -> Self {
        Self {
            domain,
            code,
            message: message.into(),
            location: Location::caller(),
            caused_by: Some(Box::new(cause)),
        }
    }

    pub fn domain(&self) -> &'static str {
        self.domain
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn caused_by(&self) -> Option<&Error> {
        self.caused_by.as_deref()
    }

    /// Serialize the error (and its cause chain) for command status
    /// payloads sent to the cloud and to local clients.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("domain".into(), self.domain.into());
        obj.insert("code".into(), self.code.as_str().into());
        obj.insert("message".into(), self.message.clone().into());
        if let ErrorCode::CloudError { http_status } = self.code {
            obj.insert("httpStatus".into(), http_status.into());
        }
        if let Some(cause) = &self.caused_by {
            obj.insert("causedBy".into(), cause.to_json());
        }
        serde_json::Value::Object(obj)
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            domain: self.domain,
            code: self.code,
            message: self.message.clone(),
            location: self.location,
            caused_by: self.caused_by.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Convenience Constructors
// ----------------------------------------------------------------------------

/// Error domains used by the crate.
pub mod domains {
    pub const COMMANDS: &str = "commands";
    pub const COMPONENTS: &str = "components";
    pub const CONFIG: &str = "config";
    pub const AUTH: &str = "auth";
    pub const CLOUD: &str = "cloud";
    pub const JSON: &str = "json";
}

impl Error {
    #[track_caller]
    pub fn invalid_state(domain: &'static str, message: impl Into<String>) -> Self {
        Self::new(domain, ErrorCode::InvalidState, message)
    }

    #[track_caller]
    pub fn property_missing(domain: &'static str, message: impl Into<String>) -> Self {
        Self::new(domain, ErrorCode::PropertyMissing, message)
    }

    #[track_caller]
    pub fn type_mismatch(domain: &'static str, message: impl Into<String>) -> Self {
        Self::new(domain, ErrorCode::TypeMismatch, message)
    }

    #[track_caller]
    pub fn object_expected(message: impl Into<String>) -> Self {
        Self::new(domains::JSON, ErrorCode::ObjectExpected, message)
    }

    #[track_caller]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(domains::CLOUD, ErrorCode::TransportError, message)
    }

    #[track_caller]
    pub fn cloud(http_status: u16, message: impl Into<String>) -> Self {
        Self::new(
            domains::CLOUD,
            ErrorCode::CloudError { http_status },
            message,
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_chain_is_preserved() {
        let inner = Error::object_expected("parameters must be an object");
        let outer = Error::with_cause(
            domains::COMMANDS,
            ErrorCode::CommandFailed,
            "failed to validate command",
            inner,
        );
        assert_eq!(outer.code(), ErrorCode::CommandFailed);
        let cause = outer.caused_by().unwrap();
        assert_eq!(cause.code(), ErrorCode::ObjectExpected);
        assert!(cause.caused_by().is_none());
    }

    #[test]
    fn json_form_carries_http_status() {
        let err = Error::cloud(503, "service unavailable");
        let json = err.to_json();
        assert_eq!(json["code"], "cloud_error");
        assert_eq!(json["httpStatus"], 503);
    }

    #[test]
    fn location_points_at_constructor_caller() {
        let err = Error::invalid_state(domains::COMMANDS, "nope");
        assert!(err.location().file().ends_with("error.rs"));
    }
}
