//! Error taxonomy
//!
//! Each kind propagates differently: frame and payload problems answer the
//! charge point with a `CallError` and keep the session alive; ownership
//! loss drains the session; store and bus hiccups are retried.

use serde_json::{json, Value};
use thiserror::Error;

// ── OCPP-J error codes ─────────────────────────────────────────

/// Error codes allowed in the third element of a `CallError` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcppErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl OcppErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::InternalError => "InternalError",
            Self::ProtocolError => "ProtocolError",
            Self::SecurityError => "SecurityError",
            Self::FormationViolation => "FormationViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            Self::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::GenericError => "GenericError",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NotImplemented" => Some(Self::NotImplemented),
            "NotSupported" => Some(Self::NotSupported),
            "InternalError" => Some(Self::InternalError),
            "ProtocolError" => Some(Self::ProtocolError),
            "SecurityError" => Some(Self::SecurityError),
            "FormationViolation" => Some(Self::FormationViolation),
            "PropertyConstraintViolation" => Some(Self::PropertyConstraintViolation),
            "OccurrenceConstraintViolation" => Some(Self::OccurrenceConstraintViolation),
            "TypeConstraintViolation" => Some(Self::TypeConstraintViolation),
            "GenericError" => Some(Self::GenericError),
            _ => None,
        }
    }
}

impl std::fmt::Display for OcppErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Payload violations ─────────────────────────────────────────

/// A payload that failed registry validation.
///
/// `field` names the offending property when known; it ends up in the
/// `errorDetails` object of the resulting `CallError`.
#[derive(Debug, Clone, Error)]
#[error("{code}: {description}")]
pub struct Violation {
    pub code: OcppErrorCode,
    pub description: String,
    pub field: Option<String>,
}

impl Violation {
    pub fn new(code: OcppErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            field: None,
        }
    }

    pub fn on_field(code: OcppErrorCode, field: &str, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            field: Some(field.to_string()),
        }
    }

    /// Build the `errorDetails` object for the wire.
    pub fn details(&self) -> Value {
        match &self.field {
            Some(field) => json!({ "field": field }),
            None => json!({}),
        }
    }
}

// ── Backend errors ─────────────────────────────────────────────

/// Connection-store failures. Transient by contract: a session never dies
/// because the store blinked, only because a renew definitively reported
/// the key as owned by someone else.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection store unavailable: {0}")]
    Unavailable(String),
}

/// Bus transport failures.
#[derive(Debug, Error)]
pub enum BusError {
    /// The producer/consumer could not reach the broker.
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    /// The producer queue stayed saturated past the bounded wait.
    #[error("publish timed out after bounded wait")]
    PublishTimeout,
    /// The consumer was asked to stop.
    #[error("bus source closed")]
    Closed,
}

/// Configuration problems that must refuse startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}
