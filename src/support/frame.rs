//! OCPP-J message framing
//!
//! Implements the OCPP-J (JSON over WebSocket) transport framing. The
//! framing is identical across OCPP versions:
//!
//! - **Call**       `[2, "<messageId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<messageId>", {<payload>}]`
//! - **CallError**  `[4, "<messageId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`

use serde_json::Value;
use thiserror::Error;

use super::errors::OcppErrorCode;

// ── Message-type constants ─────────────────────────────────────

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

/// Message IDs on the wire are capped at 36 characters (a UUID).
const MAX_MESSAGE_ID_LEN: usize = 36;

/// Default ceiling for a single text message (1 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

// ── OcppFrame ──────────────────────────────────────────────────

/// A parsed OCPP-J frame (version-agnostic transport envelope).
#[derive(Debug, Clone, PartialEq)]
pub enum OcppFrame {
    /// `[2, messageId, action, payload]`
    Call {
        message_id: String,
        action: String,
        payload: Value,
    },
    /// `[3, messageId, payload]`
    CallResult { message_id: String, payload: Value },
    /// `[4, messageId, errorCode, errorDescription, errorDetails]`
    CallError {
        message_id: String,
        code: OcppErrorCode,
        description: String,
        details: Value,
    },
}

impl OcppFrame {
    // ── Decoding ───────────────────────────────────────────

    /// Decode a raw JSON text into an `OcppFrame`.
    ///
    /// `max_bytes` bounds the input; oversize text fails before any parse
    /// work happens.
    pub fn decode(text: &str, max_bytes: usize) -> Result<Self, FrameDecodeError> {
        if text.len() > max_bytes {
            return Err(FrameDecodeError::Oversize {
                size: text.len(),
                limit: max_bytes,
            });
        }

        let arr: Vec<Value> = serde_json::from_str(text)
            .map_err(|e| FrameDecodeError::InvalidJson(e.to_string()))?;

        // Call is 4 elements, CallResult 3, CallError 5 (details may be omitted).
        if !(3..=5).contains(&arr.len()) {
            return Err(FrameDecodeError::WrongLength(arr.len()));
        }

        let msg_type = arr[0].as_u64().ok_or(FrameDecodeError::InvalidMessageType)?;
        let message_id = Self::decode_message_id(&arr)?;

        match msg_type {
            MSG_TYPE_CALL => Self::decode_call(message_id, &arr),
            MSG_TYPE_CALL_RESULT => Self::decode_call_result(message_id, &arr),
            MSG_TYPE_CALL_ERROR => Self::decode_call_error(message_id, &arr),
            other => Err(FrameDecodeError::UnknownMessageType {
                message_id: Some(message_id),
                msg_type: other,
            }),
        }
    }

    fn decode_message_id(arr: &[Value]) -> Result<String, FrameDecodeError> {
        let id = arr[1]
            .as_str()
            .ok_or(FrameDecodeError::FieldTypeMismatch("messageId must be a string"))?;
        if id.is_empty() {
            return Err(FrameDecodeError::FieldTypeMismatch("messageId must be non-empty"));
        }
        if id.len() > MAX_MESSAGE_ID_LEN {
            return Err(FrameDecodeError::MessageIdTooLong(id.len()));
        }
        Ok(id.to_string())
    }

    fn decode_call(message_id: String, arr: &[Value]) -> Result<Self, FrameDecodeError> {
        if arr.len() != 4 {
            return Err(FrameDecodeError::MissingFields {
                message_id: Some(message_id),
                expected: 4,
                got: arr.len(),
            });
        }

        let action = arr[2]
            .as_str()
            .ok_or(FrameDecodeError::FieldTypeMismatch("action must be a string"))?;
        if action.is_empty() {
            return Err(FrameDecodeError::FieldTypeMismatch("action must be non-empty"));
        }
        if !arr[3].is_object() {
            return Err(FrameDecodeError::PayloadNotObject {
                message_id: Some(message_id),
            });
        }

        Ok(Self::Call {
            message_id,
            action: action.to_string(),
            payload: arr[3].clone(),
        })
    }

    fn decode_call_result(message_id: String, arr: &[Value]) -> Result<Self, FrameDecodeError> {
        if arr.len() != 3 {
            return Err(FrameDecodeError::MissingFields {
                message_id: Some(message_id),
                expected: 3,
                got: arr.len(),
            });
        }
        if !arr[2].is_object() {
            return Err(FrameDecodeError::PayloadNotObject {
                message_id: Some(message_id),
            });
        }

        Ok(Self::CallResult {
            message_id,
            payload: arr[2].clone(),
        })
    }

    fn decode_call_error(message_id: String, arr: &[Value]) -> Result<Self, FrameDecodeError> {
        // The trailing details object may be omitted by lenient stations.
        if arr.len() < 4 {
            return Err(FrameDecodeError::MissingFields {
                message_id: Some(message_id),
                expected: 5,
                got: arr.len(),
            });
        }

        let code_str = arr[2]
            .as_str()
            .ok_or(FrameDecodeError::FieldTypeMismatch("errorCode must be a string"))?;
        let code = OcppErrorCode::parse(code_str)
            .ok_or_else(|| FrameDecodeError::UnknownErrorCode(code_str.to_string()))?;
        let description = arr[3]
            .as_str()
            .ok_or(FrameDecodeError::FieldTypeMismatch("errorDescription must be a string"))?
            .to_string();
        let details = match arr.get(4) {
            Some(v) if v.is_object() => v.clone(),
            Some(_) => {
                return Err(FrameDecodeError::PayloadNotObject {
                    message_id: Some(message_id),
                })
            }
            None => Value::Object(Default::default()),
        };

        Ok(Self::CallError {
            message_id,
            code,
            description,
            details,
        })
    }

    // ── Encoding ───────────────────────────────────────────

    /// Serialize this frame to a JSON string.
    pub fn encode(&self) -> String {
        let arr: Value = match self {
            Self::Call {
                message_id,
                action,
                payload,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL.into()),
                Value::String(message_id.clone()),
                Value::String(action.clone()),
                payload.clone(),
            ]),

            Self::CallResult { message_id, payload } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_RESULT.into()),
                Value::String(message_id.clone()),
                payload.clone(),
            ]),

            Self::CallError {
                message_id,
                code,
                description,
                details,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_ERROR.into()),
                Value::String(message_id.clone()),
                Value::String(code.as_str().to_string()),
                Value::String(description.clone()),
                details.clone(),
            ]),
        };

        // serde_json::to_string on a Value never fails
        serde_json::to_string(&arr).unwrap()
    }

    // ── Helpers ────────────────────────────────────────────

    /// Get the message ID common to all three variants.
    pub fn message_id(&self) -> &str {
        match self {
            Self::Call { message_id, .. }
            | Self::CallResult { message_id, .. }
            | Self::CallError { message_id, .. } => message_id,
        }
    }

    pub fn call(
        message_id: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::Call {
            message_id: message_id.into(),
            action: action.into(),
            payload,
        }
    }

    pub fn result(message_id: impl Into<String>, payload: Value) -> Self {
        Self::CallResult {
            message_id: message_id.into(),
            payload,
        }
    }

    /// Create a `CallError` answering the given message ID.
    pub fn error(
        message_id: impl Into<String>,
        code: OcppErrorCode,
        description: impl Into<String>,
        details: Value,
    ) -> Self {
        Self::CallError {
            message_id: message_id.into(),
            code,
            description: description.into(),
            details,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call { .. })
    }
}

// ── Errors ─────────────────────────────────────────────────────

/// Errors raised while decoding an OCPP-J frame.
///
/// Where the message ID could still be extracted it is carried along so the
/// `CallError` answer can reference the offending call.
#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("message of {size} bytes exceeds limit of {limit}")]
    Oversize { size: usize, limit: usize },
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("OCPP message must be an array of 3 or 4 elements, got {0}")]
    WrongLength(usize),
    #[error("message type is not an integer")]
    InvalidMessageType,
    #[error("unknown message type: {msg_type}")]
    UnknownMessageType {
        message_id: Option<String>,
        msg_type: u64,
    },
    #[error("message ID of {0} characters exceeds 36")]
    MessageIdTooLong(usize),
    #[error("expected {expected} elements, got {got}")]
    MissingFields {
        message_id: Option<String>,
        expected: usize,
        got: usize,
    },
    #[error("payload must be a JSON object")]
    PayloadNotObject { message_id: Option<String> },
    #[error("unknown error code: {0}")]
    UnknownErrorCode(String),
    #[error("field type mismatch: {0}")]
    FieldTypeMismatch(&'static str),
}

impl FrameDecodeError {
    /// Message ID of the offending frame, when one could be recovered.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::UnknownMessageType { message_id, .. }
            | Self::MissingFields { message_id, .. }
            | Self::PayloadNotObject { message_id } => message_id.as_deref(),
            _ => None,
        }
    }
}
