//! Downstream command message
//!
//! Wire shape consumed from the command topic. Field names are snake_case
//! on the wire, matching the producer contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub charge_point_id: String,
    pub command_name: String,
    pub message_id: String,
    pub payload: Value,
    #[serde(default)]
    pub timestamp: String,
}

impl Command {
    /// Decode a raw record payload, rejecting structurally unusable
    /// commands early (the action itself is checked against the registry
    /// later).
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let command: Command =
            serde_json::from_slice(bytes).map_err(|e| format!("invalid command JSON: {e}"))?;
        if command.charge_point_id.is_empty() {
            return Err("charge_point_id must be non-empty".to_string());
        }
        if command.command_name.is_empty() {
            return Err("command_name must be non-empty".to_string());
        }
        if !command.payload.is_object() {
            return Err("payload must be a JSON object".to_string());
        }
        Ok(command)
    }
}
