//! Payload registry
//!
//! One [`ActionSpec`] per OCPP 1.6 action: which direction it travels,
//! which request fields are required, and how request/response payloads
//! are validated. The handler routes by action string; everything the
//! registry rejects turns into the matching `CallError`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::domain::ConnectorStatus;
use crate::support::errors::{OcppErrorCode, Violation};

use super::payloads::{self, constrained, materialize, require_fields, require_object};

// ── Direction ──────────────────────────────────────────────────

/// Which side initiates the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Call originates at the charge point.
    FromChargePoint,
    /// Call originates at the gateway (a downstream command).
    ToChargePoint,
    /// Both sides may initiate (DataTransfer).
    Both,
}

// ── ActionSpec ─────────────────────────────────────────────────

type CheckFn = fn(&Value) -> Result<(), Violation>;

/// Validation contract for one action.
pub struct ActionSpec {
    pub action: &'static str,
    pub direction: Direction,
    required_request: &'static [&'static str],
    request_check: CheckFn,
    required_response: &'static [&'static str],
    response_check: CheckFn,
}

impl ActionSpec {
    pub fn validate_request(&self, payload: &Value) -> Result<(), Violation> {
        let obj = require_object(payload)?;
        require_fields(obj, self.required_request)?;
        (self.request_check)(payload)
    }

    pub fn validate_response(&self, payload: &Value) -> Result<(), Violation> {
        let obj = require_object(payload)?;
        require_fields(obj, self.required_response)?;
        (self.response_check)(payload)
    }
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Unknown action: `NotImplemented` towards charge points,
    /// "unsupported action" for bus commands.
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error(transparent)]
    Invalid(#[from] Violation),
}

// ── Request checks ─────────────────────────────────────────────

fn no_check(_: &Value) -> Result<(), Violation> {
    Ok(())
}

fn check_boot_notification(v: &Value) -> Result<(), Violation> {
    constrained(materialize::<payloads::BootNotificationRequest>(v)?).map(|_| ())
}

fn check_status_notification(v: &Value) -> Result<(), Violation> {
    let req = materialize::<payloads::StatusNotificationRequest>(v)?;
    if ConnectorStatus::parse(&req.status).is_none() {
        return Err(Violation::on_field(
            OcppErrorCode::PropertyConstraintViolation,
            "status",
            format!("{} is not a connector status", req.status),
        ));
    }
    Ok(())
}

fn check_authorize(v: &Value) -> Result<(), Violation> {
    constrained(materialize::<payloads::AuthorizeRequest>(v)?).map(|_| ())
}

fn check_start_transaction(v: &Value) -> Result<(), Violation> {
    constrained(materialize::<payloads::StartTransactionRequest>(v)?).map(|_| ())
}

fn check_stop_transaction(v: &Value) -> Result<(), Violation> {
    materialize::<payloads::StopTransactionRequest>(v).map(|_| ())
}

fn check_meter_values(v: &Value) -> Result<(), Violation> {
    materialize::<payloads::MeterValuesRequest>(v).map(|_| ())
}

fn check_data_transfer(v: &Value) -> Result<(), Violation> {
    constrained(materialize::<payloads::DataTransferRequest>(v)?).map(|_| ())
}

fn check_remote_start(v: &Value) -> Result<(), Violation> {
    constrained(materialize::<payloads::RemoteStartTransactionRequest>(v)?).map(|_| ())
}

fn check_remote_stop(v: &Value) -> Result<(), Violation> {
    materialize::<payloads::RemoteStopTransactionRequest>(v).map(|_| ())
}

fn check_reset(v: &Value) -> Result<(), Violation> {
    let req = materialize::<payloads::ResetRequest>(v)?;
    match req.kind.as_str() {
        "Hard" | "Soft" => Ok(()),
        other => Err(Violation::on_field(
            OcppErrorCode::PropertyConstraintViolation,
            "type",
            format!("{other} is not a reset type"),
        )),
    }
}

fn check_unlock_connector(v: &Value) -> Result<(), Violation> {
    materialize::<payloads::UnlockConnectorRequest>(v).map(|_| ())
}

fn check_change_availability(v: &Value) -> Result<(), Violation> {
    let req = materialize::<payloads::ChangeAvailabilityRequest>(v)?;
    match req.kind.as_str() {
        "Operative" | "Inoperative" => Ok(()),
        other => Err(Violation::on_field(
            OcppErrorCode::PropertyConstraintViolation,
            "type",
            format!("{other} is not an availability type"),
        )),
    }
}

fn check_change_configuration(v: &Value) -> Result<(), Violation> {
    constrained(materialize::<payloads::ChangeConfigurationRequest>(v)?).map(|_| ())
}

fn check_get_configuration(v: &Value) -> Result<(), Violation> {
    materialize::<payloads::GetConfigurationRequest>(v).map(|_| ())
}

const TRIGGERABLE_MESSAGES: &[&str] = &[
    "BootNotification",
    "DiagnosticsStatusNotification",
    "FirmwareStatusNotification",
    "Heartbeat",
    "MeterValues",
    "StatusNotification",
];

fn check_trigger_message(v: &Value) -> Result<(), Violation> {
    let req = materialize::<payloads::TriggerMessageRequest>(v)?;
    if !TRIGGERABLE_MESSAGES.contains(&req.requested_message.as_str()) {
        return Err(Violation::on_field(
            OcppErrorCode::PropertyConstraintViolation,
            "requestedMessage",
            format!("{} cannot be triggered", req.requested_message),
        ));
    }
    Ok(())
}

fn check_get_diagnostics(v: &Value) -> Result<(), Violation> {
    constrained(materialize::<payloads::GetDiagnosticsRequest>(v)?).map(|_| ())
}

fn check_update_firmware(v: &Value) -> Result<(), Violation> {
    constrained(materialize::<payloads::UpdateFirmwareRequest>(v)?).map(|_| ())
}

// ── Response checks ────────────────────────────────────────────

fn check_status_only_response(v: &Value) -> Result<(), Violation> {
    materialize::<payloads::StatusOnlyResponse>(v).map(|_| ())
}

fn check_get_configuration_response(v: &Value) -> Result<(), Violation> {
    materialize::<payloads::GetConfigurationResponse>(v).map(|_| ())
}

fn check_get_diagnostics_response(v: &Value) -> Result<(), Violation> {
    materialize::<payloads::GetDiagnosticsResponse>(v).map(|_| ())
}

// ── Registry ───────────────────────────────────────────────────

pub struct PayloadRegistry {
    actions: HashMap<&'static str, ActionSpec>,
}

pub type SharedPayloadRegistry = Arc<PayloadRegistry>;

impl PayloadRegistry {
    /// The OCPP 1.6 action set.
    pub fn ocpp16() -> Self {
        let specs = [
            ActionSpec {
                action: "BootNotification",
                direction: Direction::FromChargePoint,
                required_request: &["chargePointVendor", "chargePointModel"],
                request_check: check_boot_notification,
                required_response: &["status", "currentTime", "interval"],
                response_check: no_check,
            },
            ActionSpec {
                action: "Heartbeat",
                direction: Direction::FromChargePoint,
                required_request: &[],
                request_check: no_check,
                required_response: &["currentTime"],
                response_check: no_check,
            },
            ActionSpec {
                action: "StatusNotification",
                direction: Direction::FromChargePoint,
                required_request: &["connectorId", "errorCode", "status"],
                request_check: check_status_notification,
                required_response: &[],
                response_check: no_check,
            },
            ActionSpec {
                action: "Authorize",
                direction: Direction::FromChargePoint,
                required_request: &["idTag"],
                request_check: check_authorize,
                required_response: &["idTagInfo"],
                response_check: no_check,
            },
            ActionSpec {
                action: "StartTransaction",
                direction: Direction::FromChargePoint,
                required_request: &["connectorId", "idTag", "meterStart", "timestamp"],
                request_check: check_start_transaction,
                required_response: &["transactionId", "idTagInfo"],
                response_check: no_check,
            },
            ActionSpec {
                action: "StopTransaction",
                direction: Direction::FromChargePoint,
                required_request: &["transactionId", "meterStop", "timestamp"],
                request_check: check_stop_transaction,
                required_response: &[],
                response_check: no_check,
            },
            ActionSpec {
                action: "MeterValues",
                direction: Direction::FromChargePoint,
                required_request: &["connectorId", "meterValue"],
                request_check: check_meter_values,
                required_response: &[],
                response_check: no_check,
            },
            ActionSpec {
                action: "DataTransfer",
                direction: Direction::Both,
                required_request: &["vendorId"],
                request_check: check_data_transfer,
                required_response: &["status"],
                response_check: check_status_only_response,
            },
            ActionSpec {
                action: "RemoteStartTransaction",
                direction: Direction::ToChargePoint,
                required_request: &["idTag"],
                request_check: check_remote_start,
                required_response: &["status"],
                response_check: check_status_only_response,
            },
            ActionSpec {
                action: "RemoteStopTransaction",
                direction: Direction::ToChargePoint,
                required_request: &["transactionId"],
                request_check: check_remote_stop,
                required_response: &["status"],
                response_check: check_status_only_response,
            },
            ActionSpec {
                action: "Reset",
                direction: Direction::ToChargePoint,
                required_request: &["type"],
                request_check: check_reset,
                required_response: &["status"],
                response_check: check_status_only_response,
            },
            ActionSpec {
                action: "UnlockConnector",
                direction: Direction::ToChargePoint,
                required_request: &["connectorId"],
                request_check: check_unlock_connector,
                required_response: &["status"],
                response_check: check_status_only_response,
            },
            ActionSpec {
                action: "ChangeAvailability",
                direction: Direction::ToChargePoint,
                required_request: &["connectorId", "type"],
                request_check: check_change_availability,
                required_response: &["status"],
                response_check: check_status_only_response,
            },
            ActionSpec {
                action: "ChangeConfiguration",
                direction: Direction::ToChargePoint,
                required_request: &["key", "value"],
                request_check: check_change_configuration,
                required_response: &["status"],
                response_check: check_status_only_response,
            },
            ActionSpec {
                action: "GetConfiguration",
                direction: Direction::ToChargePoint,
                required_request: &[],
                request_check: check_get_configuration,
                required_response: &[],
                response_check: check_get_configuration_response,
            },
            ActionSpec {
                action: "ClearCache",
                direction: Direction::ToChargePoint,
                required_request: &[],
                request_check: no_check,
                required_response: &["status"],
                response_check: check_status_only_response,
            },
            ActionSpec {
                action: "TriggerMessage",
                direction: Direction::ToChargePoint,
                required_request: &["requestedMessage"],
                request_check: check_trigger_message,
                required_response: &["status"],
                response_check: check_status_only_response,
            },
            ActionSpec {
                action: "GetDiagnostics",
                direction: Direction::ToChargePoint,
                required_request: &["location"],
                request_check: check_get_diagnostics,
                required_response: &[],
                response_check: check_get_diagnostics_response,
            },
            ActionSpec {
                action: "UpdateFirmware",
                direction: Direction::ToChargePoint,
                required_request: &["location", "retrieveDate"],
                request_check: check_update_firmware,
                required_response: &[],
                response_check: no_check,
            },
        ];

        let mut actions = HashMap::new();
        for spec in specs {
            actions.insert(spec.action, spec);
        }
        Self { actions }
    }

    pub fn spec(&self, action: &str) -> Option<&ActionSpec> {
        self.actions.get(action)
    }

    /// Can this action arrive as a Call from a charge point?
    pub fn accepts_from_charge_point(&self, action: &str) -> bool {
        matches!(
            self.actions.get(action).map(|s| s.direction),
            Some(Direction::FromChargePoint) | Some(Direction::Both)
        )
    }

    /// Can this action be issued as a downstream command?
    pub fn accepts_command(&self, action: &str) -> bool {
        matches!(
            self.actions.get(action).map(|s| s.direction),
            Some(Direction::ToChargePoint) | Some(Direction::Both)
        )
    }

    pub fn validate_request(&self, action: &str, payload: &Value) -> Result<(), RegistryError> {
        let spec = self
            .actions
            .get(action)
            .ok_or_else(|| RegistryError::UnknownAction(action.to_string()))?;
        spec.validate_request(payload).map_err(RegistryError::from)
    }

    pub fn validate_response(&self, action: &str, payload: &Value) -> Result<(), RegistryError> {
        let spec = self
            .actions
            .get(action)
            .ok_or_else(|| RegistryError::UnknownAction(action.to_string()))?;
        spec.validate_response(payload).map_err(RegistryError::from)
    }
}
