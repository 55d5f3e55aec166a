//! Typed OCPP 1.6 payloads
//!
//! Requests arriving from charge points (and commands heading to them) are
//! materialized from raw JSON into these structs. Materialization errors
//! map onto the OCPP violation codes:
//!
//! - not a JSON object → `FormationViolation`
//! - required field missing → `OccurrenceConstraintViolation`
//! - wrong JSON type → `TypeConstraintViolation`
//! - value out of range / malformed → `PropertyConstraintViolation`

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use crate::support::errors::{OcppErrorCode, Violation};

// ── Materialization helpers ────────────────────────────────────

pub fn require_object(payload: &Value) -> Result<&Map<String, Value>, Violation> {
    payload.as_object().ok_or_else(|| {
        Violation::new(
            OcppErrorCode::FormationViolation,
            "payload must be a JSON object",
        )
    })
}

pub fn require_fields(obj: &Map<String, Value>, fields: &[&str]) -> Result<(), Violation> {
    for field in fields {
        match obj.get(*field) {
            None | Some(Value::Null) => {
                return Err(Violation::on_field(
                    OcppErrorCode::OccurrenceConstraintViolation,
                    field,
                    format!("required field {field} is missing"),
                ));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

pub fn materialize<T: DeserializeOwned>(payload: &Value) -> Result<T, Violation> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        Violation::new(OcppErrorCode::TypeConstraintViolation, e.to_string())
    })
}

/// Run the derived field constraints, mapping the first failure onto
/// `PropertyConstraintViolation`.
pub fn constrained<T: Validate>(value: T) -> Result<T, Violation> {
    match value.validate() {
        Ok(()) => Ok(value),
        Err(errors) => {
            let field = errors
                .field_errors()
                .keys()
                .next()
                .map(|k| k.to_string());
            let violation = match field {
                Some(field) => Violation::on_field(
                    OcppErrorCode::PropertyConstraintViolation,
                    &field,
                    format!("constraint violated on {field}"),
                ),
                None => Violation::new(
                    OcppErrorCode::PropertyConstraintViolation,
                    "payload constraint violated",
                ),
            };
            Err(violation)
        }
    }
}

/// ISO 8601 UTC timestamp as OCPP responses carry it.
pub fn iso_utc(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ── Shared payload fragments ───────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdTagInfo {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<String>,
}

impl IdTagInfo {
    pub fn accepted() -> Self {
        Self {
            status: "Accepted".to_string(),
            expiry_date: None,
            parent_id_tag: None,
        }
    }

    pub fn invalid() -> Self {
        Self {
            status: "Invalid".to_string(),
            expiry_date: None,
            parent_id_tag: None,
        }
    }
}

/// Nested meter reading as it appears on the OCPP wire.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMeterValue {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sampled_value: Vec<WireSampledValue>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSampledValue {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

// ── Requests from the charge point ─────────────────────────────

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    #[validate(length(min = 1, max = 20))]
    pub charge_point_vendor: String,
    #[validate(length(min = 1, max = 20))]
    pub charge_point_model: String,
    #[validate(length(max = 25))]
    pub charge_point_serial_number: Option<String>,
    #[validate(length(max = 25))]
    pub charge_box_serial_number: Option<String>,
    #[validate(length(max = 50))]
    pub firmware_version: Option<String>,
    #[validate(length(max = 20))]
    pub iccid: Option<String>,
    #[validate(length(max = 20))]
    pub imsi: Option<String>,
    #[validate(length(max = 25))]
    pub meter_type: Option<String>,
    #[validate(length(max = 25))]
    pub meter_serial_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub connector_id: u64,
    pub error_code: String,
    pub status: String,
    pub info: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub vendor_id: Option<String>,
    pub vendor_error_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    #[validate(length(min = 1, max = 20))]
    pub id_tag: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    pub connector_id: u64,
    #[validate(length(min = 1, max = 20))]
    pub id_tag: String,
    pub meter_start: i64,
    pub timestamp: DateTime<Utc>,
    pub reservation_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionRequest {
    pub transaction_id: i64,
    pub meter_stop: i64,
    pub timestamp: DateTime<Utc>,
    pub id_tag: Option<String>,
    pub reason: Option<String>,
    pub transaction_data: Option<Vec<WireMeterValue>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub connector_id: u64,
    pub transaction_id: Option<i64>,
    #[serde(default)]
    pub meter_value: Vec<WireMeterValue>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    #[validate(length(min = 1, max = 255))]
    pub vendor_id: String,
    pub message_id: Option<String>,
    pub data: Option<Value>,
}

// ── Responses to the charge point ──────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub status: String,
    pub current_time: String,
    pub interval: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub id_tag_info: IdTagInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionResponse {
    pub transaction_id: i64,
    pub id_tag_info: IdTagInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag_info: Option<IdTagInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ── Command requests (gateway → charge point) ──────────────────

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStartTransactionRequest {
    #[validate(length(min = 1, max = 20))]
    pub id_tag: String,
    pub connector_id: Option<u64>,
    /// Opaque to the gateway; forwarded untouched.
    pub charging_profile: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStopTransactionRequest {
    pub transaction_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockConnectorRequest {
    pub connector_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeAvailabilityRequest {
    pub connector_id: u64,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChangeConfigurationRequest {
    #[validate(length(min = 1, max = 50))]
    pub key: String,
    #[validate(length(max = 500))]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigurationRequest {
    pub key: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClearCacheRequest {}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMessageRequest {
    pub requested_message: String,
    pub connector_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GetDiagnosticsRequest {
    #[validate(length(min = 1))]
    pub location: String,
    pub retries: Option<u64>,
    pub retry_interval: Option<u64>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFirmwareRequest {
    #[validate(length(min = 1))]
    pub location: String,
    pub retrieve_date: DateTime<Utc>,
    pub retries: Option<u64>,
    pub retry_interval: Option<u64>,
}

// ── Command responses (charge point → gateway) ─────────────────

/// Most command replies are a bare status object.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusOnlyResponse {
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigurationResponse {
    pub configuration_key: Option<Vec<ConfigurationKey>>,
    pub unknown_key: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationKey {
    pub key: String,
    pub readonly: bool,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDiagnosticsResponse {
    pub file_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn boot_request_materializes() {
        let payload = json!({
            "chargePointVendor": "V",
            "chargePointModel": "M",
            "firmwareVersion": "1.2.3"
        });
        let req: BootNotificationRequest = materialize(&payload).unwrap();
        let req = constrained(req).unwrap();
        assert_eq!(req.charge_point_vendor, "V");
        assert_eq!(req.firmware_version.as_deref(), Some("1.2.3"));
    }

    #[test]
    fn missing_required_field_is_occurrence_violation() {
        let payload = json!({ "chargePointVendor": "V" });
        let obj = require_object(&payload).unwrap();
        let err =
            require_fields(obj, &["chargePointVendor", "chargePointModel"]).unwrap_err();
        assert_eq!(err.code, OcppErrorCode::OccurrenceConstraintViolation);
        assert_eq!(err.field.as_deref(), Some("chargePointModel"));
    }

    #[test]
    fn wrong_type_is_type_violation() {
        let payload = json!({ "connectorId": "one", "errorCode": "NoError", "status": "Available" });
        let err = materialize::<StatusNotificationRequest>(&payload).unwrap_err();
        assert_eq!(err.code, OcppErrorCode::TypeConstraintViolation);
    }

    #[test]
    fn oversized_id_tag_is_property_violation() {
        let payload = json!({ "idTag": "X".repeat(21) });
        let req: AuthorizeRequest = materialize(&payload).unwrap();
        let err = constrained(req).unwrap_err();
        assert_eq!(err.code, OcppErrorCode::PropertyConstraintViolation);
    }

    #[test]
    fn non_object_payload_is_formation_violation() {
        let err = require_object(&json!([1, 2])).unwrap_err();
        assert_eq!(err.code, OcppErrorCode::FormationViolation);
    }

    #[test]
    fn iso_utc_renders_zulu_seconds() {
        use chrono::TimeZone;
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(iso_utc(t), "2024-01-02T03:04:05Z");
    }
}
