//! Unified meter-value shape
//!
//! OCPP 1.6 MeterValues nests a list of sampled values under each reading.
//! Events fan every sampled value out into its own [`MeterSample`] so that
//! downstream consumers never parse the nested form.

use serde::{Deserialize, Serialize};

/// Canonical OCPP measurand strings used in event payloads.
pub mod measurand {
    pub const ENERGY_ACTIVE_IMPORT_REGISTER: &str = "Energy.Active.Import.Register";
    pub const POWER_ACTIVE_IMPORT: &str = "Power.Active.Import";
    pub const VOLTAGE: &str = "Voltage";
    pub const CURRENT_IMPORT: &str = "Current.Import";
    pub const TEMPERATURE: &str = "Temperature";
}

/// One sampled value as it appears in event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledValue {
    pub value: String,
    pub measurand: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl SampledValue {
    /// Missing measurands default to the energy register, as the OCPP
    /// specification prescribes.
    pub fn with_default_measurand(value: String, measurand: Option<String>) -> Self {
        Self {
            value,
            measurand: measurand
                .unwrap_or_else(|| measurand::ENERGY_ACTIVE_IMPORT_REGISTER.to_string()),
            unit: None,
            context: None,
            phase: None,
            location: None,
        }
    }
}

/// One flattened meter reading: a single sampled value plus the timestamp
/// of the reading it came from (unix milliseconds, decimal string).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterSample {
    pub timestamp: String,
    pub sampled_value: SampledValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sample_serializes_camel_case() {
        let sample = MeterSample {
            timestamp: "1700000000000".to_string(),
            sampled_value: SampledValue {
                value: "95.70".to_string(),
                measurand: measurand::ENERGY_ACTIVE_IMPORT_REGISTER.to_string(),
                unit: Some("kWh".to_string()),
                context: None,
                phase: None,
                location: None,
            },
        };
        let v = serde_json::to_value(&sample).unwrap();
        assert_eq!(
            v,
            json!({
                "timestamp": "1700000000000",
                "sampledValue": {
                    "value": "95.70",
                    "measurand": "Energy.Active.Import.Register",
                    "unit": "kWh"
                }
            })
        );
    }

    #[test]
    fn default_measurand_is_energy_register() {
        let sv = SampledValue::with_default_measurand("12".into(), None);
        assert_eq!(sv.measurand, measurand::ENERGY_ACTIVE_IMPORT_REGISTER);
    }
}
