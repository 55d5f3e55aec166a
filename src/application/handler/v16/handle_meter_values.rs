//! MeterValues handler

use serde_json::{json, Value};
use tracing::debug;

use crate::application::payloads::{materialize, MeterValuesRequest};
use crate::application::session::ChargePointSession;
use crate::domain::{EventBody, InternalEvent};
use crate::support::errors::Violation;

use super::{flatten_meter_values, Ocpp16Handler};

pub(super) async fn handle_meter_values(
    h: &Ocpp16Handler,
    session: &mut ChargePointSession,
    payload: &Value,
) -> Result<(Value, Vec<InternalEvent>), Violation> {
    let req: MeterValuesRequest = materialize(payload)?;
    let meter_values = flatten_meter_values(&req.meter_value);

    debug!(
        charge_point_id = session.charge_point_id.as_str(),
        connector_id = req.connector_id,
        samples = meter_values.len(),
        "meter values"
    );

    let events = vec![h.event(
        &session.charge_point_id,
        EventBody::MeterValuesReceived {
            connector_id: req.connector_id,
            transaction_id: req.transaction_id,
            meter_values,
        },
    )];

    Ok((json!({}), events))
}
