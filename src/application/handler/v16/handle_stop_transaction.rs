//! StopTransaction handler

use serde_json::Value;
use tracing::info;

use crate::application::payloads::{
    materialize, IdTagInfo, StopTransactionRequest, StopTransactionResponse,
};
use crate::application::session::ChargePointSession;
use crate::domain::{EventBody, InternalEvent};
use crate::support::clock::unix_ms_string;
use crate::support::errors::Violation;

use super::{flatten_meter_values, Ocpp16Handler};

pub(super) async fn handle_stop_transaction(
    h: &Ocpp16Handler,
    session: &mut ChargePointSession,
    payload: &Value,
) -> Result<(Value, Vec<InternalEvent>), Violation> {
    let req: StopTransactionRequest = materialize(payload)?;

    info!(
        charge_point_id = session.charge_point_id.as_str(),
        transaction_id = req.transaction_id,
        meter_stop = req.meter_stop,
        reason = req.reason.as_deref().unwrap_or("-"),
        "transaction stopped"
    );

    // Meter samples attached to the stop are folded into the event.
    let meter_values = req
        .transaction_data
        .as_deref()
        .map(flatten_meter_values)
        .unwrap_or_default();

    let events = vec![h.event(
        &session.charge_point_id,
        EventBody::TransactionStopped {
            transaction_id: req.transaction_id,
            id_tag: req.id_tag.clone(),
            meter_stop: req.meter_stop,
            reason: req.reason,
            timestamp: unix_ms_string(req.timestamp),
            meter_values,
        },
    )];

    let response = StopTransactionResponse {
        id_tag_info: req.id_tag.map(|_| IdTagInfo::accepted()),
    };
    Ok((h.to_payload(&response)?, events))
}
