//! StartTransaction handler

use serde_json::Value;
use tracing::info;

use crate::application::payloads::{
    materialize, IdTagInfo, StartTransactionRequest, StartTransactionResponse,
};
use crate::application::session::ChargePointSession;
use crate::domain::{EventBody, InternalEvent};
use crate::support::clock::unix_ms_string;
use crate::support::errors::Violation;

use super::Ocpp16Handler;

pub(super) async fn handle_start_transaction(
    h: &Ocpp16Handler,
    session: &mut ChargePointSession,
    payload: &Value,
) -> Result<(Value, Vec<InternalEvent>), Violation> {
    let req: StartTransactionRequest = materialize(payload)?;
    let transaction_id = h.next_transaction_id();

    info!(
        charge_point_id = session.charge_point_id.as_str(),
        connector_id = req.connector_id,
        transaction_id,
        id_tag = req.id_tag.as_str(),
        meter_start = req.meter_start,
        "transaction started"
    );

    let events = vec![h.event(
        &session.charge_point_id,
        EventBody::TransactionStarted {
            transaction_id,
            connector_id: req.connector_id,
            id_tag: req.id_tag,
            meter_start: req.meter_start,
            timestamp: unix_ms_string(req.timestamp),
        },
    )];

    let response = StartTransactionResponse {
        transaction_id,
        id_tag_info: IdTagInfo::accepted(),
    };
    Ok((h.to_payload(&response)?, events))
}
