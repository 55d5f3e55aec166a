//! DataTransfer handler (charge point → gateway direction)

use serde_json::Value;
use tracing::debug;

use crate::application::payloads::{materialize, DataTransferRequest, DataTransferResponse};
use crate::application::session::ChargePointSession;
use crate::domain::InternalEvent;
use crate::support::errors::Violation;

use super::Ocpp16Handler;

pub(super) async fn handle_data_transfer(
    h: &Ocpp16Handler,
    session: &mut ChargePointSession,
    payload: &Value,
) -> Result<(Value, Vec<InternalEvent>), Violation> {
    let req: DataTransferRequest = materialize(payload)?;
    debug!(
        charge_point_id = session.charge_point_id.as_str(),
        vendor_id = req.vendor_id.as_str(),
        message_id = req.message_id.as_deref().unwrap_or("-"),
        "data transfer"
    );

    let response = DataTransferResponse {
        status: "Accepted".to_string(),
        data: None,
    };
    Ok((h.to_payload(&response)?, Vec::new()))
}
