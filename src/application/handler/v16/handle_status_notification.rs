//! StatusNotification handler

use serde_json::{json, Value};
use tracing::info;

use crate::application::payloads::{materialize, StatusNotificationRequest};
use crate::application::session::ChargePointSession;
use crate::domain::{ConnectorStatus, EventBody, InternalEvent};
use crate::support::errors::{OcppErrorCode, Violation};

use super::Ocpp16Handler;

pub(super) async fn handle_status_notification(
    h: &Ocpp16Handler,
    session: &mut ChargePointSession,
    payload: &Value,
) -> Result<(Value, Vec<InternalEvent>), Violation> {
    let req: StatusNotificationRequest = materialize(payload)?;
    let status = ConnectorStatus::parse(&req.status).ok_or_else(|| {
        Violation::on_field(
            OcppErrorCode::PropertyConstraintViolation,
            "status",
            format!("{} is not a connector status", req.status),
        )
    })?;

    let previous = session.record_connector_status(req.connector_id, status);
    info!(
        charge_point_id = session.charge_point_id.as_str(),
        connector_id = req.connector_id,
        status = %status,
        previous = %previous,
        error_code = req.error_code.as_str(),
        "connector status"
    );

    let events = vec![h.event(
        &session.charge_point_id,
        EventBody::ConnectorStatusChanged {
            connector_id: req.connector_id,
            status,
            previous_status: previous,
            error_code: Some(req.error_code),
            info: req.info,
        },
    )];

    Ok((json!({}), events))
}
