//! Heartbeat handler

use serde_json::Value;
use tracing::{debug, warn};

use crate::application::payloads;
use crate::application::ports::{ConnectionStore, RenewOutcome};
use crate::application::session::{ChargePointSession, SessionState};
use crate::domain::{DisconnectReason, EventBody, InternalEvent};
use crate::support::errors::Violation;

use super::Ocpp16Handler;

pub(super) async fn handle_heartbeat(
    h: &Ocpp16Handler,
    session: &mut ChargePointSession,
    _payload: &Value,
) -> Result<(Value, Vec<InternalEvent>), Violation> {
    let now = h.now();
    debug!(
        charge_point_id = session.charge_point_id.as_str(),
        "heartbeat"
    );

    // Best-effort renew; the keepalive loop is the authoritative renewer.
    if session.ownership_confirmed() {
        match h
            .store()
            .renew(&session.charge_point_id, &h.gateway_id, h.claim_ttl())
            .await
        {
            Ok(RenewOutcome::Renewed) => {}
            Ok(RenewOutcome::Lost) => {
                warn!(
                    charge_point_id = session.charge_point_id.as_str(),
                    "ownership lost on heartbeat renew; draining session"
                );
                session.set_ownership_confirmed(false);
                session.shared().set_close_reason(DisconnectReason::OwnershipLost);
                session.transition(SessionState::Draining);
            }
            Err(e) => {
                warn!(
                    charge_point_id = session.charge_point_id.as_str(),
                    error = %e,
                    "connection store renew failed; retrying on next heartbeat"
                );
            }
        }
    }

    let events = vec![h.event(&session.charge_point_id, EventBody::Heartbeat {})];
    let response = payloads::HeartbeatResponse {
        current_time: payloads::iso_utc(now),
    };
    Ok((h.to_payload(&response)?, events))
}
