//! BootNotification handler

use serde_json::Value;
use tracing::{info, warn};

use crate::application::payloads::{self, materialize, BootNotificationRequest};
use crate::application::ports::{ClaimOutcome, ConnectionStore};
use crate::application::session::{BootInfo, ChargePointSession, SessionState};
use crate::domain::{EventBody, InternalEvent};
use crate::support::errors::Violation;

use super::Ocpp16Handler;

/// Boots are always Accepted. The interesting part is ownership: the
/// session only reaches `Live` once this gateway holds the claim; with a
/// foreign owner still in the store the connection stays open in `Booted`
/// and the supervisor keeps retrying the claim until the old TTL lapses.
pub(super) async fn handle_boot_notification(
    h: &Ocpp16Handler,
    session: &mut ChargePointSession,
    payload: &Value,
) -> Result<(Value, Vec<InternalEvent>), Violation> {
    let req: BootNotificationRequest = materialize(payload)?;
    let now = h.now();

    info!(
        charge_point_id = session.charge_point_id.as_str(),
        vendor = req.charge_point_vendor.as_str(),
        model = req.charge_point_model.as_str(),
        "boot notification"
    );

    session.boot_info = Some(BootInfo {
        vendor: req.charge_point_vendor.clone(),
        model: req.charge_point_model.clone(),
        serial_number: req.charge_point_serial_number.clone(),
        firmware_version: req.firmware_version.clone(),
        accepted_at: now,
    });

    // Claim ownership; a foreign owner keeps the session out of Live.
    match h
        .store()
        .claim(&session.charge_point_id, &h.gateway_id, h.claim_ttl())
        .await
    {
        Ok(ClaimOutcome::Claimed) => {
            session.set_ownership_confirmed(true);
        }
        Ok(ClaimOutcome::AlreadyOwned { owner }) if owner == h.gateway_id => {
            session.set_ownership_confirmed(true);
        }
        Ok(ClaimOutcome::AlreadyOwned { owner }) => {
            warn!(
                charge_point_id = session.charge_point_id.as_str(),
                owner = owner.as_str(),
                "charge point still owned by another gateway; commands held back"
            );
            session.set_ownership_confirmed(false);
        }
        Err(e) => {
            // transient; the keepalive loop retries the claim
            warn!(
                charge_point_id = session.charge_point_id.as_str(),
                error = %e,
                "connection store claim failed"
            );
            session.set_ownership_confirmed(false);
        }
    }

    session.transition(SessionState::Booted);
    if session.ownership_confirmed() {
        session.transition(SessionState::Live);
    }

    let events = vec![
        h.event(
            &session.charge_point_id,
            EventBody::Connected {
                protocol: session.protocol.subprotocol().to_string(),
                remote_addr: session.remote_addr.clone(),
            },
        ),
        h.event(
            &session.charge_point_id,
            EventBody::Registered {
                vendor: req.charge_point_vendor,
                model: req.charge_point_model,
                serial_number: req.charge_point_serial_number,
                firmware_version: req.firmware_version,
            },
        ),
    ];

    let response = payloads::BootNotificationResponse {
        status: "Accepted".to_string(),
        current_time: payloads::iso_utc(now),
        interval: h.heartbeat_interval_secs(),
    };
    Ok((h.to_payload(&response)?, events))
}
