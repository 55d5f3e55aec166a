//! Authorize handler
//!
//! The gateway accepts any well-formed idTag; real authorization policy
//! lives behind the event stream, outside this process.

use serde_json::Value;
use tracing::debug;

use crate::application::payloads::{materialize, AuthorizeRequest, AuthorizeResponse, IdTagInfo};
use crate::application::session::ChargePointSession;
use crate::domain::InternalEvent;
use crate::support::errors::Violation;

use super::Ocpp16Handler;

pub(super) async fn handle_authorize(
    h: &Ocpp16Handler,
    session: &mut ChargePointSession,
    payload: &Value,
) -> Result<(Value, Vec<InternalEvent>), Violation> {
    let req: AuthorizeRequest = materialize(payload)?;
    debug!(
        charge_point_id = session.charge_point_id.as_str(),
        id_tag = req.id_tag.as_str(),
        "authorize"
    );

    let response = AuthorizeResponse {
        id_tag_info: IdTagInfo::accepted(),
    };
    Ok((h.to_payload(&response)?, Vec::new()))
}
