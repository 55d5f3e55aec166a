//! OCPP 1.6 protocol handler
//!
//! Routes OCPP 1.6 action names to their handlers. Actions are dispatched
//! by string name (parsed from the Call frame); each handler materializes
//! the typed request, applies the transition and returns the response
//! payload plus internal events.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::application::pending::{CallReply, CommandOutcome, CompletionSink, PendingError};
use crate::application::ports::SharedConnectionStore;
use crate::application::registry::{RegistryError, SharedPayloadRegistry};
use crate::application::session::ChargePointSession;
use crate::domain::meter::measurand;
use crate::domain::{Command, EventBody, InternalEvent, MeterSample, ProtocolVersion, SampledValue};
use crate::support::clock::{
    unix_ms_string, Clock, IdSource, SharedClock, SharedIds, TransactionSequence,
};
use crate::support::errors::{OcppErrorCode, Violation};
use crate::support::frame::OcppFrame;

use super::{CallOutcome, CommandRejection, ProtocolHandler};

mod handle_authorize;
mod handle_boot_notification;
mod handle_data_transfer;
mod handle_heartbeat;
mod handle_meter_values;
mod handle_start_transaction;
mod handle_status_notification;
mod handle_stop_transaction;

use handle_authorize::handle_authorize;
use handle_boot_notification::handle_boot_notification;
use handle_data_transfer::handle_data_transfer;
use handle_heartbeat::handle_heartbeat;
use handle_meter_values::handle_meter_values;
use handle_start_transaction::handle_start_transaction;
use handle_status_notification::handle_status_notification;
use handle_stop_transaction::handle_stop_transaction;

/// Deadlines and intervals the handler bakes into its responses.
#[derive(Debug, Clone)]
pub struct HandlerTimings {
    /// Interval advertised in BootNotification responses.
    pub heartbeat_interval: Duration,
    /// Per-call timeout for outbound Calls.
    pub call_timeout: Duration,
    /// TTL used when claiming ownership.
    pub claim_ttl: Duration,
}

impl Default for HandlerTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(300),
            call_timeout: Duration::from_secs(30),
            claim_ttl: Duration::from_secs(90),
        }
    }
}

/// OCPP 1.6 semantics. Stateless across sessions; everything mutable is
/// in the `ChargePointSession` the supervisor hands in.
pub struct Ocpp16Handler {
    pub(crate) gateway_id: String,
    registry: SharedPayloadRegistry,
    store: SharedConnectionStore,
    clock: SharedClock,
    ids: SharedIds,
    transactions: TransactionSequence,
    timings: HandlerTimings,
}

impl Ocpp16Handler {
    pub fn new(
        gateway_id: impl Into<String>,
        registry: SharedPayloadRegistry,
        store: SharedConnectionStore,
        clock: SharedClock,
        ids: SharedIds,
        timings: HandlerTimings,
    ) -> Self {
        let transactions = TransactionSequence::seeded_from(clock.as_ref());
        Self {
            gateway_id: gateway_id.into(),
            registry,
            store,
            clock,
            ids,
            transactions,
            timings,
        }
    }

    // ── Helpers shared by the action handlers ──────────────

    pub(super) fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    pub(super) fn heartbeat_interval_secs(&self) -> u64 {
        self.timings.heartbeat_interval.as_secs()
    }

    pub(super) fn claim_ttl(&self) -> Duration {
        self.timings.claim_ttl
    }

    pub(super) fn store(&self) -> &SharedConnectionStore {
        &self.store
    }

    pub(super) fn next_transaction_id(&self) -> i64 {
        self.transactions.next()
    }

    pub(super) fn event(&self, charge_point_id: &str, body: EventBody) -> InternalEvent {
        InternalEvent::new(self.ids.next_id(), charge_point_id, self.now(), body)
    }

    pub(super) fn to_payload<T: Serialize>(&self, value: &T) -> Result<Value, Violation> {
        serde_json::to_value(value)
            .map_err(|e| Violation::new(OcppErrorCode::InternalError, e.to_string()))
    }

    fn failure_outcome(
        &self,
        session: &ChargePointSession,
        message_id: &str,
        action: &str,
        violation: Violation,
    ) -> CallOutcome {
        let error_kind = match violation.code {
            OcppErrorCode::InternalError => {
                error!(
                    charge_point_id = session.charge_point_id.as_str(),
                    action,
                    error = %violation,
                    "handler failure"
                );
                "handler_internal"
            }
            _ => {
                debug!(
                    charge_point_id = session.charge_point_id.as_str(),
                    action,
                    error = %violation,
                    "payload rejected"
                );
                "payload_validation"
            }
        };

        let event = self.event(
            &session.charge_point_id,
            EventBody::ProtocolError {
                error_kind: error_kind.to_string(),
                message: violation.description.clone(),
                action: Some(action.to_string()),
            },
        );

        CallOutcome {
            response: OcppFrame::error(
                message_id,
                violation.code,
                violation.description.clone(),
                violation.details(),
            ),
            events: vec![event],
        }
    }

    fn command_event(&self, charge_point_id: &str, outcome: CommandOutcome) -> InternalEvent {
        let (status, response, error_text) = match outcome.reply {
            CallReply::Result(payload) => {
                let status = payload
                    .get("status")
                    .and_then(|s| s.as_str())
                    .unwrap_or("completed")
                    .to_string();
                (status, Some(payload), None)
            }
            CallReply::Error {
                code, description, ..
            } => (
                "call_error".to_string(),
                None,
                Some(format!("{code}: {description}")),
            ),
            CallReply::TimedOut => (
                "timeout".to_string(),
                None,
                Some("charge point did not reply in time".to_string()),
            ),
            CallReply::Cancelled(reason) => ("cancelled".to_string(), None, Some(reason)),
        };

        self.event(
            charge_point_id,
            EventBody::CommandExecuted {
                command_name: outcome.command_name,
                message_id: outcome.message_id,
                status,
                response,
                error: error_text,
            },
        )
    }
}

#[async_trait]
impl ProtocolHandler for Ocpp16Handler {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V16
    }

    async fn handle_call(
        &self,
        session: &mut ChargePointSession,
        message_id: &str,
        action: &str,
        payload: &Value,
    ) -> CallOutcome {
        if !session.state().accepts_work() {
            return CallOutcome {
                response: OcppFrame::error(
                    message_id,
                    OcppErrorCode::GenericError,
                    "session is draining",
                    serde_json::json!({}),
                ),
                events: Vec::new(),
            };
        }

        if !self.registry.accepts_from_charge_point(action) {
            info!(
                charge_point_id = session.charge_point_id.as_str(),
                action, "unknown action from charge point"
            );
            let event = self.event(
                &session.charge_point_id,
                EventBody::ProtocolError {
                    error_kind: "unknown_action".to_string(),
                    message: format!("{action} is not implemented"),
                    action: Some(action.to_string()),
                },
            );
            return CallOutcome {
                response: OcppFrame::error(
                    message_id,
                    OcppErrorCode::NotImplemented,
                    format!("{action} is not implemented"),
                    serde_json::json!({}),
                ),
                events: vec![event],
            };
        }

        if let Err(err) = self.registry.validate_request(action, payload) {
            let violation = match err {
                RegistryError::Invalid(v) => v,
                RegistryError::UnknownAction(a) => {
                    Violation::new(OcppErrorCode::NotImplemented, format!("{a} is not implemented"))
                }
            };
            return self.failure_outcome(session, message_id, action, violation);
        }

        let handled = match action {
            "BootNotification" => handle_boot_notification(self, session, payload).await,
            "Heartbeat" => handle_heartbeat(self, session, payload).await,
            "StatusNotification" => handle_status_notification(self, session, payload).await,
            "Authorize" => handle_authorize(self, session, payload).await,
            "StartTransaction" => handle_start_transaction(self, session, payload).await,
            "StopTransaction" => handle_stop_transaction(self, session, payload).await,
            "MeterValues" => handle_meter_values(self, session, payload).await,
            "DataTransfer" => handle_data_transfer(self, session, payload).await,
            // registry direction check keeps command actions out of this path
            other => Err(Violation::new(
                OcppErrorCode::NotImplemented,
                format!("{other} is not implemented"),
            )),
        };

        match handled {
            Ok((response_payload, events)) => CallOutcome {
                response: OcppFrame::result(message_id, response_payload),
                events,
            },
            Err(violation) => self.failure_outcome(session, message_id, action, violation),
        }
    }

    async fn handle_reply(
        &self,
        session: &mut ChargePointSession,
        frame: &OcppFrame,
    ) -> Vec<InternalEvent> {
        let (message_id, reply) = match frame {
            OcppFrame::CallResult { message_id, payload } => {
                (message_id.as_str(), CallReply::Result(payload.clone()))
            }
            OcppFrame::CallError {
                message_id,
                code,
                description,
                details,
            } => (
                message_id.as_str(),
                CallReply::Error {
                    code: *code,
                    description: description.clone(),
                    details: details.clone(),
                },
            ),
            OcppFrame::Call { .. } => return Vec::new(),
        };

        let Some(call) = session.pending.complete(message_id) else {
            warn!(
                charge_point_id = session.charge_point_id.as_str(),
                message_id, "reply does not match any pending call"
            );
            return Vec::new();
        };

        // Validate CallResult payloads against the registered response shape.
        let reply = match reply {
            CallReply::Result(payload) => match self.registry.validate_response(&call.action, &payload)
            {
                Ok(()) | Err(RegistryError::UnknownAction(_)) => CallReply::Result(payload),
                Err(RegistryError::Invalid(v)) => {
                    debug!(
                        charge_point_id = session.charge_point_id.as_str(),
                        action = call.action.as_str(),
                        error = %v,
                        "malformed command response"
                    );
                    CallReply::Error {
                        code: v.code,
                        description: v.description.clone(),
                        details: v.details(),
                    }
                }
            },
            other => other,
        };

        match call.finish(reply) {
            Some(outcome) => vec![self.command_event(&session.charge_point_id, outcome)],
            None => Vec::new(),
        }
    }

    fn issue_command(
        &self,
        session: &mut ChargePointSession,
        command: &Command,
    ) -> Result<OcppFrame, CommandRejection> {
        if !session.state().accepts_work() {
            return Err(CommandRejection::NotLive);
        }
        let action = command.command_name.as_str();
        if !self.registry.accepts_command(action) {
            return Err(CommandRejection::Unsupported(action.to_string()));
        }
        self.registry
            .validate_request(action, &command.payload)
            .map_err(|err| match err {
                RegistryError::UnknownAction(a) => CommandRejection::Unsupported(a),
                RegistryError::Invalid(v) => CommandRejection::Invalid(v),
            })?;

        // Producers correlate on their own message ID when they set one.
        let message_id = if command.message_id.is_empty() {
            self.ids.next_id()
        } else if command.message_id.len() > 36 {
            return Err(CommandRejection::Invalid(Violation::on_field(
                OcppErrorCode::PropertyConstraintViolation,
                "message_id",
                "message_id exceeds 36 characters",
            )));
        } else {
            command.message_id.clone()
        };

        let now = self.now();
        let deadline = now
            + chrono::Duration::from_std(self.timings.call_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        session
            .pending
            .add(
                message_id.clone(),
                action,
                now,
                deadline,
                CompletionSink::Command {
                    command_name: action.to_string(),
                },
            )
            .map_err(|e| match e {
                PendingError::Duplicate(id) => CommandRejection::DuplicateMessageId(id),
                PendingError::Full(_) => CommandRejection::QueueFull,
            })?;

        Ok(OcppFrame::call(message_id, action, command.payload.clone()))
    }

    fn sweep_pending(
        &self,
        session: &mut ChargePointSession,
        now: DateTime<Utc>,
    ) -> Vec<InternalEvent> {
        let expired = session.pending.sweep_expired(now);
        let mut events = Vec::new();
        for call in expired {
            warn!(
                charge_point_id = session.charge_point_id.as_str(),
                message_id = call.message_id.as_str(),
                action = call.action.as_str(),
                "pending call timed out"
            );
            if let Some(outcome) = call.finish(CallReply::TimedOut) {
                events.push(self.command_event(&session.charge_point_id, outcome));
            }
        }
        events
    }

    fn cancel_pending(
        &self,
        session: &mut ChargePointSession,
        reason: &str,
    ) -> Vec<InternalEvent> {
        let cancelled = session.pending.cancel_all();
        let mut events = Vec::new();
        for call in cancelled {
            if let Some(outcome) = call.finish(CallReply::Cancelled(reason.to_string())) {
                events.push(self.command_event(&session.charge_point_id, outcome));
            }
        }
        events
    }
}

// ── Meter value fan-out ────────────────────────────────────────

/// Flatten the nested wire form into one [`MeterSample`] per sampled value.
pub(super) fn flatten_meter_values(
    values: &[crate::application::payloads::WireMeterValue],
) -> Vec<MeterSample> {
    values
        .iter()
        .flat_map(|reading| {
            let timestamp = unix_ms_string(reading.timestamp);
            reading.sampled_value.iter().map(move |sv| MeterSample {
                timestamp: timestamp.clone(),
                sampled_value: SampledValue {
                    value: sv.value.clone(),
                    measurand: sv
                        .measurand
                        .clone()
                        .unwrap_or_else(|| measurand::ENERGY_ACTIVE_IMPORT_REGISTER.to_string()),
                    unit: sv.unit.clone(),
                    context: sv.context.clone(),
                    phase: sv.phase.clone(),
                    location: sv.location.clone(),
                },
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;
    use serde_json::json;

    use crate::application::ports::ConnectionStore;
    use crate::application::registry::PayloadRegistry;
    use crate::application::session::{SessionShared, SessionState};
    use crate::infrastructure::store::memory::MemoryConnectionStore;
    use crate::support::clock::{Clock, ManualClock, SequenceIds};

    pub(crate) struct Fixture {
        pub handler: Ocpp16Handler,
        pub clock: Arc<ManualClock>,
        pub store: Arc<MemoryConnectionStore>,
    }

    pub(crate) fn fixture() -> Fixture {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::at(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryConnectionStore::with_clock(clock.clone()));
        let handler = Ocpp16Handler::new(
            "gw-a",
            Arc::new(PayloadRegistry::ocpp16()),
            store.clone(),
            clock.clone(),
            Arc::new(SequenceIds::default()),
            HandlerTimings::default(),
        );
        Fixture {
            handler,
            clock,
            store,
        }
    }

    pub(crate) fn session(clock: &ManualClock) -> ChargePointSession {
        let now = clock.now_utc();
        ChargePointSession::new(
            "CP-001",
            ProtocolVersion::V16,
            now,
            16,
            Arc::new(SessionShared::new(now)),
        )
    }

    async fn boot(fx: &Fixture, session: &mut ChargePointSession) -> CallOutcome {
        fx.handler
            .handle_call(
                session,
                "b1",
                "BootNotification",
                &json!({"chargePointVendor": "V", "chargePointModel": "M"}),
            )
            .await
    }

    #[tokio::test]
    async fn boot_accepts_claims_and_goes_live() {
        let fx = fixture();
        let mut s = session(&fx.clock);

        let outcome = boot(&fx, &mut s).await;
        match &outcome.response {
            OcppFrame::CallResult { message_id, payload } => {
                assert_eq!(message_id, "b1");
                assert_eq!(payload["status"], "Accepted");
                assert_eq!(payload["interval"], 300);
                assert_eq!(payload["currentTime"], "2024-06-01T12:00:00Z");
            }
            other => panic!("expected CallResult, got {other:?}"),
        }

        let kinds: Vec<&str> = outcome.events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["charge_point.connected", "charge_point.registered"]);

        assert_eq!(s.state(), SessionState::Live);
        assert!(s.ownership_confirmed());
        assert_eq!(
            fx.store.lookup("CP-001").await.unwrap(),
            Some("gw-a".to_string())
        );
    }

    #[tokio::test]
    async fn boot_with_foreign_owner_stays_out_of_live() {
        let fx = fixture();
        fx.store
            .claim("CP-001", "gw-b", Duration::from_secs(90))
            .await
            .unwrap();
        let mut s = session(&fx.clock);

        let outcome = boot(&fx, &mut s).await;
        match &outcome.response {
            OcppFrame::CallResult { payload, .. } => assert_eq!(payload["status"], "Accepted"),
            other => panic!("expected CallResult, got {other:?}"),
        }
        assert_eq!(s.state(), SessionState::Booted);
        assert!(!s.ownership_confirmed());
    }

    #[tokio::test]
    async fn heartbeat_returns_current_time() {
        let fx = fixture();
        let mut s = session(&fx.clock);
        boot(&fx, &mut s).await;
        fx.clock.advance(chrono::Duration::seconds(30));

        let outcome = fx
            .handler
            .handle_call(&mut s, "h1", "Heartbeat", &json!({}))
            .await;
        match &outcome.response {
            OcppFrame::CallResult { message_id, payload } => {
                assert_eq!(message_id, "h1");
                assert_eq!(payload["currentTime"], "2024-06-01T12:00:30Z");
            }
            other => panic!("expected CallResult, got {other:?}"),
        }
        assert_eq!(outcome.events[0].kind(), "charge_point.heartbeat");
    }

    #[tokio::test]
    async fn status_change_reports_previous_status() {
        let fx = fixture();
        let mut s = session(&fx.clock);
        boot(&fx, &mut s).await;

        let outcome = fx
            .handler
            .handle_call(
                &mut s,
                "s1",
                "StatusNotification",
                &json!({"connectorId": 1, "status": "Charging", "errorCode": "NoError"}),
            )
            .await;

        assert!(matches!(outcome.response, OcppFrame::CallResult { .. }));
        let event = &outcome.events[0];
        assert_eq!(event.kind(), "connector.status_changed");
        let payload = serde_json::to_value(&event.body).unwrap();
        assert_eq!(payload["status"], "Charging");
        assert_eq!(payload["previousStatus"], "Unavailable");

        // second notification carries the observed previous status
        let outcome = fx
            .handler
            .handle_call(
                &mut s,
                "s2",
                "StatusNotification",
                &json!({"connectorId": 1, "status": "Finishing", "errorCode": "NoError"}),
            )
            .await;
        let payload = serde_json::to_value(&outcome.events[0].body).unwrap();
        assert_eq!(payload["previousStatus"], "Charging");
    }

    #[tokio::test]
    async fn start_and_stop_transaction_emit_events() {
        let fx = fixture();
        let mut s = session(&fx.clock);
        boot(&fx, &mut s).await;

        let outcome = fx
            .handler
            .handle_call(
                &mut s,
                "t1",
                "StartTransaction",
                &json!({
                    "connectorId": 1,
                    "idTag": "TAG-1",
                    "meterStart": 100,
                    "timestamp": "2024-06-01T12:01:00Z"
                }),
            )
            .await;

        let txn_id = match &outcome.response {
            OcppFrame::CallResult { payload, .. } => {
                assert_eq!(payload["idTagInfo"]["status"], "Accepted");
                payload["transactionId"].as_i64().unwrap()
            }
            other => panic!("expected CallResult, got {other:?}"),
        };
        assert_eq!(outcome.events[0].kind(), "transaction.started");

        let outcome = fx
            .handler
            .handle_call(
                &mut s,
                "t2",
                "StopTransaction",
                &json!({
                    "transactionId": txn_id,
                    "meterStop": 4200,
                    "timestamp": "2024-06-01T12:30:00Z",
                    "transactionData": [
                        {"timestamp": "2024-06-01T12:29:00Z",
                         "sampledValue": [{"value": "4.1", "unit": "kWh"}]}
                    ]
                }),
            )
            .await;
        assert_eq!(outcome.events[0].kind(), "transaction.stopped");
        let payload = serde_json::to_value(&outcome.events[0].body).unwrap();
        assert_eq!(payload["meterStop"], 4200);
        assert_eq!(
            payload["meterValues"][0]["sampledValue"]["measurand"],
            "Energy.Active.Import.Register"
        );
    }

    #[tokio::test]
    async fn meter_values_fan_out_into_unified_shape() {
        let fx = fixture();
        let mut s = session(&fx.clock);
        boot(&fx, &mut s).await;

        let outcome = fx
            .handler
            .handle_call(
                &mut s,
                "m1",
                "MeterValues",
                &json!({
                    "connectorId": 1,
                    "transactionId": 7,
                    "meterValue": [
                        {"timestamp": "2024-06-01T12:05:00Z",
                         "sampledValue": [
                            {"value": "95.70", "measurand": "Energy.Active.Import.Register", "unit": "kWh"},
                            {"value": "11.2", "measurand": "Power.Active.Import", "unit": "kW"}
                         ]}
                    ]
                }),
            )
            .await;

        let event = &outcome.events[0];
        assert_eq!(event.kind(), "meter_values.received");
        let payload = serde_json::to_value(&event.body).unwrap();
        let samples = payload["meterValues"].as_array().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(
            samples[0]["sampledValue"]["measurand"],
            "Energy.Active.Import.Register"
        );
        assert_eq!(samples[0]["sampledValue"]["unit"], "kWh");
        assert_eq!(samples[1]["sampledValue"]["measurand"], "Power.Active.Import");
    }

    #[tokio::test]
    async fn unknown_action_yields_not_implemented() {
        let fx = fixture();
        let mut s = session(&fx.clock);
        let outcome = fx
            .handler
            .handle_call(&mut s, "x1", "SignCertificate", &json!({}))
            .await;
        match &outcome.response {
            OcppFrame::CallError { code, .. } => {
                assert_eq!(*code, OcppErrorCode::NotImplemented)
            }
            other => panic!("expected CallError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_payload_yields_call_error_and_keeps_session() {
        let fx = fixture();
        let mut s = session(&fx.clock);
        boot(&fx, &mut s).await;

        let outcome = fx
            .handler
            .handle_call(
                &mut s,
                "s1",
                "StatusNotification",
                &json!({"connectorId": 1, "status": "Sleeping", "errorCode": "NoError"}),
            )
            .await;
        match &outcome.response {
            OcppFrame::CallError { code, .. } => {
                assert_eq!(*code, OcppErrorCode::PropertyConstraintViolation)
            }
            other => panic!("expected CallError, got {other:?}"),
        }
        assert_eq!(outcome.events[0].kind(), "protocol.error");
        assert_eq!(s.state(), SessionState::Live);
    }

    #[tokio::test]
    async fn command_round_trip_completes_pending_call() {
        let fx = fixture();
        let mut s = session(&fx.clock);
        boot(&fx, &mut s).await;

        let command = Command {
            charge_point_id: "CP-001".to_string(),
            command_name: "RemoteStartTransaction".to_string(),
            message_id: "cmd-1".to_string(),
            payload: json!({"idTag": "TAG-1"}),
            timestamp: String::new(),
        };
        let frame = fx.handler.issue_command(&mut s, &command).unwrap();
        assert_eq!(frame.message_id(), "cmd-1");
        assert!(s.pending.contains("cmd-1"));

        let reply = OcppFrame::result("cmd-1", json!({"status": "Accepted"}));
        let events = fx.handler.handle_reply(&mut s, &reply).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "remote_command.executed");
        let payload = serde_json::to_value(&events[0].body).unwrap();
        assert_eq!(payload["status"], "Accepted");
        assert_eq!(payload["commandName"], "RemoteStartTransaction");
        assert!(s.pending.is_empty());
    }

    #[tokio::test]
    async fn duplicate_command_message_id_is_rejected() {
        let fx = fixture();
        let mut s = session(&fx.clock);
        boot(&fx, &mut s).await;

        let command = Command {
            charge_point_id: "CP-001".to_string(),
            command_name: "ClearCache".to_string(),
            message_id: "dup".to_string(),
            payload: json!({}),
            timestamp: String::new(),
        };
        fx.handler.issue_command(&mut s, &command).unwrap();
        assert!(matches!(
            fx.handler.issue_command(&mut s, &command),
            Err(CommandRejection::DuplicateMessageId(_))
        ));
    }

    #[tokio::test]
    async fn unsupported_command_is_rejected() {
        let fx = fixture();
        let mut s = session(&fx.clock);
        boot(&fx, &mut s).await;

        let command = Command {
            charge_point_id: "CP-001".to_string(),
            command_name: "BootNotification".to_string(),
            message_id: "m".to_string(),
            payload: json!({}),
            timestamp: String::new(),
        };
        assert!(matches!(
            fx.handler.issue_command(&mut s, &command),
            Err(CommandRejection::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn sweep_times_out_overdue_calls_exactly_once() {
        let fx = fixture();
        let mut s = session(&fx.clock);
        boot(&fx, &mut s).await;

        let command = Command {
            charge_point_id: "CP-001".to_string(),
            command_name: "Reset".to_string(),
            message_id: "r-1".to_string(),
            payload: json!({"type": "Soft"}),
            timestamp: String::new(),
        };
        fx.handler.issue_command(&mut s, &command).unwrap();

        // not yet due
        let events = fx
            .handler
            .sweep_pending(&mut s, fx.clock.now_utc() + chrono::Duration::seconds(10));
        assert!(events.is_empty());

        let events = fx
            .handler
            .sweep_pending(&mut s, fx.clock.now_utc() + chrono::Duration::seconds(60));
        assert_eq!(events.len(), 1);
        let payload = serde_json::to_value(&events[0].body).unwrap();
        assert_eq!(payload["status"], "timeout");

        // a late reply after the timeout finds nothing
        let reply = OcppFrame::result("r-1", json!({"status": "Accepted"}));
        let events = fx.handler.handle_reply(&mut s, &reply).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn unmatched_reply_is_dropped() {
        let fx = fixture();
        let mut s = session(&fx.clock);
        boot(&fx, &mut s).await;
        let reply = OcppFrame::result("ghost", json!({"status": "Accepted"}));
        assert!(fx.handler.handle_reply(&mut s, &reply).await.is_empty());
    }

    #[test]
    fn flatten_defaults_missing_measurand() {
        use crate::application::payloads::{WireMeterValue, WireSampledValue};
        let values = vec![WireMeterValue {
            timestamp: Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap(),
            sampled_value: vec![WireSampledValue {
                value: "42".to_string(),
                context: None,
                format: None,
                measurand: None,
                phase: None,
                location: None,
                unit: None,
            }],
        }];
        let samples = flatten_meter_values(&values);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].timestamp, "1700000000000");
        assert_eq!(
            samples[0].sampled_value.measurand,
            measurand::ENERGY_ACTIVE_IMPORT_REGISTER
        );
    }
}
