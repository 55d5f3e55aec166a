//! Event outbox
//!
//! Turns internal events into the external envelope and publishes them to
//! the event topic, keyed by charge point ID so per-CP ordering survives
//! partitioning. The envelope mapping is pure and deterministic; the
//! publishing side is lossy under overload by contract; authoritative
//! state lives in the charge point and downstream aggregators.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::domain::InternalEvent;
use crate::support::clock::unix_ms_string;
use crate::support::errors::BusError;
use crate::support::shutdown::ShutdownSignal;

use super::ports::{EventTransport, SharedEventTransport};

/// Default bounded wait before an event is dropped on producer overload.
pub const DEFAULT_PUBLISH_WAIT: Duration = Duration::from_millis(500);

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(100);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);

// ── External envelope ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    pub event_id: String,
    pub event_type: String,
    pub charge_point_id: String,
    pub gateway_id: String,
    /// Unix milliseconds as a decimal string.
    pub timestamp: String,
    pub payload: Value,
}

/// Internal → external event-type mapping. Types the backend contract
/// renames are translated; the rest pass through under their own names.
fn external_event_type(kind: &'static str) -> &'static str {
    match kind {
        "meter_values.received" => "transaction.meter_values",
        "remote_command.executed" => "command.response",
        other => other,
    }
}

/// Build the external envelope. Pure: two calls with the same event and
/// gateway ID produce byte-identical JSON.
pub fn envelope(event: &InternalEvent, gateway_id: &str) -> OutboundEvent {
    // The body serializes with its variant tag; the envelope's eventType
    // already carries that information, so the tag is stripped from the
    // payload object.
    let mut payload = serde_json::to_value(&event.body).unwrap_or(Value::Null);
    if let Some(obj) = payload.as_object_mut() {
        obj.remove("kind");
    }

    OutboundEvent {
        event_id: event.event_id.clone(),
        event_type: external_event_type(event.kind()).to_string(),
        charge_point_id: event.charge_point_id.clone(),
        gateway_id: gateway_id.to_string(),
        timestamp: unix_ms_string(event.occurred_at),
        payload,
    }
}

// ── Outbox ─────────────────────────────────────────────────────

pub struct EventOutbox {
    transport: SharedEventTransport,
    gateway_id: String,
    publish_wait: Duration,
}

impl EventOutbox {
    pub fn new(
        transport: SharedEventTransport,
        gateway_id: impl Into<String>,
        publish_wait: Duration,
    ) -> Self {
        Self {
            transport,
            gateway_id: gateway_id.into(),
            publish_wait,
        }
    }

    /// Consume the unified event stream until it closes or shutdown fires.
    pub async fn run(self, mut events: mpsc::Receiver<InternalEvent>, shutdown: ShutdownSignal) {
        info!(gateway_id = self.gateway_id.as_str(), "event outbox started");
        loop {
            tokio::select! {
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => self.publish_one(event, &shutdown).await,
                        None => break,
                    }
                }
                _ = shutdown.notified().wait() => break,
            }
        }
        info!("event outbox stopped");
    }

    async fn publish_one(&self, event: InternalEvent, shutdown: &ShutdownSignal) {
        let envelope = envelope(&event, &self.gateway_id);
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "failed to serialize envelope");
                return;
            }
        };

        let mut backoff = RETRY_BACKOFF_BASE;
        loop {
            match self
                .transport
                .publish(&envelope.charge_point_id, bytes.clone(), self.publish_wait)
                .await
            {
                Ok(()) => {
                    metrics::counter!("gateway_events_published_total").increment(1);
                    return;
                }
                Err(BusError::PublishTimeout) => {
                    // downstream overload: bounded wait elapsed, drop
                    warn!(
                        charge_point_id = envelope.charge_point_id.as_str(),
                        event_type = envelope.event_type.as_str(),
                        "producer saturated; dropping event"
                    );
                    metrics::counter!(
                        "gateway_events_dropped_total",
                        "reason" => "downstream_overload"
                    )
                    .increment(1);
                    return;
                }
                Err(BusError::Unavailable(e)) => {
                    error!(error = %e, backoff_ms = backoff.as_millis() as u64, "bus unavailable; retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.notified().wait() => return,
                    }
                    backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                }
                Err(BusError::Closed) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;

    use crate::application::ports::EventTransport;
    use crate::domain::{ConnectorStatus, EventBody};

    fn status_event() -> InternalEvent {
        InternalEvent::new(
            "6d1e4f80-0000-4000-8000-000000000001".to_string(),
            "CP-001",
            chrono::Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap(),
            EventBody::ConnectorStatusChanged {
                connector_id: 1,
                status: ConnectorStatus::Charging,
                previous_status: ConnectorStatus::Unavailable,
                error_code: Some("NoError".to_string()),
                info: None,
            },
        )
    }

    #[test]
    fn envelope_maps_renamed_types() {
        let event = InternalEvent::new(
            "e1".to_string(),
            "CP-001",
            chrono::Utc::now(),
            EventBody::MeterValuesReceived {
                connector_id: 1,
                transaction_id: Some(5),
                meter_values: vec![],
            },
        );
        assert_eq!(envelope(&event, "gw-a").event_type, "transaction.meter_values");

        let event = InternalEvent::new(
            "e2".to_string(),
            "CP-001",
            chrono::Utc::now(),
            EventBody::CommandExecuted {
                command_name: "Reset".to_string(),
                message_id: "m".to_string(),
                status: "Accepted".to_string(),
                response: None,
                error: None,
            },
        );
        assert_eq!(envelope(&event, "gw-a").event_type, "command.response");
    }

    #[test]
    fn envelope_passes_through_other_types() {
        let event = InternalEvent::new(
            "e3".to_string(),
            "CP-001",
            chrono::Utc::now(),
            EventBody::Heartbeat {},
        );
        assert_eq!(envelope(&event, "gw-a").event_type, "charge_point.heartbeat");
    }

    #[test]
    fn envelope_is_deterministic() {
        let event = status_event();
        let a = serde_json::to_vec(&envelope(&event, "gw-a")).unwrap();
        let b = serde_json::to_vec(&envelope(&event, "gw-a")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn envelope_carries_contract_fields() {
        let event = status_event();
        let env = envelope(&event, "gw-a");
        assert_eq!(env.event_id, "6d1e4f80-0000-4000-8000-000000000001");
        assert_eq!(env.charge_point_id, "CP-001");
        assert_eq!(env.gateway_id, "gw-a");
        assert_eq!(env.timestamp, "1700000000000");
        assert_eq!(env.payload["status"], "Charging");
        assert_eq!(env.payload["previousStatus"], "Unavailable");
        assert!(env.payload.get("kind").is_none());

        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire["eventType"], "connector.status_changed");
        assert_eq!(wire["chargePointId"], "CP-001");
        assert_eq!(wire["gatewayId"], "gw-a");
    }

    // ── Publish-side behavior ──────────────────────────────

    struct RecordingTransport {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        fail_times: Mutex<usize>,
        failure: fn() -> BusError,
    }

    #[async_trait]
    impl EventTransport for RecordingTransport {
        async fn publish(
            &self,
            key: &str,
            payload: Vec<u8>,
            _deadline: Duration,
        ) -> Result<(), BusError> {
            let mut failures = self.fail_times.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err((self.failure)());
            }
            self.published
                .lock()
                .unwrap()
                .push((key.to_string(), payload));
            Ok(())
        }

        async fn flush(&self, _deadline: Duration) {}
    }

    fn transport(fail_times: usize, failure: fn() -> BusError) -> Arc<RecordingTransport> {
        Arc::new(RecordingTransport {
            published: Mutex::new(Vec::new()),
            fail_times: Mutex::new(fail_times),
            failure,
        })
    }

    #[tokio::test]
    async fn publishes_keyed_by_charge_point() {
        let t = transport(0, || BusError::Closed);
        let outbox = EventOutbox::new(t.clone(), "gw-a", DEFAULT_PUBLISH_WAIT);
        let shutdown = ShutdownSignal::new();

        outbox.publish_one(status_event(), &shutdown).await;

        let published = t.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "CP-001");
        let wire: Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(wire["eventType"], "connector.status_changed");
    }

    #[tokio::test]
    async fn overload_drops_the_event() {
        let t = transport(1, || BusError::PublishTimeout);
        let outbox = EventOutbox::new(t.clone(), "gw-a", DEFAULT_PUBLISH_WAIT);
        let shutdown = ShutdownSignal::new();

        outbox.publish_one(status_event(), &shutdown).await;
        assert!(t.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailability_retries_until_success() {
        let t = transport(2, || BusError::Unavailable("broker down".to_string()));
        let outbox = EventOutbox::new(t.clone(), "gw-a", DEFAULT_PUBLISH_WAIT);
        let shutdown = ShutdownSignal::new();

        tokio::time::timeout(
            Duration::from_secs(5),
            outbox.publish_one(status_event(), &shutdown),
        )
        .await
        .expect("retries should converge");
        assert_eq!(t.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let t = transport(0, || BusError::Closed);
        let outbox = EventOutbox::new(t, "gw-a", DEFAULT_PUBLISH_WAIT);
        let shutdown = ShutdownSignal::new();
        let (_tx, rx) = mpsc::channel(4);

        let handle = tokio::spawn(outbox.run(rx, shutdown.clone()));
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("outbox did not stop")
            .unwrap();
    }

    #[test]
    fn empty_payload_bodies_serialize_to_object() {
        let event = InternalEvent::new(
            "e".to_string(),
            "CP-1",
            chrono::Utc::now(),
            EventBody::Heartbeat {},
        );
        let env = envelope(&event, "gw");
        assert_eq!(env.payload, json!({}));
    }
}
