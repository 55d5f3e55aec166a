//! Dispatcher
//!
//! Process-wide registry mapping protocol version → handler. Inbound
//! frames are fanned to the handler negotiated for the session; every
//! handler's internal events are funneled into one bounded stream that
//! feeds the outbox. Dispatch is O(1) and there is no fallback between
//! versions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{InternalEvent, ProtocolVersion};
use crate::support::errors::OcppErrorCode;
use crate::support::frame::OcppFrame;

use super::handler::ProtocolHandler;
use super::session::ChargePointSession;

/// Default capacity of the event aggregation channel.
pub const DEFAULT_EVENT_BUFFER: usize = 50_000;

// ── Stats ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct StatsInner {
    dispatched: HashMap<ProtocolVersion, u64>,
    total: u64,
    total_micros: u128,
    max_micros: u128,
}

/// Snapshot of dispatcher activity. Informational only.
#[derive(Debug, Clone)]
pub struct DispatcherStats {
    pub dispatched_by_version: HashMap<&'static str, u64>,
    pub total_dispatched: u64,
    pub avg_dispatch_micros: u128,
    pub max_dispatch_micros: u128,
    pub uptime: std::time::Duration,
}

// ── Dispatcher ─────────────────────────────────────────────────

pub struct Dispatcher {
    handlers: HashMap<ProtocolVersion, Arc<dyn ProtocolHandler>>,
    default_version: ProtocolVersion,
    event_tx: mpsc::Sender<InternalEvent>,
    stats: RwLock<StatsInner>,
    started_at: Instant,
}

pub type SharedDispatcher = Arc<Dispatcher>;

impl Dispatcher {
    /// Create a dispatcher and the receiving end of the unified event
    /// stream (consumed by the outbox).
    pub fn new(
        default_version: ProtocolVersion,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<InternalEvent>) {
        let (event_tx, event_rx) = mpsc::channel(event_buffer);
        (
            Self {
                handlers: HashMap::new(),
                default_version,
                event_tx,
                stats: RwLock::new(StatsInner::default()),
                started_at: Instant::now(),
            },
            event_rx,
        )
    }

    /// Register a handler under its version. Later registrations replace
    /// earlier ones.
    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) {
        let version = handler.version();
        info!(%version, "registered protocol handler");
        self.handlers.insert(version, handler);
    }

    pub fn handler_for(&self, version: ProtocolVersion) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.get(&version).cloned()
    }

    /// Versions with a registered handler.
    pub fn supported_versions(&self) -> Vec<ProtocolVersion> {
        self.handlers.keys().copied().collect()
    }

    /// Map the negotiated subprotocol (if any) onto a servable version. A
    /// missing or unrecognized token falls through to the default.
    pub fn resolve(&self, negotiated: Option<ProtocolVersion>) -> ProtocolVersion {
        match negotiated {
            Some(v) if self.handlers.contains_key(&v) => v,
            _ => self.default_version,
        }
    }

    /// Route one inbound frame. Calls yield a response frame; replies are
    /// absorbed into the pending-call table.
    pub async fn dispatch(
        &self,
        session: &mut ChargePointSession,
        frame: OcppFrame,
    ) -> Option<OcppFrame> {
        let version = session.protocol;
        let Some(handler) = self.handlers.get(&version) else {
            warn!(
                charge_point_id = session.charge_point_id.as_str(),
                %version,
                "no handler registered for session version"
            );
            return match frame {
                OcppFrame::Call { message_id, .. } => Some(OcppFrame::error(
                    message_id,
                    OcppErrorCode::NotSupported,
                    format!("{version} is not supported"),
                    serde_json::json!({}),
                )),
                _ => None,
            };
        };

        let start = Instant::now();
        let response = match frame {
            OcppFrame::Call {
                message_id,
                action,
                payload,
            } => {
                let outcome = handler
                    .handle_call(session, &message_id, &action, &payload)
                    .await;
                for event in outcome.events {
                    self.forward(event);
                }
                Some(outcome.response)
            }
            reply => {
                let events = handler.handle_reply(session, &reply).await;
                for event in events {
                    self.forward(event);
                }
                None
            }
        };

        self.record(version, start.elapsed().as_micros());
        metrics::counter!("gateway_frames_dispatched_total", "version" => version.key())
            .increment(1);
        response
    }

    /// Push an event onto the unified stream. Lossy by contract: a full
    /// buffer drops the event with a warning.
    pub fn forward(&self, event: InternalEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    charge_point_id = event.charge_point_id.as_str(),
                    kind = event.kind(),
                    "event buffer full; dropping event"
                );
                metrics::counter!("gateway_events_dropped_total", "reason" => "buffer_full")
                    .increment(1);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event stream closed; dropping event");
            }
        }
    }

    fn record(&self, version: ProtocolVersion, micros: u128) {
        let mut stats = self.stats.write().unwrap();
        *stats.dispatched.entry(version).or_insert(0) += 1;
        stats.total += 1;
        stats.total_micros += micros;
        stats.max_micros = stats.max_micros.max(micros);
    }

    pub fn stats(&self) -> DispatcherStats {
        let stats = self.stats.read().unwrap();
        DispatcherStats {
            dispatched_by_version: stats
                .dispatched
                .iter()
                .map(|(v, n)| (v.key(), *n))
                .collect(),
            total_dispatched: stats.total,
            avg_dispatch_micros: if stats.total == 0 {
                0
            } else {
                stats.total_micros / stats.total as u128
            },
            max_dispatch_micros: stats.max_micros,
            uptime: self.started_at.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::application::handler::v16::tests::{fixture, session};
    use crate::application::handler::v16::{HandlerTimings, Ocpp16Handler};
    use crate::application::registry::PayloadRegistry;
    use crate::infrastructure::store::memory::MemoryConnectionStore;
    use crate::support::clock::{Clock, ManualClock, SequenceIds, SystemClock};

    fn dispatcher_with_v16() -> (Dispatcher, mpsc::Receiver<InternalEvent>) {
        let (mut dispatcher, rx) = Dispatcher::new(ProtocolVersion::V16, 64);
        let clock = Arc::new(SystemClock);
        let store = Arc::new(MemoryConnectionStore::with_clock(clock.clone()));
        let handler = Ocpp16Handler::new(
            "gw-a",
            Arc::new(PayloadRegistry::ocpp16()),
            store,
            clock,
            Arc::new(SequenceIds::default()),
            HandlerTimings::default(),
        );
        dispatcher.register(Arc::new(handler));
        (dispatcher, rx)
    }

    #[test]
    fn resolve_falls_back_to_default() {
        let (dispatcher, _rx) = dispatcher_with_v16();
        assert_eq!(dispatcher.resolve(None), ProtocolVersion::V16);
        assert_eq!(
            dispatcher.resolve(Some(ProtocolVersion::V16)),
            ProtocolVersion::V16
        );
        // registered versions only; 2.0.1 has no handler here
        assert_eq!(
            dispatcher.resolve(Some(ProtocolVersion::V201)),
            ProtocolVersion::V16
        );
    }

    #[tokio::test]
    async fn dispatch_routes_call_and_aggregates_events() {
        let (dispatcher, mut rx) = dispatcher_with_v16();
        let fx = fixture();
        let mut s = session(&fx.clock);

        let frame = OcppFrame::call(
            "b1",
            "BootNotification",
            json!({"chargePointVendor": "V", "chargePointModel": "M"}),
        );
        let response = dispatcher.dispatch(&mut s, frame).await;
        assert!(matches!(response, Some(OcppFrame::CallResult { .. })));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.kind(), "charge_point.connected");
        assert_eq!(second.kind(), "charge_point.registered");

        let stats = dispatcher.stats();
        assert_eq!(stats.total_dispatched, 1);
        assert_eq!(stats.dispatched_by_version.get("1.6"), Some(&1));
    }

    #[tokio::test]
    async fn forward_drops_when_buffer_full() {
        let (dispatcher, _rx) = Dispatcher::new(ProtocolVersion::V16, 1);
        let clock = ManualClock::at(chrono::Utc::now());

        let make = |n: u32| {
            InternalEvent::new(
                format!("e-{n}"),
                "CP-1",
                clock.now_utc(),
                crate::domain::EventBody::Heartbeat {},
            )
        };
        dispatcher.forward(make(1));
        // buffer of 1 is now full; this drop must not panic or block
        dispatcher.forward(make(2));
    }
}
