//! Session registry
//!
//! Live charge-point sessions on this gateway instance, keyed by charge
//! point ID. The registry hands the command inbox an opaque channel into
//! each session; it never exposes sockets or session internals.
//!
//! A second connection for the same charge point evicts the first: the old
//! supervisor is told to drain and the new session takes the slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::application::inbox::{DeliverError, SessionDirectory};
use crate::application::session::SessionShared;
use crate::domain::{Command, DisconnectReason, ProtocolVersion};
use crate::support::shutdown::ShutdownSignal;

/// Registry entry for one live session.
pub struct SessionHandle {
    pub charge_point_id: String,
    pub protocol: ProtocolVersion,
    pub connected_at: DateTime<Utc>,
    /// Registration sequence number; guards unregister against racing a
    /// replacement session for the same charge point.
    pub seq: u64,
    commands: mpsc::Sender<Command>,
    shared: Arc<SessionShared>,
    drain: ShutdownSignal,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    New,
    /// An existing session for this charge point was told to drain.
    Replaced,
}

pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
    next_seq: AtomicU64,
}

pub type SharedSessionRegistry = Arc<SessionRegistry>;

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn shared() -> SharedSessionRegistry {
        Arc::new(Self::new())
    }

    /// Register a session, evicting any existing one for the same ID.
    pub fn register(
        &self,
        charge_point_id: &str,
        protocol: ProtocolVersion,
        connected_at: DateTime<Utc>,
        commands: mpsc::Sender<Command>,
        shared: Arc<SessionShared>,
        drain: ShutdownSignal,
    ) -> (u64, RegisterOutcome) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let handle = SessionHandle {
            charge_point_id: charge_point_id.to_string(),
            protocol,
            connected_at,
            seq,
            commands,
            shared,
            drain,
        };

        let outcome = match self.sessions.insert(charge_point_id.to_string(), handle) {
            Some(old) => {
                warn!(
                    charge_point_id,
                    old_seq = old.seq,
                    new_seq = seq,
                    "evicting stale session; new connection replaces old"
                );
                old.shared.set_close_reason(DisconnectReason::Replaced);
                old.drain.trigger();
                RegisterOutcome::Replaced
            }
            None => {
                info!(charge_point_id, %protocol, "session registered");
                RegisterOutcome::New
            }
        };

        metrics::gauge!("gateway_connected_charge_points").set(self.sessions.len() as f64);
        (seq, outcome)
    }

    /// Remove the session, but only if it still is the registration this
    /// sequence number belongs to.
    pub fn unregister(&self, charge_point_id: &str, seq: u64) {
        let removed = self
            .sessions
            .remove_if(charge_point_id, |_, handle| handle.seq == seq);
        if removed.is_some() {
            info!(charge_point_id, "session unregistered");
            metrics::gauge!("gateway_connected_charge_points").set(self.sessions.len() as f64);
        }
    }

    pub fn is_connected(&self, charge_point_id: &str) -> bool {
        self.sessions.contains_key(charge_point_id)
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn protocol_of(&self, charge_point_id: &str) -> Option<ProtocolVersion> {
        self.sessions.get(charge_point_id).map(|h| h.protocol)
    }

    /// Tell every session to drain (gateway shutdown).
    pub fn drain_all(&self) {
        for entry in self.sessions.iter() {
            entry.shared.set_close_reason(DisconnectReason::GatewayShutdown);
            entry.drain.trigger();
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDirectory for SessionRegistry {
    fn is_live(&self, charge_point_id: &str) -> bool {
        self.sessions
            .get(charge_point_id)
            .map(|handle| handle.shared.is_live())
            .unwrap_or(false)
    }

    fn deliver(&self, command: Command) -> Result<(), DeliverError> {
        let Some(handle) = self.sessions.get(&command.charge_point_id) else {
            return Err(DeliverError::Offline);
        };
        if !handle.shared.is_live() {
            return Err(DeliverError::Offline);
        }
        match handle.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DeliverError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliverError::Offline),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::application::session::SessionState;

    fn shared_live() -> Arc<SessionShared> {
        let shared = Arc::new(SessionShared::new(Utc::now()));
        shared.transition(SessionState::Booted);
        shared.transition(SessionState::Live);
        shared
    }

    fn command(cp: &str) -> Command {
        Command {
            charge_point_id: cp.to_string(),
            command_name: "ClearCache".to_string(),
            message_id: "m".to_string(),
            payload: json!({}),
            timestamp: String::new(),
        }
    }

    #[test]
    fn register_evicts_previous_session() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let drain1 = ShutdownSignal::new();
        let (seq1, outcome) = registry.register(
            "CP-1",
            ProtocolVersion::V16,
            Utc::now(),
            tx1,
            shared_live(),
            drain1.clone(),
        );
        assert_eq!(outcome, RegisterOutcome::New);

        let (tx2, _rx2) = mpsc::channel(4);
        let (seq2, outcome) = registry.register(
            "CP-1",
            ProtocolVersion::V16,
            Utc::now(),
            tx2,
            shared_live(),
            ShutdownSignal::new(),
        );
        assert_eq!(outcome, RegisterOutcome::Replaced);
        assert!(drain1.is_triggered());
        assert_ne!(seq1, seq2);

        // the old supervisor's late unregister must not remove the new session
        registry.unregister("CP-1", seq1);
        assert!(registry.is_connected("CP-1"));
        registry.unregister("CP-1", seq2);
        assert!(!registry.is_connected("CP-1"));
    }

    #[test]
    fn deliver_checks_liveness_and_queue() {
        let registry = SessionRegistry::new();
        assert_eq!(
            registry.deliver(command("CP-1")),
            Err(DeliverError::Offline)
        );

        // connected but not yet Live
        let (tx, _rx) = mpsc::channel(1);
        let shared = Arc::new(SessionShared::new(Utc::now()));
        registry.register(
            "CP-1",
            ProtocolVersion::V16,
            Utc::now(),
            tx,
            shared.clone(),
            ShutdownSignal::new(),
        );
        assert!(!registry.is_live("CP-1"));
        assert_eq!(
            registry.deliver(command("CP-1")),
            Err(DeliverError::Offline)
        );

        shared.transition(SessionState::Booted);
        shared.transition(SessionState::Live);
        assert!(registry.is_live("CP-1"));
        assert_eq!(registry.deliver(command("CP-1")), Ok(()));
        // capacity 1 is now exhausted
        assert_eq!(
            registry.deliver(command("CP-1")),
            Err(DeliverError::QueueFull)
        );
    }
}
