//! Charge-point session state
//!
//! One [`ChargePointSession`] per WebSocket connection. Only the session's
//! supervisor mutates it; the parts other tasks must observe (state,
//! activity timestamps, close reason) live in the shared, atomically
//! updated [`SessionShared`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{ConnectorStatus, DisconnectReason, ProtocolVersion};

use super::pending::PendingCallTable;

// ── Session state machine ──────────────────────────────────────

/// Coarse per-session states: `Connecting → Booted → Live ↔ Draining → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Booted = 1,
    Live = 2,
    Draining = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Booted,
            2 => Self::Live,
            3 => Self::Draining,
            _ => Self::Closed,
        }
    }

    /// Whether new inbound/outbound work is accepted in this state.
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Connecting | Self::Booted | Self::Live)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "Connecting",
            Self::Booted => "Booted",
            Self::Live => "Live",
            Self::Draining => "Draining",
            Self::Closed => "Closed",
        };
        f.write_str(s)
    }
}

// ── Shared view ────────────────────────────────────────────────

/// The slice of session state visible outside the supervisor task.
pub struct SessionShared {
    state: AtomicU8,
    /// True once this gateway's claim on the charge point is confirmed. A
    /// session with a foreign owner stays out of `Live` until the claim
    /// lands (the keepalive loop keeps retrying).
    ownership_confirmed: AtomicBool,
    last_activity_ms: AtomicI64,
    last_pong_ms: AtomicI64,
    close_reason: Mutex<Option<DisconnectReason>>,
}

impl SessionShared {
    pub fn new(now: DateTime<Utc>) -> Self {
        let now_ms = now.timestamp_millis();
        Self {
            state: AtomicU8::new(SessionState::Connecting as u8),
            ownership_confirmed: AtomicBool::new(false),
            last_activity_ms: AtomicI64::new(now_ms),
            last_pong_ms: AtomicI64::new(now_ms),
            close_reason: Mutex::new(None),
        }
    }

    pub fn ownership_confirmed(&self) -> bool {
        self.ownership_confirmed.load(Ordering::SeqCst)
    }

    pub fn set_ownership_confirmed(&self, confirmed: bool) {
        self.ownership_confirmed.store(confirmed, Ordering::SeqCst);
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Apply a transition. Draining is sticky: once entered, only `Closed`
    /// is accepted; `Closed` is terminal. Returns the state actually in
    /// effect afterwards.
    pub fn transition(&self, to: SessionState) -> SessionState {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let from = SessionState::from_u8(current);
            let allowed = match from {
                SessionState::Closed => false,
                SessionState::Draining => to == SessionState::Closed,
                _ => true,
            };
            if !allowed {
                return from;
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return to,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn is_live(&self) -> bool {
        self.state() == SessionState::Live
    }

    pub fn touch(&self, now: DateTime<Utc>) {
        self.last_activity_ms
            .store(now.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::SeqCst)
    }

    pub fn record_pong(&self, now: DateTime<Utc>) {
        self.last_pong_ms
            .store(now.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn last_pong_ms(&self) -> i64 {
        self.last_pong_ms.load(Ordering::SeqCst)
    }

    /// First writer wins; later reasons are ignored.
    pub fn set_close_reason(&self, reason: DisconnectReason) {
        let mut guard = self.close_reason.lock().unwrap();
        guard.get_or_insert(reason);
    }

    pub fn close_reason(&self) -> Option<DisconnectReason> {
        *self.close_reason.lock().unwrap()
    }
}

// ── Boot info ──────────────────────────────────────────────────

/// Identity the station reported in its BootNotification.
#[derive(Debug, Clone, PartialEq)]
pub struct BootInfo {
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub accepted_at: DateTime<Utc>,
}

// ── Session ────────────────────────────────────────────────────

/// Mutable per-connection state, owned by the supervisor task.
pub struct ChargePointSession {
    pub charge_point_id: String,
    pub protocol: ProtocolVersion,
    pub connected_at: DateTime<Utc>,
    pub remote_addr: Option<String>,
    pub boot_info: Option<BootInfo>,
    pub pending: PendingCallTable,
    connectors: HashMap<u64, ConnectorStatus>,
    shared: Arc<SessionShared>,
}

impl ChargePointSession {
    pub fn new(
        charge_point_id: impl Into<String>,
        protocol: ProtocolVersion,
        connected_at: DateTime<Utc>,
        max_pending_calls: usize,
        shared: Arc<SessionShared>,
    ) -> Self {
        Self {
            charge_point_id: charge_point_id.into(),
            protocol,
            connected_at,
            remote_addr: None,
            boot_info: None,
            pending: PendingCallTable::new(max_pending_calls),
            connectors: HashMap::new(),
            shared,
        }
    }

    pub fn shared(&self) -> Arc<SessionShared> {
        self.shared.clone()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn transition(&self, to: SessionState) -> SessionState {
        let from = self.shared.state();
        let now = self.shared.transition(to);
        if now == to && from != to {
            debug!(
                charge_point_id = self.charge_point_id.as_str(),
                from = %from,
                to = %to,
                "session state transition"
            );
        }
        now
    }

    pub fn is_live(&self) -> bool {
        self.shared.is_live()
    }

    pub fn ownership_confirmed(&self) -> bool {
        self.shared.ownership_confirmed()
    }

    pub fn set_ownership_confirmed(&self, confirmed: bool) {
        self.shared.set_ownership_confirmed(confirmed);
    }

    /// Record a connector status and return the previous one
    /// (`Unavailable` when this connector was never seen before).
    pub fn record_connector_status(
        &mut self,
        connector_id: u64,
        status: ConnectorStatus,
    ) -> ConnectorStatus {
        self.connectors
            .insert(connector_id, status)
            .unwrap_or(ConnectorStatus::Unavailable)
    }

    pub fn connector_status(&self, connector_id: u64) -> Option<ConnectorStatus> {
        self.connectors.get(&connector_id).copied()
    }

    pub fn connector_count(&self) -> usize {
        self.connectors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ChargePointSession {
        let now = Utc::now();
        ChargePointSession::new(
            "CP-001",
            ProtocolVersion::V16,
            now,
            16,
            Arc::new(SessionShared::new(now)),
        )
    }

    #[test]
    fn previous_status_defaults_to_unavailable() {
        let mut s = session();
        let prev = s.record_connector_status(1, ConnectorStatus::Charging);
        assert_eq!(prev, ConnectorStatus::Unavailable);
        let prev = s.record_connector_status(1, ConnectorStatus::Finishing);
        assert_eq!(prev, ConnectorStatus::Charging);
    }

    #[test]
    fn draining_is_sticky() {
        let s = session();
        assert_eq!(s.transition(SessionState::Booted), SessionState::Booted);
        assert_eq!(s.transition(SessionState::Live), SessionState::Live);
        assert_eq!(s.transition(SessionState::Draining), SessionState::Draining);
        // cannot re-enter Live once draining
        assert_eq!(s.transition(SessionState::Live), SessionState::Draining);
        assert_eq!(s.transition(SessionState::Closed), SessionState::Closed);
        // terminal
        assert_eq!(s.transition(SessionState::Live), SessionState::Closed);
    }

    #[test]
    fn close_reason_first_writer_wins() {
        let shared = SessionShared::new(Utc::now());
        shared.set_close_reason(DisconnectReason::IdleTimeout);
        shared.set_close_reason(DisconnectReason::PeerClosed);
        assert_eq!(shared.close_reason(), Some(DisconnectReason::IdleTimeout));
    }
}
