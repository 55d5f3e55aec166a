//! Internal events
//!
//! Everything noteworthy that happens on a session becomes an
//! [`InternalEvent`]: an immutable record with a shared base (ID, charge
//! point, timestamp, severity) and a variant-specific body. The outbox
//! turns these into the external envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::connector::ConnectorStatus;
use super::meter::MeterSample;
use super::version::ProtocolVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

/// Why a session ended; serialized into the disconnect event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    PeerClosed,
    IdleTimeout,
    PongTimeout,
    WriteTimeout,
    OwnershipLost,
    GatewayShutdown,
    ProtocolViolation,
    Replaced,
    SocketError,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::IdleTimeout => "idle_timeout",
            Self::PongTimeout => "pong_timeout",
            Self::WriteTimeout => "write_timeout",
            Self::OwnershipLost => "ownership_lost",
            Self::GatewayShutdown => "gateway_shutdown",
            Self::ProtocolViolation => "protocol_violation",
            Self::Replaced => "replaced",
            Self::SocketError => "socket_error",
        }
    }
}

/// Variant-specific event payload.
///
/// Field names serialize in camelCase; these bodies are embedded verbatim
/// as the `payload` object of the external envelope. Timestamps inside
/// bodies are unix-ms decimal strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "kind")]
pub enum EventBody {
    #[serde(rename_all = "camelCase")]
    Connected {
        protocol: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        remote_addr: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Registered {
        vendor: String,
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        serial_number: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        firmware_version: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Disconnected { reason: DisconnectReason },
    Heartbeat {},
    #[serde(rename_all = "camelCase")]
    ConnectorStatusChanged {
        connector_id: u64,
        status: ConnectorStatus,
        previous_status: ConnectorStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        info: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TransactionStarted {
        transaction_id: i64,
        connector_id: u64,
        id_tag: String,
        meter_start: i64,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    TransactionStopped {
        transaction_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        id_tag: Option<String>,
        meter_stop: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: String,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        meter_values: Vec<MeterSample>,
    },
    #[serde(rename_all = "camelCase")]
    MeterValuesReceived {
        connector_id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        transaction_id: Option<i64>,
        meter_values: Vec<MeterSample>,
    },
    #[serde(rename_all = "camelCase")]
    ProtocolError {
        error_kind: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CommandExecuted {
        command_name: String,
        message_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl EventBody {
    /// Internal event-type name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "charge_point.connected",
            Self::Registered { .. } => "charge_point.registered",
            Self::Disconnected { .. } => "charge_point.disconnected",
            Self::Heartbeat {} => "charge_point.heartbeat",
            Self::ConnectorStatusChanged { .. } => "connector.status_changed",
            Self::TransactionStarted { .. } => "transaction.started",
            Self::TransactionStopped { .. } => "transaction.stopped",
            Self::MeterValuesReceived { .. } => "meter_values.received",
            Self::ProtocolError { .. } => "protocol.error",
            Self::CommandExecuted { .. } => "remote_command.executed",
        }
    }

    fn default_severity(&self) -> EventSeverity {
        match self {
            Self::ProtocolError { .. } => EventSeverity::Warning,
            _ => EventSeverity::Info,
        }
    }
}

/// An immutable event produced by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalEvent {
    pub event_id: String,
    pub charge_point_id: String,
    pub occurred_at: DateTime<Utc>,
    pub severity: EventSeverity,
    pub body: EventBody,
}

impl InternalEvent {
    pub fn new(
        event_id: String,
        charge_point_id: impl Into<String>,
        occurred_at: DateTime<Utc>,
        body: EventBody,
    ) -> Self {
        let severity = body.default_severity();
        Self {
            event_id,
            charge_point_id: charge_point_id.into(),
            occurred_at,
            severity,
            body,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }
}

/// Helper for the connected event's protocol field.
pub fn protocol_label(version: ProtocolVersion) -> String {
    version.subprotocol().to_string()
}
