//! Protocol handlers
//!
//! A [`ProtocolHandler`] owns the semantic state machine for one OCPP
//! version. The dispatcher picks the handler by negotiated version and
//! feeds it frames; the handler answers with response frames and internal
//! events. Handlers are stateless services; all per-connection state
//! lives in the [`ChargePointSession`] passed in by the supervisor.

pub mod v16;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{Command, InternalEvent, ProtocolVersion};
use crate::support::errors::Violation;
use crate::support::frame::OcppFrame;

use super::session::ChargePointSession;

/// Result of handling one inbound Call.
#[derive(Debug)]
pub struct CallOutcome {
    pub response: OcppFrame,
    pub events: Vec<InternalEvent>,
}

/// Why a downstream command could not be turned into an outbound Call.
#[derive(Debug, Error)]
pub enum CommandRejection {
    #[error("unsupported action: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Invalid(#[from] Violation),
    #[error("a call with message ID {0} is already in flight")]
    DuplicateMessageId(String),
    #[error("pending-call table is full")]
    QueueFull,
    #[error("session does not accept new work")]
    NotLive,
}

/// Per-version protocol semantics.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn version(&self) -> ProtocolVersion;

    /// Apply an inbound Call: validate, transition, respond, emit events.
    /// Never fails; failures become `CallError` responses.
    async fn handle_call(
        &self,
        session: &mut ChargePointSession,
        message_id: &str,
        action: &str,
        payload: &Value,
    ) -> CallOutcome;

    /// Correlate an inbound CallResult/CallError with a pending call.
    /// Unmatched replies are dropped with a warning.
    async fn handle_reply(
        &self,
        session: &mut ChargePointSession,
        frame: &OcppFrame,
    ) -> Vec<InternalEvent>;

    /// Turn a downstream command into an outbound Call, registering the
    /// pending entry.
    fn issue_command(
        &self,
        session: &mut ChargePointSession,
        command: &Command,
    ) -> Result<OcppFrame, CommandRejection>;

    /// Time out pending calls whose deadline has passed.
    fn sweep_pending(
        &self,
        session: &mut ChargePointSession,
        now: DateTime<Utc>,
    ) -> Vec<InternalEvent>;

    /// Cancel every pending call (session drain).
    fn cancel_pending(
        &self,
        session: &mut ChargePointSession,
        reason: &str,
    ) -> Vec<InternalEvent>;
}
