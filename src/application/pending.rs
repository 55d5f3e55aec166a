//! Pending-call table
//!
//! Tracks outbound Calls awaiting a reply from the charge point. One table
//! per session, owned by the session supervisor; nothing else touches it.
//!
//! Every entry completes exactly once: with the matching CallResult or
//! CallError, with a timeout from the sweep, or with a cancellation when
//! the session drains. The sink is consumed on completion, so double
//! delivery is unrepresentable.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::support::errors::OcppErrorCode;

/// Terminal outcome delivered to a pending call's sink.
#[derive(Debug, Clone, PartialEq)]
pub enum CallReply {
    Result(Value),
    Error {
        code: OcppErrorCode,
        description: String,
        details: Value,
    },
    TimedOut,
    Cancelled(String),
}

impl CallReply {
    /// Short status label used in `command.response` payloads.
    pub fn status_label(&self) -> &'static str {
        match self {
            Self::Result(_) => "completed",
            Self::Error { .. } => "call_error",
            Self::TimedOut => "timeout",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

/// Where the outcome of a pending call goes.
pub enum CompletionSink {
    /// A local waiter (tests, synchronous callers).
    Notify(oneshot::Sender<CallReply>),
    /// A bus command: completion becomes a `remote_command.executed` event.
    Command { command_name: String },
}

impl std::fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Notify(_) => f.write_str("Notify"),
            Self::Command { command_name } => {
                write!(f, "Command({command_name})")
            }
        }
    }
}

/// Completion data handed back when a command-sink call finishes; the
/// caller turns it into an event.
#[derive(Debug)]
pub struct CommandOutcome {
    pub command_name: String,
    pub message_id: String,
    pub reply: CallReply,
}

/// An outstanding outbound Call.
#[derive(Debug)]
pub struct PendingCall {
    pub message_id: String,
    pub action: String,
    pub issued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    sink: CompletionSink,
}

impl PendingCall {
    /// Deliver the outcome, consuming the call. Returns `Some` when the
    /// sink was a bus command and the caller must emit the event.
    pub fn finish(self, reply: CallReply) -> Option<CommandOutcome> {
        match self.sink {
            CompletionSink::Notify(tx) => {
                let _ = tx.send(reply);
                None
            }
            CompletionSink::Command { command_name } => Some(CommandOutcome {
                command_name,
                message_id: self.message_id,
                reply,
            }),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PendingError {
    #[error("a call with message ID {0} is already outstanding")]
    Duplicate(String),
    #[error("pending-call table is full ({0} entries)")]
    Full(usize),
}

/// Per-session table of outstanding calls.
#[derive(Debug)]
pub struct PendingCallTable {
    calls: HashMap<String, PendingCall>,
    max_size: usize,
}

impl PendingCallTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            calls: HashMap::new(),
            max_size,
        }
    }

    /// Register an outstanding call. At most one entry per message ID and
    /// a bounded table size.
    pub fn add(
        &mut self,
        message_id: impl Into<String>,
        action: impl Into<String>,
        issued_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
        sink: CompletionSink,
    ) -> Result<(), PendingError> {
        let message_id = message_id.into();
        if self.calls.contains_key(&message_id) {
            return Err(PendingError::Duplicate(message_id));
        }
        if self.calls.len() >= self.max_size {
            return Err(PendingError::Full(self.max_size));
        }
        self.calls.insert(
            message_id.clone(),
            PendingCall {
                message_id,
                action: action.into(),
                issued_at,
                deadline,
                sink,
            },
        );
        Ok(())
    }

    /// Take the entry for a reply; the caller finishes it. `None` means
    /// the reply is unmatched (late, duplicate, or never ours).
    pub fn complete(&mut self, message_id: &str) -> Option<PendingCall> {
        self.calls.remove(message_id)
    }

    /// Drain every entry; the caller finishes each with a cancellation.
    pub fn cancel_all(&mut self) -> Vec<PendingCall> {
        self.calls.drain().map(|(_, call)| call).collect()
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<PendingCall> {
        let expired: Vec<String> = self
            .calls
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.calls.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.calls.contains_key(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
    }

    fn notify_sink() -> (CompletionSink, oneshot::Receiver<CallReply>) {
        let (tx, rx) = oneshot::channel();
        (CompletionSink::Notify(tx), rx)
    }

    #[test]
    fn add_rejects_duplicate_message_id() {
        let mut table = PendingCallTable::new(8);
        let (sink, _rx) = notify_sink();
        table
            .add("m-1", "Reset", t0(), t0() + chrono::Duration::seconds(30), sink)
            .unwrap();
        let (sink2, _rx2) = notify_sink();
        let err = table
            .add("m-1", "Reset", t0(), t0() + chrono::Duration::seconds(30), sink2)
            .unwrap_err();
        assert_eq!(err, PendingError::Duplicate("m-1".to_string()));
    }

    #[test]
    fn add_respects_bound() {
        let mut table = PendingCallTable::new(2);
        for i in 0..2 {
            let (sink, _rx) = notify_sink();
            table
                .add(
                    format!("m-{i}"),
                    "Reset",
                    t0(),
                    t0() + chrono::Duration::seconds(30),
                    sink,
                )
                .unwrap();
        }
        let (sink, _rx) = notify_sink();
        assert_eq!(
            table
                .add("m-9", "Reset", t0(), t0() + chrono::Duration::seconds(30), sink)
                .unwrap_err(),
            PendingError::Full(2)
        );
    }

    #[tokio::test]
    async fn complete_delivers_exactly_once() {
        let mut table = PendingCallTable::new(8);
        let (sink, rx) = notify_sink();
        table
            .add("m-1", "Reset", t0(), t0() + chrono::Duration::seconds(30), sink)
            .unwrap();

        let call = table.complete("m-1").expect("entry present");
        assert!(call.finish(CallReply::Result(json!({"status": "Accepted"}))).is_none());
        assert_eq!(rx.await.unwrap(), CallReply::Result(json!({"status": "Accepted"})));

        // the ID is free again: a second complete finds nothing,
        // and the ID may be reused by a fresh add
        assert!(table.complete("m-1").is_none());
        let (sink, _rx) = notify_sink();
        assert!(table
            .add("m-1", "Reset", t0(), t0() + chrono::Duration::seconds(30), sink)
            .is_ok());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let mut table = PendingCallTable::new(8);
        let (s1, _r1) = notify_sink();
        let (s2, _r2) = notify_sink();
        table
            .add("old", "Reset", t0(), t0() + chrono::Duration::seconds(10), s1)
            .unwrap();
        table
            .add("new", "Reset", t0(), t0() + chrono::Duration::seconds(120), s2)
            .unwrap();

        let expired = table.sweep_expired(t0() + chrono::Duration::seconds(30));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message_id, "old");
        assert!(table.contains("new"));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn cancel_all_empties_table_and_notifies_sinks() {
        let mut table = PendingCallTable::new(8);
        let (s1, r1) = notify_sink();
        table
            .add("a", "Reset", t0(), t0() + chrono::Duration::seconds(30), s1)
            .unwrap();
        table
            .add(
                "b",
                "RemoteStartTransaction",
                t0(),
                t0() + chrono::Duration::seconds(30),
                CompletionSink::Command {
                    command_name: "RemoteStartTransaction".to_string(),
                },
            )
            .unwrap();

        let cancelled = table.cancel_all();
        assert!(table.is_empty());
        assert_eq!(cancelled.len(), 2);

        let mut command_outcomes = 0;
        for call in cancelled {
            if let Some(outcome) =
                call.finish(CallReply::Cancelled("gateway shutting down".to_string()))
            {
                command_outcomes += 1;
                assert_eq!(outcome.reply.status_label(), "cancelled");
            }
        }
        assert_eq!(command_outcomes, 1);
        assert_eq!(
            r1.await.unwrap(),
            CallReply::Cancelled("gateway shutting down".to_string())
        );
    }
}
