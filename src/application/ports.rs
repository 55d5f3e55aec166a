//! Ports to the two external backends
//!
//! The pipeline only ever sees these traits; Redis and Kafka live behind
//! them in `infrastructure`, and tests substitute in-memory twins.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::support::errors::{BusError, StoreError};

// ── Connection store ───────────────────────────────────────────

/// Result of a `claim` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the charge point.
    Claimed,
    /// Another gateway holds the binding.
    AlreadyOwned { owner: String },
}

/// Result of a `renew` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed,
    /// The key now belongs to someone else (or vanished and was re-claimed);
    /// the session must drain.
    Lost,
}

/// Mapping charge point → owning gateway, with TTL.
///
/// All three mutators are atomic compare-and-swap with respect to
/// concurrent callers. The TTL is the only mechanism that clears bindings
/// left behind by a silently dead gateway.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Set only if absent. On success the caller owns the charge point.
    async fn claim(
        &self,
        charge_point_id: &str,
        gateway_id: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Refresh the TTL only if the current owner is `gateway_id`.
    async fn renew(
        &self,
        charge_point_id: &str,
        gateway_id: &str,
        ttl: Duration,
    ) -> Result<RenewOutcome, StoreError>;

    /// Delete only if the current owner is `gateway_id`; no-op otherwise.
    async fn release(&self, charge_point_id: &str, gateway_id: &str) -> Result<(), StoreError>;

    /// Current owner, if any.
    async fn lookup(&self, charge_point_id: &str) -> Result<Option<String>, StoreError>;
}

pub type SharedConnectionStore = Arc<dyn ConnectionStore>;

// ── Event transport (upstream) ─────────────────────────────────

/// Keyed publisher for the event topic.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Publish `payload` keyed by `key`, waiting at most `deadline` for the
    /// producer to accept it.
    async fn publish(&self, key: &str, payload: Vec<u8>, deadline: Duration)
        -> Result<(), BusError>;

    /// Flush in-flight records on shutdown.
    async fn flush(&self, deadline: Duration);
}

pub type SharedEventTransport = Arc<dyn EventTransport>;

// ── Command source (downstream) ────────────────────────────────

/// One record from the command topic, before any interpretation.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Partitioned consumer for the command topic. Offsets are committed
/// explicitly, once a record reaches a terminal decision.
#[async_trait]
pub trait CommandSource: Send + Sync {
    async fn next(&self) -> Result<CommandRecord, BusError>;
    async fn commit(&self, record: &CommandRecord) -> Result<(), BusError>;
}

pub type SharedCommandSource = Arc<dyn CommandSource>;
