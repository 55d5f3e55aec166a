//! Command inbox
//!
//! Partition-filtered consumer for the downstream command topic. A
//! gateway only processes records on its owned partitions; everything
//! else is skipped with the offset committed so consumption never stalls.
//! Records that survive the partition filter are decoded, checked against
//! the ownership store and handed to the live session.
//!
//! Offsets commit once a record reaches a terminal decision. In-flight
//! call results never hold a commit back; producers observe outcomes on
//! the event stream, not on offsets.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::domain::Command;
use crate::support::errors::BusError;
use crate::support::shutdown::ShutdownSignal;

use super::ports::{CommandRecord, CommandSource, ConnectionStore, SharedCommandSource, SharedConnectionStore};
use super::registry::SharedPayloadRegistry;

const SOURCE_BACKOFF_BASE: Duration = Duration::from_millis(200);
const SOURCE_BACKOFF_CAP: Duration = Duration::from_secs(30);
const STORE_RETRY_DELAY: Duration = Duration::from_secs(1);

// ── Partition assignment ───────────────────────────────────────

/// FNV-1a, 64-bit. Stable across Rust releases and trivially portable to
/// whatever language the command producers are written in.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Partitions this gateway consumes. Default scheme is the single
/// partition `fnv1a64(gateway_id) mod P`; a non-empty override list
/// replaces it (entries outside `0..P` are discarded).
pub fn owned_partitions(gateway_id: &str, partition_count: i32, overrides: &[i32]) -> Vec<i32> {
    if !overrides.is_empty() {
        let mut owned: Vec<i32> = overrides
            .iter()
            .copied()
            .filter(|p| (0..partition_count).contains(p))
            .collect();
        owned.sort_unstable();
        owned.dedup();
        return owned;
    }
    vec![(fnv1a64(gateway_id.as_bytes()) % partition_count as u64) as i32]
}

// ── Session directory ──────────────────────────────────────────

/// Why a command could not be handed to the local session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverError {
    /// No live session for this charge point on this gateway.
    Offline,
    /// The session's command queue is saturated; fail fast.
    QueueFull,
}

/// Local view of live sessions. Implemented by the WebSocket session
/// registry; the inbox never sees sockets.
pub trait SessionDirectory: Send + Sync {
    fn is_live(&self, charge_point_id: &str) -> bool;
    fn deliver(&self, command: Command) -> Result<(), DeliverError>;
}

pub type SharedSessionDirectory = Arc<dyn SessionDirectory>;

// ── Verdicts ───────────────────────────────────────────────────

/// Terminal decision for one consumed record.
#[derive(Debug, PartialEq)]
pub enum InboxVerdict {
    /// Partition not in this gateway's owned set; skip and commit.
    ForeignPartition,
    /// Undecodable record; commit and count.
    Malformed(String),
    /// The action cannot be issued as a command.
    UnsupportedAction(String),
    /// The ownership store names a different (or no) owner. Expected
    /// during failover; the producer retries after its own lookup.
    OwnershipMismatch { owner: Option<String> },
    /// The charge point has no live session here.
    TargetOffline,
    /// The session's queue rejected the command.
    QueueFull,
    /// Delivered to the session supervisor.
    Delivered,
    /// Transient store failure; re-evaluate the same record later.
    RetryLater,
}

impl InboxVerdict {
    fn label(&self) -> &'static str {
        match self {
            Self::ForeignPartition => "foreign_partition",
            Self::Malformed(_) => "malformed",
            Self::UnsupportedAction(_) => "unsupported_action",
            Self::OwnershipMismatch { .. } => "ownership_mismatch",
            Self::TargetOffline => "target_offline",
            Self::QueueFull => "queue_full",
            Self::Delivered => "delivered",
            Self::RetryLater => "retry_later",
        }
    }
}

// ── Inbox ──────────────────────────────────────────────────────

pub struct CommandInbox {
    source: SharedCommandSource,
    store: SharedConnectionStore,
    registry: SharedPayloadRegistry,
    sessions: SharedSessionDirectory,
    gateway_id: String,
    owned: Vec<i32>,
}

impl CommandInbox {
    pub fn new(
        source: SharedCommandSource,
        store: SharedConnectionStore,
        registry: SharedPayloadRegistry,
        sessions: SharedSessionDirectory,
        gateway_id: impl Into<String>,
        owned: Vec<i32>,
    ) -> Self {
        Self {
            source,
            store,
            registry,
            sessions,
            gateway_id: gateway_id.into(),
            owned,
        }
    }

    pub fn owned(&self) -> &[i32] {
        &self.owned
    }

    /// Consume until the source closes or shutdown fires.
    pub async fn run(self, shutdown: ShutdownSignal) {
        info!(
            gateway_id = self.gateway_id.as_str(),
            owned_partitions = ?self.owned,
            "command inbox started"
        );

        let mut backoff = SOURCE_BACKOFF_BASE;
        loop {
            let record = tokio::select! {
                result = self.source.next() => result,
                _ = shutdown.notified().wait() => break,
            };

            match record {
                Ok(record) => {
                    backoff = SOURCE_BACKOFF_BASE;
                    self.process(record, &shutdown).await;
                }
                Err(BusError::Closed) => break,
                Err(e) => {
                    error!(error = %e, backoff_ms = backoff.as_millis() as u64, "command source error; pausing consumption");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.notified().wait() => break,
                    }
                    backoff = (backoff * 2).min(SOURCE_BACKOFF_CAP);
                }
            }
        }
        info!("command inbox stopped");
    }

    /// Drive one record to a terminal decision, then commit its offset.
    async fn process(&self, record: CommandRecord, shutdown: &ShutdownSignal) {
        let verdict = loop {
            let verdict = self.evaluate(&record).await;
            if verdict != InboxVerdict::RetryLater {
                break verdict;
            }
            debug!(
                partition = record.partition,
                offset = record.offset,
                "ownership store unavailable; retrying record"
            );
            tokio::select! {
                _ = tokio::time::sleep(STORE_RETRY_DELAY) => {}
                // leave the record uncommitted: it re-delivers after restart
                _ = shutdown.notified().wait() => return,
            }
        };

        match &verdict {
            InboxVerdict::Delivered => debug!(
                partition = record.partition,
                offset = record.offset,
                "command delivered"
            ),
            InboxVerdict::ForeignPartition => debug!(
                partition = record.partition,
                offset = record.offset,
                "skipping foreign partition"
            ),
            InboxVerdict::Malformed(reason) => {
                warn!(partition = record.partition, offset = record.offset, reason = reason.as_str(), "malformed command record")
            }
            InboxVerdict::UnsupportedAction(action) => {
                warn!(action = action.as_str(), "unsupported action")
            }
            InboxVerdict::OwnershipMismatch { owner } => {
                warn!(owner = owner.as_deref().unwrap_or("-"), "ownership mismatch; dropping command")
            }
            InboxVerdict::TargetOffline => {
                warn!(partition = record.partition, offset = record.offset, "target offline; rejecting command")
            }
            InboxVerdict::QueueFull => {
                warn!(partition = record.partition, offset = record.offset, "session queue full; rejecting command")
            }
            InboxVerdict::RetryLater => unreachable!("retry verdicts never terminate processing"),
        }
        metrics::counter!("gateway_commands_total", "verdict" => verdict.label()).increment(1);

        if let Err(e) = self.source.commit(&record).await {
            warn!(
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "offset commit failed"
            );
        }
    }

    /// Steps 1–5 of the record pipeline: partition filter, decode, action
    /// check, ownership check, liveness check, delivery.
    async fn evaluate(&self, record: &CommandRecord) -> InboxVerdict {
        if !self.owned.contains(&record.partition) {
            return InboxVerdict::ForeignPartition;
        }

        let command = match Command::decode(&record.payload) {
            Ok(command) => command,
            Err(reason) => return InboxVerdict::Malformed(reason),
        };

        if !self.registry.accepts_command(&command.command_name) {
            return InboxVerdict::UnsupportedAction(command.command_name);
        }

        match self.store.lookup(&command.charge_point_id).await {
            Ok(Some(owner)) if owner == self.gateway_id => {}
            Ok(owner) => return InboxVerdict::OwnershipMismatch { owner },
            Err(_) => return InboxVerdict::RetryLater,
        }

        if !self.sessions.is_live(&command.charge_point_id) {
            return InboxVerdict::TargetOffline;
        }

        match self.sessions.deliver(command) {
            Ok(()) => InboxVerdict::Delivered,
            Err(DeliverError::Offline) => InboxVerdict::TargetOffline,
            Err(DeliverError::QueueFull) => InboxVerdict::QueueFull,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::application::ports::{CommandSource, ConnectionStore};
    use crate::application::registry::PayloadRegistry;
    use crate::infrastructure::store::memory::MemoryConnectionStore;
    use crate::support::clock::SystemClock;

    // ── fixtures ───────────────────────────────────────────

    struct VecSource {
        records: Mutex<VecDeque<CommandRecord>>,
        commits: Mutex<Vec<(i32, i64)>>,
    }

    impl VecSource {
        fn of(records: Vec<CommandRecord>) -> Arc<Self> {
            Arc::new(Self {
                records: Mutex::new(records.into()),
                commits: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandSource for VecSource {
        async fn next(&self) -> Result<CommandRecord, BusError> {
            self.records
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(BusError::Closed)
        }

        async fn commit(&self, record: &CommandRecord) -> Result<(), BusError> {
            self.commits
                .lock()
                .unwrap()
                .push((record.partition, record.offset));
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubDirectory {
        live: Mutex<Vec<String>>,
        delivered: Mutex<Vec<Command>>,
        queue_full: bool,
    }

    impl SessionDirectory for StubDirectory {
        fn is_live(&self, charge_point_id: &str) -> bool {
            self.live
                .lock()
                .unwrap()
                .iter()
                .any(|id| id == charge_point_id)
        }

        fn deliver(&self, command: Command) -> Result<(), DeliverError> {
            if self.queue_full {
                return Err(DeliverError::QueueFull);
            }
            self.delivered.lock().unwrap().push(command);
            Ok(())
        }
    }

    fn record(partition: i32, offset: i64, body: &str) -> CommandRecord {
        CommandRecord {
            partition,
            offset,
            payload: body.as_bytes().to_vec(),
        }
    }

    fn command_json(cp: &str) -> String {
        format!(
            r#"{{"charge_point_id":"{cp}","command_name":"RemoteStartTransaction","message_id":"m-1","payload":{{"idTag":"TAG"}},"timestamp":"0"}}"#
        )
    }

    async fn inbox_with(
        source: Arc<VecSource>,
        directory: Arc<StubDirectory>,
        owned: Vec<i32>,
        owner_entries: &[(&str, &str)],
    ) -> CommandInbox {
        let store = Arc::new(MemoryConnectionStore::with_clock(Arc::new(SystemClock)));
        for (cp, gw) in owner_entries {
            store
                .claim(cp, gw, Duration::from_secs(60))
                .await
                .unwrap();
        }
        CommandInbox::new(
            source,
            store,
            Arc::new(PayloadRegistry::ocpp16()),
            directory,
            "gw-a",
            owned,
        )
    }

    // ── partition math ─────────────────────────────────────

    #[test]
    fn fnv1a64_matches_reference_vectors() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn owned_partitions_is_deterministic_singleton() {
        let a = owned_partitions("gw-a", 3, &[]);
        assert_eq!(a.len(), 1);
        assert!(a[0] >= 0 && a[0] < 3);
        assert_eq!(a, owned_partitions("gw-a", 3, &[]));
    }

    #[test]
    fn owned_partitions_override_wins() {
        assert_eq!(owned_partitions("gw-a", 4, &[2, 0, 2, 9]), vec![0, 2]);
    }

    // ── verdicts ───────────────────────────────────────────

    #[tokio::test]
    async fn happy_path_delivers_and_commits() {
        let source = VecSource::of(vec![]);
        let directory = Arc::new(StubDirectory::default());
        directory.live.lock().unwrap().push("CP-007".to_string());
        let inbox = inbox_with(
            source,
            directory.clone(),
            vec![1],
            &[("CP-007", "gw-a")],
        )
        .await;

        let verdict = inbox.evaluate(&record(1, 0, &command_json("CP-007"))).await;
        assert_eq!(verdict, InboxVerdict::Delivered);
        assert_eq!(directory.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn foreign_partition_is_skipped() {
        let source = VecSource::of(vec![]);
        let directory = Arc::new(StubDirectory::default());
        let inbox = inbox_with(source, directory, vec![1], &[("CP-007", "gw-a")]).await;

        let verdict = inbox.evaluate(&record(2, 0, &command_json("CP-007"))).await;
        assert_eq!(verdict, InboxVerdict::ForeignPartition);
    }

    #[tokio::test]
    async fn ownership_mismatch_is_dropped() {
        let source = VecSource::of(vec![]);
        let directory = Arc::new(StubDirectory::default());
        directory.live.lock().unwrap().push("CP-007".to_string());
        let inbox = inbox_with(
            source,
            directory.clone(),
            vec![1],
            &[("CP-007", "gw-b")],
        )
        .await;

        let verdict = inbox.evaluate(&record(1, 0, &command_json("CP-007"))).await;
        assert_eq!(
            verdict,
            InboxVerdict::OwnershipMismatch {
                owner: Some("gw-b".to_string())
            }
        );
        assert!(directory.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_target_is_rejected() {
        let source = VecSource::of(vec![]);
        let directory = Arc::new(StubDirectory::default());
        let inbox = inbox_with(source, directory, vec![1], &[("CP-007", "gw-a")]).await;

        let verdict = inbox.evaluate(&record(1, 0, &command_json("CP-007"))).await;
        assert_eq!(verdict, InboxVerdict::TargetOffline);
    }

    #[tokio::test]
    async fn malformed_and_unsupported_are_terminal() {
        let source = VecSource::of(vec![]);
        let directory = Arc::new(StubDirectory::default());
        let inbox = inbox_with(source, directory, vec![1], &[]).await;

        assert!(matches!(
            inbox.evaluate(&record(1, 0, "not json")).await,
            InboxVerdict::Malformed(_)
        ));

        let body = r#"{"charge_point_id":"CP","command_name":"BootNotification","message_id":"m","payload":{}}"#;
        assert_eq!(
            inbox.evaluate(&record(1, 0, body)).await,
            InboxVerdict::UnsupportedAction("BootNotification".to_string())
        );
    }

    #[tokio::test]
    async fn queue_full_is_terminal() {
        let source = VecSource::of(vec![]);
        let directory = Arc::new(StubDirectory {
            queue_full: true,
            ..Default::default()
        });
        directory.live.lock().unwrap().push("CP-007".to_string());
        let inbox = inbox_with(source, directory, vec![1], &[("CP-007", "gw-a")]).await;

        let verdict = inbox.evaluate(&record(1, 0, &command_json("CP-007"))).await;
        assert_eq!(verdict, InboxVerdict::QueueFull);
    }

    // ── offset accounting ──────────────────────────────────

    #[tokio::test]
    async fn every_consumed_record_is_committed() {
        let records = vec![
            record(0, 0, &command_json("CP-007")),   // foreign partition
            record(1, 1, "garbage"),                 // malformed
            record(1, 2, &command_json("CP-007")),   // offline target
            record(1, 3, &command_json("CP-404")),   // ownership mismatch
        ];
        let total = records.len();
        let source = VecSource::of(records);
        let directory = Arc::new(StubDirectory::default());
        let inbox = inbox_with(
            source.clone(),
            directory,
            vec![1],
            &[("CP-007", "gw-a")],
        )
        .await;

        let shutdown = ShutdownSignal::new();
        tokio::time::timeout(Duration::from_secs(2), inbox.run(shutdown))
            .await
            .expect("inbox should stop when the source closes");

        assert_eq!(source.commits.lock().unwrap().len(), total);
    }
}
