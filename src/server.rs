//! Gateway assembly
//!
//! Builds the long-lived services once at startup (connection store,
//! payload registry, dispatcher, outbox, inbox, WebSocket server), wires
//! them together and runs them under one shutdown coordinator.
//!
//! Shutdown order matters and is fixed:
//!
//! 1. stop consuming commands (inbox);
//! 2. drain every session supervisor (bounded by the shutdown timeout);
//! 3. flush and close the event producer;
//! 4. release remaining ownership entries best-effort.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};

use crate::application::dispatcher::Dispatcher;
use crate::application::handler::v16::Ocpp16Handler;
use crate::application::inbox::{owned_partitions, CommandInbox};
use crate::application::outbox::EventOutbox;
use crate::application::ports::{
    ConnectionStore, EventTransport, SharedCommandSource, SharedConnectionStore,
    SharedEventTransport,
};
use crate::application::registry::PayloadRegistry;
use crate::config::AppConfig;
use crate::infrastructure::bus::{KafkaCommandSource, KafkaEventTransport};
use crate::infrastructure::store::redis::RedisConnectionStore;
use crate::interfaces::ws::negotiator::ProtocolNegotiator;
use crate::interfaces::ws::registry::SessionRegistry;
use crate::interfaces::ws::server::WsServer;
use crate::interfaces::ws::supervisor::SessionSupervisor;
use crate::support::clock::{SystemClock, UuidSource};
use crate::support::shutdown::{ShutdownCoordinator, ShutdownSignal};

pub struct Gateway {
    config: AppConfig,
    gateway_id: String,
    store: SharedConnectionStore,
    transport: SharedEventTransport,
    source: SharedCommandSource,
}

impl Gateway {
    /// Connect the backends and assemble the gateway. Fails fast when a
    /// backend is unreachable or the config is contradictory.
    pub async fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        config.validate()?;
        let gateway_id = config.gateway_id();
        info!(gateway_id = gateway_id.as_str(), "building gateway");

        let store: SharedConnectionStore =
            Arc::new(RedisConnectionStore::connect(&config.store.url).await?);
        let transport: SharedEventTransport = Arc::new(KafkaEventTransport::new(
            &config.bus.brokers,
            config.events.topic.clone(),
        )?);
        let source: SharedCommandSource = Arc::new(KafkaCommandSource::new(
            &config.bus.brokers,
            &config.commands.group_id,
            config.commands.topic.clone(),
        )?);

        Ok(Self {
            config,
            gateway_id,
            store,
            transport,
            source,
        })
    }

    /// Test/build seam: assemble against explicit backends.
    pub fn with_backends(
        config: AppConfig,
        store: SharedConnectionStore,
        transport: SharedEventTransport,
        source: SharedCommandSource,
    ) -> Self {
        let gateway_id = config.gateway_id();
        Self {
            config,
            gateway_id,
            store,
            transport,
            source,
        }
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    /// Run until an OS signal (or `stop` on the returned coordinator's
    /// signal) arrives, then shut down in order.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let clock = Arc::new(SystemClock);
        let ids = Arc::new(UuidSource);
        let registry = Arc::new(PayloadRegistry::ocpp16());
        let sessions = SessionRegistry::shared();

        // ── Dispatcher + handlers ──────────────────────────
        let (mut dispatcher, event_rx) =
            Dispatcher::new(self.config.default_protocol(), self.config.events.buffer);
        dispatcher.register(Arc::new(Ocpp16Handler::new(
            self.gateway_id.clone(),
            registry.clone(),
            self.store.clone(),
            clock.clone(),
            ids.clone(),
            self.config.handler_timings(),
        )));
        let dispatcher = Arc::new(dispatcher);

        // ── Shutdown coordination ──────────────────────────
        let coordinator = ShutdownCoordinator::new(self.config.server.shutdown_timeout_secs);
        coordinator.start_signal_listener();

        // The inbox closes first on shutdown; sessions drain next.
        let inbox_signal = ShutdownSignal::new();
        let session_signal = ShutdownSignal::new();

        // ── Outbox ─────────────────────────────────────────
        let outbox = EventOutbox::new(
            self.transport.clone(),
            self.gateway_id.clone(),
            self.config.publish_wait(),
        );
        let outbox_signal = ShutdownSignal::new();
        let outbox_task = tokio::spawn(outbox.run(event_rx, outbox_signal.clone()));

        // ── Inbox ──────────────────────────────────────────
        let owned = owned_partitions(
            &self.gateway_id,
            self.config.commands.partitions,
            &self.config.commands.partition_override,
        );
        info!(owned_partitions = ?owned, "partition assignment");
        let inbox = CommandInbox::new(
            self.source.clone(),
            self.store.clone(),
            registry.clone(),
            sessions.clone(),
            self.gateway_id.clone(),
            owned,
        );
        let inbox_task = tokio::spawn(inbox.run(inbox_signal.clone()));

        // ── WebSocket server ───────────────────────────────
        let supervisor = Arc::new(SessionSupervisor::new(
            sessions.clone(),
            dispatcher.clone(),
            self.store.clone(),
            clock,
            ids,
            self.config.supervisor_config(&self.gateway_id),
        ));
        let ws_server = WsServer::new(
            self.config.ws_server_config(),
            ProtocolNegotiator::new(dispatcher.supported_versions()),
            supervisor,
            session_signal.clone(),
        );

        // a server failure (e.g. port in use) takes the whole gateway down
        let ws_failed = coordinator.signal();
        let ws_task = tokio::spawn(async move {
            if let Err(e) = ws_server.run().await {
                warn!(error = %e, "websocket server exited with error");
                ws_failed.trigger();
            }
        });

        info!(
            gateway_id = self.gateway_id.as_str(),
            "gateway started; press Ctrl+C to stop"
        );

        // ── Ordered stop ───────────────────────────────────
        let shutdown_timeout = self.config.shutdown_timeout();
        let store = self.store.clone();
        let transport = self.transport.clone();
        let gateway_id = self.gateway_id.clone();
        let drain_sessions = sessions.clone();

        coordinator
            .shutdown_with_cleanup(|| async move {
                // 1. no new commands
                inbox_signal.trigger();
                let _ = timeout(Duration::from_secs(5), inbox_task).await;

                // 2. drain sessions
                session_signal.trigger();
                drain_sessions.drain_all();
                let drain_deadline = tokio::time::Instant::now() + shutdown_timeout / 2;
                while drain_sessions.count() > 0
                    && tokio::time::Instant::now() < drain_deadline
                {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                let _ = timeout(Duration::from_secs(5), ws_task).await;

                // 3. flush the producer
                outbox_signal.trigger();
                let _ = timeout(Duration::from_secs(5), outbox_task).await;
                transport.flush(Duration::from_secs(5)).await;

                // 4. release leftovers; TTL covers whatever remains
                for charge_point_id in drain_sessions.connected_ids() {
                    let _ = timeout(
                        Duration::from_secs(1),
                        store.release(&charge_point_id, &gateway_id),
                    )
                    .await;
                }
            })
            .await;

        info!("gateway shutdown complete");
        Ok(())
    }
}
