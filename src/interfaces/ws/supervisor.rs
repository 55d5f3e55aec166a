//! Session supervisor
//!
//! One supervisor per WebSocket connection, split into the three loops the
//! lifecycle needs:
//!
//! - **reader**: owns the [`ChargePointSession`]; decodes frames, feeds
//!   the dispatcher, issues downstream commands, sweeps pending calls;
//! - **writer**: drains the outbound queue with a per-write deadline;
//! - **keepalive**: pings, pong/idle deadlines, ownership renewal.
//!
//! All session mutation happens on the reader loop; the other loops talk
//! through channels and the shared atomics.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::application::dispatcher::SharedDispatcher;
use crate::application::handler::{CommandRejection, ProtocolHandler};
use crate::application::pending::CallReply;
use crate::application::ports::{ClaimOutcome, ConnectionStore, RenewOutcome, SharedConnectionStore};
use crate::application::session::{ChargePointSession, SessionShared, SessionState};
use crate::domain::{Command, DisconnectReason, EventBody, InternalEvent, ProtocolVersion};
use crate::support::clock::{SharedClock, SharedIds};
use crate::support::errors::OcppErrorCode;
use crate::support::frame::OcppFrame;
use crate::support::shutdown::ShutdownSignal;

use super::registry::SharedSessionRegistry;

/// Cancellation message delivered to every pending call when the session
/// drains.
const DRAIN_CANCEL_REASON: &str = "gateway shutting down";

// ── Config ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub gateway_id: String,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub claim_ttl: Duration,
    pub renew_interval: Duration,
    pub sweep_interval: Duration,
    pub max_message_bytes: usize,
    pub outbound_queue: usize,
    pub command_queue: usize,
    pub max_pending_calls: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            gateway_id: "gateway".to_string(),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(900),
            write_timeout: Duration::from_secs(60),
            claim_ttl: Duration::from_secs(90),
            renew_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            max_message_bytes: 1024 * 1024,
            outbound_queue: 1000,
            command_queue: 64,
            max_pending_calls: 256,
        }
    }
}

// ── Outbound queue items ───────────────────────────────────────

enum Outbound {
    Frame(OcppFrame),
    Ping,
    Close { code: CloseCode, reason: &'static str },
}

// ── Supervisor ─────────────────────────────────────────────────

pub struct SessionSupervisor {
    registry: SharedSessionRegistry,
    dispatcher: SharedDispatcher,
    store: SharedConnectionStore,
    clock: SharedClock,
    ids: SharedIds,
    config: SupervisorConfig,
}

impl SessionSupervisor {
    pub fn new(
        registry: SharedSessionRegistry,
        dispatcher: SharedDispatcher,
        store: SharedConnectionStore,
        clock: SharedClock,
        ids: SharedIds,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            store,
            clock,
            ids,
            config,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Drive one connection from handshake completion to close.
    pub async fn run<S>(
        &self,
        ws: WebSocketStream<S>,
        charge_point_id: String,
        negotiated: Option<ProtocolVersion>,
        remote_addr: Option<String>,
        shutdown: ShutdownSignal,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let version = self.dispatcher.resolve(negotiated);
        let Some(handler) = self.dispatcher.handler_for(version) else {
            warn!(charge_point_id = charge_point_id.as_str(), %version, "no handler for version; dropping connection");
            return;
        };

        let now = self.clock.now_utc();
        let shared = Arc::new(SessionShared::new(now));
        let mut session = ChargePointSession::new(
            charge_point_id.clone(),
            version,
            now,
            self.config.max_pending_calls,
            shared.clone(),
        );
        session.remote_addr = remote_addr;

        let (out_tx, out_rx) = mpsc::channel::<Outbound>(self.config.outbound_queue);
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(self.config.command_queue);
        let drain = ShutdownSignal::new();

        let (seq, _outcome) = self.registry.register(
            &charge_point_id,
            version,
            now,
            cmd_tx,
            shared.clone(),
            drain.clone(),
        );

        info!(
            charge_point_id = charge_point_id.as_str(),
            %version,
            "session supervisor started"
        );

        // Initial ownership claim; Boot and the keepalive loop re-try.
        match self
            .store
            .claim(&charge_point_id, &self.config.gateway_id, self.config.claim_ttl)
            .await
        {
            Ok(ClaimOutcome::Claimed) => shared.set_ownership_confirmed(true),
            Ok(ClaimOutcome::AlreadyOwned { owner }) if owner == self.config.gateway_id => {
                shared.set_ownership_confirmed(true)
            }
            Ok(ClaimOutcome::AlreadyOwned { owner }) => {
                warn!(
                    charge_point_id = charge_point_id.as_str(),
                    owner = owner.as_str(),
                    "charge point owned by another gateway; waiting for its TTL"
                );
            }
            Err(e) => {
                warn!(charge_point_id = charge_point_id.as_str(), error = %e, "initial claim failed");
            }
        }

        let (ws_sink, ws_stream) = ws.split();

        let writer = tokio::spawn(write_loop(
            ws_sink,
            out_rx,
            self.config.write_timeout,
            shared.clone(),
            drain.clone(),
            charge_point_id.clone(),
        ));

        let keepalive = tokio::spawn(keepalive_loop(
            self.store.clone(),
            self.clock.clone(),
            shared.clone(),
            out_tx.clone(),
            drain.clone(),
            shutdown.clone(),
            self.config.clone(),
            charge_point_id.clone(),
        ));

        self.reader_loop(
            ws_stream,
            &mut session,
            handler.as_ref(),
            &mut cmd_rx,
            &out_tx,
            &drain,
            &shutdown,
        )
        .await;

        // ── Drain & close ──────────────────────────────────
        drain.trigger();
        session.transition(SessionState::Draining);

        let reason = shared
            .close_reason()
            .unwrap_or(DisconnectReason::PeerClosed);

        for event in handler.cancel_pending(&mut session, DRAIN_CANCEL_REASON) {
            self.dispatcher.forward(event);
        }
        self.dispatcher.forward(InternalEvent::new(
            self.ids.next_id(),
            charge_point_id.clone(),
            self.clock.now_utc(),
            EventBody::Disconnected { reason },
        ));

        // 1001 towards the peer when this side initiated the close
        if !matches!(
            reason,
            DisconnectReason::PeerClosed | DisconnectReason::SocketError
        ) {
            let _ = out_tx.try_send(Outbound::Close {
                code: CloseCode::Away,
                reason: DRAIN_CANCEL_REASON,
            });
        }
        drop(out_tx);
        let _ = timeout(self.config.write_timeout, writer).await;
        keepalive.abort();

        self.registry.unregister(&charge_point_id, seq);

        // A replaced session must not release the binding its successor on
        // this gateway is about to renew.
        if shared.ownership_confirmed() && reason != DisconnectReason::Replaced {
            let release = self
                .store
                .release(&charge_point_id, &self.config.gateway_id);
            if timeout(Duration::from_secs(2), release).await.is_err() {
                debug!(
                    charge_point_id = charge_point_id.as_str(),
                    "ownership release timed out; TTL will clean up"
                );
            }
        }

        session.transition(SessionState::Closed);
        info!(
            charge_point_id = charge_point_id.as_str(),
            reason = reason.as_str(),
            "session closed"
        );
    }

    #[allow(clippy::too_many_arguments)]
    async fn reader_loop<S>(
        &self,
        mut ws_stream: SplitStream<WebSocketStream<S>>,
        session: &mut ChargePointSession,
        handler: &dyn ProtocolHandler,
        cmd_rx: &mut mpsc::Receiver<Command>,
        out_tx: &mpsc::Sender<Outbound>,
        drain: &ShutdownSignal,
        shutdown: &ShutdownSignal,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let shared = session.shared();
        let mut sweep = interval_at(
            Instant::now() + self.config.sweep_interval,
            self.config.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_msg = ws_stream.next() => {
                    match maybe_msg {
                        Some(Ok(message)) => {
                            if !self.handle_message(session, handler, message, out_tx).await {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            info!(
                                charge_point_id = session.charge_point_id.as_str(),
                                error = %e,
                                "websocket error"
                            );
                            shared.set_close_reason(DisconnectReason::SocketError);
                            break;
                        }
                        None => {
                            shared.set_close_reason(DisconnectReason::PeerClosed);
                            break;
                        }
                    }
                }
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(command) => self.issue_command(session, handler, command, out_tx),
                        // channel closed: this session was evicted
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    for event in handler.sweep_pending(session, self.clock.now_utc()) {
                        self.dispatcher.forward(event);
                    }
                }
                _ = drain.notified().wait() => break,
                _ = shutdown.notified().wait() => {
                    shared.set_close_reason(DisconnectReason::GatewayShutdown);
                    break;
                }
            }

            if session.state() == SessionState::Draining {
                break;
            }
        }
    }

    /// Returns `false` when the session must close.
    async fn handle_message(
        &self,
        session: &mut ChargePointSession,
        handler: &dyn ProtocolHandler,
        message: Message,
        out_tx: &mpsc::Sender<Outbound>,
    ) -> bool {
        let shared = session.shared();
        match message {
            Message::Text(text) => {
                shared.touch(self.clock.now_utc());
                match OcppFrame::decode(&text, self.config.max_message_bytes) {
                    Ok(frame) => {
                        if let Some(response) = self.dispatcher.dispatch(session, frame).await {
                            self.send_frame(session, out_tx, response);
                        }
                    }
                    Err(e) => {
                        debug!(
                            charge_point_id = session.charge_point_id.as_str(),
                            error = %e,
                            "frame decode failed"
                        );
                        let message_id = e.message_id().unwrap_or("-1").to_string();
                        self.send_frame(
                            session,
                            out_tx,
                            OcppFrame::error(
                                message_id,
                                OcppErrorCode::FormationViolation,
                                e.to_string(),
                                serde_json::json!({}),
                            ),
                        );
                    }
                }
                true
            }
            Message::Binary(data) => {
                warn!(
                    charge_point_id = session.charge_point_id.as_str(),
                    bytes = data.len(),
                    "binary frame received; closing"
                );
                shared.set_close_reason(DisconnectReason::ProtocolViolation);
                let _ = out_tx.try_send(Outbound::Close {
                    code: CloseCode::Unsupported,
                    reason: "text frames only",
                });
                false
            }
            Message::Ping(_) => {
                // tungstenite queues the pong; count it as activity
                shared.touch(self.clock.now_utc());
                true
            }
            Message::Pong(_) => {
                shared.record_pong(self.clock.now_utc());
                true
            }
            Message::Close(frame) => {
                debug!(
                    charge_point_id = session.charge_point_id.as_str(),
                    frame = ?frame,
                    "close frame received"
                );
                shared.set_close_reason(DisconnectReason::PeerClosed);
                false
            }
            Message::Frame(_) => true,
        }
    }

    fn issue_command(
        &self,
        session: &mut ChargePointSession,
        handler: &dyn ProtocolHandler,
        command: Command,
        out_tx: &mpsc::Sender<Outbound>,
    ) {
        let command_name = command.command_name.clone();
        let message_id = command.message_id.clone();
        match handler.issue_command(session, &command) {
            Ok(frame) => {
                let sent_id = frame.message_id().to_string();
                if out_tx.try_send(Outbound::Frame(frame)).is_err() {
                    warn!(
                        charge_point_id = session.charge_point_id.as_str(),
                        command = command_name.as_str(),
                        "outbound queue full; failing command fast"
                    );
                    if let Some(call) = session.pending.complete(&sent_id) {
                        if let Some(outcome) =
                            call.finish(CallReply::Cancelled("queue_full".to_string()))
                        {
                            self.dispatcher.forward(InternalEvent::new(
                                self.ids.next_id(),
                                session.charge_point_id.clone(),
                                self.clock.now_utc(),
                                EventBody::CommandExecuted {
                                    command_name: outcome.command_name,
                                    message_id: outcome.message_id,
                                    status: "rejected".to_string(),
                                    response: None,
                                    error: Some("outbound queue full".to_string()),
                                },
                            ));
                        }
                    }
                }
            }
            Err(rejection) => {
                warn!(
                    charge_point_id = session.charge_point_id.as_str(),
                    command = command_name.as_str(),
                    error = %rejection,
                    "command rejected"
                );
                let status = match rejection {
                    CommandRejection::NotLive => "target_offline",
                    _ => "rejected",
                };
                self.dispatcher.forward(InternalEvent::new(
                    self.ids.next_id(),
                    session.charge_point_id.clone(),
                    self.clock.now_utc(),
                    EventBody::CommandExecuted {
                        command_name,
                        message_id,
                        status: status.to_string(),
                        response: None,
                        error: Some(rejection.to_string()),
                    },
                ));
            }
        }
    }

    fn send_frame(
        &self,
        session: &ChargePointSession,
        out_tx: &mpsc::Sender<Outbound>,
        frame: OcppFrame,
    ) {
        if out_tx.try_send(Outbound::Frame(frame)).is_err() {
            warn!(
                charge_point_id = session.charge_point_id.as_str(),
                "outbound queue full; dropping frame"
            );
            metrics::counter!("gateway_frames_dropped_total", "reason" => "queue_full")
                .increment(1);
        }
    }
}

// ── Writer loop ────────────────────────────────────────────────

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut out_rx: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
    shared: Arc<SessionShared>,
    drain: ShutdownSignal,
    charge_point_id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(item) = out_rx.recv().await {
        let (message, is_close) = match item {
            Outbound::Frame(frame) => (Message::Text(frame.encode()), false),
            Outbound::Ping => (Message::Ping(Vec::new()), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };

        match timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {
                if is_close {
                    break;
                }
            }
            Ok(Err(e)) => {
                info!(charge_point_id = charge_point_id.as_str(), error = %e, "write failed");
                shared.set_close_reason(DisconnectReason::SocketError);
                drain.trigger();
                break;
            }
            Err(_) => {
                warn!(
                    charge_point_id = charge_point_id.as_str(),
                    timeout_secs = write_timeout.as_secs(),
                    "write stuck; terminating session"
                );
                shared.set_close_reason(DisconnectReason::WriteTimeout);
                drain.trigger();
                break;
            }
        }
    }
    let _ = timeout(Duration::from_secs(2), sink.close()).await;
}

// ── Keepalive loop ─────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn keepalive_loop(
    store: SharedConnectionStore,
    clock: SharedClock,
    shared: Arc<SessionShared>,
    out_tx: mpsc::Sender<Outbound>,
    drain: ShutdownSignal,
    shutdown: ShutdownSignal,
    config: SupervisorConfig,
    charge_point_id: String,
) {
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut renew = interval_at(Instant::now() + config.renew_interval, config.renew_interval);
    renew.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                let now_ms = clock.now_utc().timestamp_millis();
                let idle_ms = now_ms - shared.last_activity_ms();
                if idle_ms > config.idle_timeout.as_millis() as i64 {
                    info!(
                        charge_point_id = charge_point_id.as_str(),
                        idle_secs = idle_ms / 1000,
                        "idle timeout"
                    );
                    shared.set_close_reason(DisconnectReason::IdleTimeout);
                    drain.trigger();
                    return;
                }

                if out_tx.try_send(Outbound::Ping).is_err() {
                    // queue jammed; the writer deadline will handle it
                    continue;
                }
                let sent_ms = clock.now_utc().timestamp_millis();

                tokio::select! {
                    _ = tokio::time::sleep(config.pong_timeout) => {
                        if shared.last_pong_ms() < sent_ms {
                            warn!(
                                charge_point_id = charge_point_id.as_str(),
                                timeout_secs = config.pong_timeout.as_secs(),
                                "pong timeout"
                            );
                            shared.set_close_reason(DisconnectReason::PongTimeout);
                            drain.trigger();
                            return;
                        }
                    }
                    _ = drain.notified().wait() => return,
                    _ = shutdown.notified().wait() => return,
                }
            }
            _ = renew.tick() => {
                if shared.ownership_confirmed() {
                    match store.renew(&charge_point_id, &config.gateway_id, config.claim_ttl).await {
                        Ok(RenewOutcome::Renewed) => {}
                        Ok(RenewOutcome::Lost) => {
                            warn!(
                                charge_point_id = charge_point_id.as_str(),
                                "ownership lost; draining session"
                            );
                            shared.set_ownership_confirmed(false);
                            shared.set_close_reason(DisconnectReason::OwnershipLost);
                            drain.trigger();
                            return;
                        }
                        Err(e) => {
                            warn!(
                                charge_point_id = charge_point_id.as_str(),
                                error = %e,
                                "renew failed; retrying on next tick"
                            );
                        }
                    }
                } else {
                    // a foreign owner may still hold the key; keep trying
                    // to take over until its TTL lapses
                    match store.claim(&charge_point_id, &config.gateway_id, config.claim_ttl).await {
                        Ok(ClaimOutcome::Claimed) => {
                            info!(
                                charge_point_id = charge_point_id.as_str(),
                                "ownership acquired after prior owner lapsed"
                            );
                            shared.set_ownership_confirmed(true);
                            if shared.state() == SessionState::Booted {
                                shared.transition(SessionState::Live);
                            }
                        }
                        Ok(ClaimOutcome::AlreadyOwned { owner })
                            if owner == config.gateway_id =>
                        {
                            shared.set_ownership_confirmed(true);
                        }
                        Ok(ClaimOutcome::AlreadyOwned { owner }) => {
                            debug!(
                                charge_point_id = charge_point_id.as_str(),
                                owner = owner.as_str(),
                                "still owned elsewhere"
                            );
                        }
                        Err(e) => {
                            warn!(
                                charge_point_id = charge_point_id.as_str(),
                                error = %e,
                                "claim retry failed"
                            );
                        }
                    }
                }
            }
            _ = drain.notified().wait() => return,
            _ = shutdown.notified().wait() => return,
        }
    }
}
