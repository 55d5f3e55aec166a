//! OCPP WebSocket server
//!
//! Accepts charge-point connections at `ws://<host>:<port>/<ws-path>/{chargePointId}`.
//! The handshake extracts the charge point ID from the final path segment
//! and negotiates the OCPP subprotocol; each accepted socket is handed to
//! a session supervisor on its own task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{error, info, warn};

use crate::domain::ProtocolVersion;
use crate::support::shutdown::ShutdownSignal;

use super::negotiator::ProtocolNegotiator;
use super::supervisor::SessionSupervisor;

#[derive(Debug, Clone)]
pub struct WsServerConfig {
    pub host: String,
    pub port: u16,
    /// Base path under which charge points connect, e.g. `ocpp` for
    /// `/ocpp/{chargePointId}`.
    pub ws_path: String,
    pub handshake_timeout: Duration,
    pub max_message_bytes: usize,
    pub write_buffer_size: usize,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            ws_path: "ocpp".to_string(),
            handshake_timeout: Duration::from_secs(10),
            max_message_bytes: 1024 * 1024,
            write_buffer_size: 128 * 1024,
        }
    }
}

impl WsServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub struct WsServer {
    config: WsServerConfig,
    negotiator: Arc<ProtocolNegotiator>,
    supervisor: Arc<SessionSupervisor>,
    shutdown: ShutdownSignal,
}

impl WsServer {
    pub fn new(
        config: WsServerConfig,
        negotiator: ProtocolNegotiator,
        supervisor: Arc<SessionSupervisor>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            negotiator: Arc::new(negotiator),
            supervisor,
            shutdown,
        }
    }

    /// Accept connections until shutdown fires.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let addr = self.config.address();
        let listener = TcpListener::bind(&addr).await?;
        info!(
            "OCPP gateway listening on ws://{}/{}/{{charge_point_id}}",
            addr,
            self.config.ws_path.trim_matches('/')
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }
                _ = self.shutdown.notified().wait() => {
                    info!("websocket server received shutdown signal");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let config = self.config.clone();
        let negotiator = self.negotiator.clone();
        let supervisor = self.supervisor.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) =
                handle_connection(stream, peer, config, negotiator, supervisor, shutdown).await
            {
                info!(peer = %peer, error = e.as_str(), "connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: WsServerConfig,
    negotiator: Arc<ProtocolNegotiator>,
    supervisor: Arc<SessionSupervisor>,
    shutdown: ShutdownSignal,
) -> Result<(), String> {
    let mut charge_point_id: Option<String> = None;
    let mut negotiated: Option<ProtocolVersion> = None;

    let base_path = config.ws_path.clone();
    let callback = |req: &Request, mut response: Response| {
        let path = req.uri().path();
        let header = req
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        match negotiator.negotiate(header) {
            Some((version, token)) => {
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", token.parse().unwrap());
                negotiated = Some(version);
            }
            None if !header.is_empty() => {
                warn!(
                    peer = %peer,
                    subprotocols = header,
                    "no recognized subprotocol; using default version"
                );
            }
            None => {}
        }

        match extract_charge_point_id(path, &base_path) {
            Some(id) => {
                charge_point_id = Some(id);
                Ok(response)
            }
            None => {
                warn!(peer = %peer, path, "rejecting connection with invalid path");
                let mut not_found = ErrorResponse::new(Some("charge point ID missing".to_string()));
                *not_found.status_mut() =
                    tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
                Err(not_found)
            }
        }
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_bytes);
    ws_config.max_frame_size = Some(config.max_message_bytes);
    ws_config.write_buffer_size = config.write_buffer_size;

    let accept = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config));
    let ws = timeout(config.handshake_timeout, accept)
        .await
        .map_err(|_| "handshake timed out".to_string())?
        .map_err(|e| e.to_string())?;

    // set by the callback on every accepted handshake
    let Some(charge_point_id) = charge_point_id else {
        return Err("handshake completed without a charge point ID".to_string());
    };

    info!(charge_point_id = charge_point_id.as_str(), peer = %peer, "charge point connected");
    supervisor
        .run(
            ws,
            charge_point_id,
            negotiated,
            Some(peer.to_string()),
            shutdown,
        )
        .await;
    Ok(())
}

/// Charge point ID is the final path segment; the leading segments must
/// match the configured base path (a bare `/{id}` is tolerated).
fn extract_charge_point_id(path: &str, base: &str) -> Option<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let segments: Vec<&str> = trimmed.split('/').collect();
    let id = segments.last().filter(|s| !s.is_empty())?;

    if segments.len() == 1 {
        return Some((*id).to_string());
    }

    let base_segments: Vec<&str> = base
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    if segments[..segments.len() - 1] == base_segments[..] {
        Some((*id).to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_id_under_base_path() {
        assert_eq!(
            extract_charge_point_id("/ocpp/CP-001", "ocpp"),
            Some("CP-001".to_string())
        );
        assert_eq!(
            extract_charge_point_id("/ws/ocpp/CP-001", "ws/ocpp"),
            Some("CP-001".to_string())
        );
        assert_eq!(
            extract_charge_point_id("/CP-001", "ocpp"),
            Some("CP-001".to_string())
        );
    }

    #[test]
    fn rejects_wrong_base_or_empty_id() {
        assert_eq!(extract_charge_point_id("/other/CP-001", "ocpp"), None);
        assert_eq!(extract_charge_point_id("/", "ocpp"), None);
        assert_eq!(extract_charge_point_id("/ocpp/", "ocpp"), None);
    }

    #[test]
    fn id_is_case_sensitive_and_opaque() {
        assert_eq!(
            extract_charge_point_id("/ocpp/cp-lower", "ocpp"),
            Some("cp-lower".to_string())
        );
        assert_eq!(
            extract_charge_point_id("/ocpp/CP%20001", "ocpp"),
            Some("CP%20001".to_string())
        );
    }
}
