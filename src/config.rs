//! Application configuration
//!
//! TOML-based, with defaults for every knob so an empty file (or none at
//! all) yields a runnable local gateway. Contradictory settings refuse
//! startup: `validate` runs once at boot and its errors are fatal.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::application::handler::v16::HandlerTimings;
use crate::domain::ProtocolVersion;
use crate::interfaces::ws::supervisor::SupervisorConfig;
use crate::interfaces::ws::server::WsServerConfig;
use crate::support::errors::ConfigError;

/// Default config location: `<user config dir>/ocpp-gateway/gateway.toml`.
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocpp-gateway")
        .join("gateway.toml")
}

// ── Sections ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Base path for charge point connections: `/{ws_path}/{chargePointId}`.
    pub ws_path: String,
    pub handshake_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub write_buffer_size: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            ws_path: "ocpp".to_string(),
            handshake_timeout_secs: 10,
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
            idle_timeout_secs: 900,
            write_timeout_secs: 60,
            write_buffer_size: 128 * 1024,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Unique instance identity. When empty, `OCPP_GATEWAY_ID`, then
    /// `HOSTNAME` (the orchestrator-assigned pod name), then a random
    /// suffix decide.
    pub id: String,
    pub default_protocol: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            id: String::new(),
            default_protocol: "1.6".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub url: String,
    pub ttl_secs: u64,
    pub renew_interval_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            ttl_secs: 90,
            renew_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    pub topic: String,
    pub buffer: usize,
    pub publish_wait_ms: u64,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            topic: "ocpp-events".to_string(),
            buffer: 50_000,
            publish_wait_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsSection {
    pub topic: String,
    pub partitions: i32,
    pub group_id: String,
    /// Overrides the hash-derived partition assignment when non-empty.
    pub partition_override: Vec<i32>,
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            topic: "ocpp-commands".to_string(),
            partitions: 3,
            group_id: "ocpp-gateway".to_string(),
            partition_override: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub brokers: String,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            brokers: "127.0.0.1:9092".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcppSection {
    pub heartbeat_interval_secs: u64,
    pub call_timeout_secs: u64,
    pub pending_sweep_interval_secs: u64,
    pub max_pending_calls: usize,
    pub max_message_bytes: usize,
    pub outbound_queue: usize,
    pub command_queue: usize,
}

impl Default for OcppSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 300,
            call_timeout_secs: 30,
            pending_sweep_interval_secs: 60,
            max_pending_calls: 256,
            max_message_bytes: 1024 * 1024,
            outbound_queue: 1000,
            command_queue: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ── AppConfig ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub gateway: GatewaySection,
    pub store: StoreSection,
    pub events: EventsSection,
    pub commands: CommandsSection,
    pub bus: BusSection,
    pub ocpp: OcppSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: AppConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject contradictory settings before anything starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.renew_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "store.renew_interval_secs must be positive".to_string(),
            ));
        }
        // TTL is the only defense against silently dead gateways; it must
        // comfortably outlast the renewal cadence.
        if self.store.ttl_secs < self.store.renew_interval_secs * 3 {
            return Err(ConfigError::Invalid(format!(
                "store.ttl_secs ({}) must be at least 3x renew_interval_secs ({})",
                self.store.ttl_secs, self.store.renew_interval_secs
            )));
        }
        if self.server.pong_timeout_secs >= self.server.ping_interval_secs {
            return Err(ConfigError::Invalid(
                "server.pong_timeout_secs must be shorter than ping_interval_secs".to_string(),
            ));
        }
        if self.commands.partitions < 1 {
            return Err(ConfigError::Invalid(
                "commands.partitions must be at least 1".to_string(),
            ));
        }
        for p in &self.commands.partition_override {
            if !(0..self.commands.partitions).contains(p) {
                return Err(ConfigError::Invalid(format!(
                    "commands.partition_override entry {p} outside 0..{}",
                    self.commands.partitions
                )));
            }
        }
        if self.ocpp.max_message_bytes < 4096 {
            return Err(ConfigError::Invalid(
                "ocpp.max_message_bytes must be at least 4096".to_string(),
            ));
        }
        if ProtocolVersion::normalize(&self.gateway.default_protocol).is_none() {
            return Err(ConfigError::Invalid(format!(
                "gateway.default_protocol {} is not a known version",
                self.gateway.default_protocol
            )));
        }
        if self.events.buffer == 0 || self.ocpp.outbound_queue == 0 {
            return Err(ConfigError::Invalid(
                "channel buffers must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolved unique identity of this instance.
    pub fn gateway_id(&self) -> String {
        if !self.gateway.id.is_empty() {
            return self.gateway.id.clone();
        }
        if let Ok(id) = std::env::var("OCPP_GATEWAY_ID") {
            if !id.is_empty() {
                return id;
            }
        }
        if let Ok(host) = std::env::var("HOSTNAME") {
            if !host.is_empty() {
                return host;
            }
        }
        format!("gateway-{}", uuid::Uuid::new_v4().simple())
    }

    pub fn default_protocol(&self) -> ProtocolVersion {
        ProtocolVersion::normalize(&self.gateway.default_protocol)
            .unwrap_or(ProtocolVersion::V16)
    }

    pub fn ws_server_config(&self) -> WsServerConfig {
        WsServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            ws_path: self.server.ws_path.clone(),
            handshake_timeout: Duration::from_secs(self.server.handshake_timeout_secs),
            max_message_bytes: self.ocpp.max_message_bytes,
            write_buffer_size: self.server.write_buffer_size,
        }
    }

    pub fn supervisor_config(&self, gateway_id: &str) -> SupervisorConfig {
        SupervisorConfig {
            gateway_id: gateway_id.to_string(),
            ping_interval: Duration::from_secs(self.server.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.server.pong_timeout_secs),
            idle_timeout: Duration::from_secs(self.server.idle_timeout_secs),
            write_timeout: Duration::from_secs(self.server.write_timeout_secs),
            claim_ttl: Duration::from_secs(self.store.ttl_secs),
            renew_interval: Duration::from_secs(self.store.renew_interval_secs),
            sweep_interval: Duration::from_secs(self.ocpp.pending_sweep_interval_secs),
            max_message_bytes: self.ocpp.max_message_bytes,
            outbound_queue: self.ocpp.outbound_queue,
            command_queue: self.ocpp.command_queue,
            max_pending_calls: self.ocpp.max_pending_calls,
        }
    }

    pub fn handler_timings(&self) -> HandlerTimings {
        HandlerTimings {
            heartbeat_interval: Duration::from_secs(self.ocpp.heartbeat_interval_secs),
            call_timeout: Duration::from_secs(self.ocpp.call_timeout_secs),
            claim_ttl: Duration::from_secs(self.store.ttl_secs),
        }
    }

    pub fn publish_wait(&self) -> Duration {
        Duration::from_millis(self.events.publish_wait_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_valid_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.ocpp.heartbeat_interval_secs, 300);
        assert_eq!(config.commands.partitions, 3);
        assert_eq!(config.default_protocol(), ProtocolVersion::V16);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            port = 8080

            [store]
            url = "redis://redis.internal:6379"
            ttl_secs = 120
            renew_interval_secs = 40

            [commands]
            topic = "cp-commands"
            partitions = 6
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.store.ttl_secs, 120);
        assert_eq!(config.commands.topic, "cp-commands");
        assert_eq!(config.events.topic, "ocpp-events");
    }

    #[test]
    fn ttl_must_outlast_renewal_by_3x() {
        let config: AppConfig = toml::from_str(
            r#"
            [store]
            ttl_secs = 60
            renew_interval_secs = 30
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partition_override_must_be_in_range() {
        let config: AppConfig = toml::from_str(
            r#"
            [commands]
            partitions = 3
            partition_override = [0, 5]
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_default_protocol_is_fatal() {
        let config: AppConfig = toml::from_str(
            r#"
            [gateway]
            default_protocol = "2.1"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_gateway_id_wins() {
        let config: AppConfig = toml::from_str(
            r#"
            [gateway]
            id = "gw-west-1"
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway_id(), "gw-west-1");
    }
}
