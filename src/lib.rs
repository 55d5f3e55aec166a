//! # OCPP Gateway
//!
//! Horizontally scalable gateway between OCPP 1.6 charge points and a
//! backend event/command bus. Each charge point holds a long-lived
//! WebSocket session with one gateway instance; upstream business events
//! are published keyed by charge point ID, downstream commands are routed
//! back to whichever instance currently owns the charge point.
//!
//! ## Architecture
//!
//! - **support**: Cross-cutting utilities (errors, framing, shutdown, time, ID generation)
//! - **domain**: Core value objects (protocol versions, connector states, events, commands)
//! - **application**: Message pipeline (payload registry, pending calls, handlers, dispatcher, outbox, inbox)
//! - **infrastructure**: External backends (Redis connection store, Kafka transports)
//! - **interfaces**: Delivery mechanism (WebSocket endpoint, session supervision)
//! - **config**: Application configuration (TOML-based)

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interfaces;
pub mod server;
pub mod support;

// Re-export commonly used types at crate root
pub use config::{default_config_path, AppConfig};
pub use server::Gateway;
pub use support::frame::OcppFrame;
