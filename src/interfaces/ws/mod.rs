//! OCPP WebSocket endpoint: accept loop, subprotocol negotiation, session
//! registry and per-connection supervision.

pub mod negotiator;
pub mod registry;
pub mod server;
pub mod supervisor;

pub use negotiator::ProtocolNegotiator;
pub use registry::{SessionRegistry, SharedSessionRegistry};
pub use server::{WsServer, WsServerConfig};
pub use supervisor::{SessionSupervisor, SupervisorConfig};
