//! Core value objects shared across the pipeline.

pub mod command;
pub mod connector;
pub mod events;
pub mod meter;
pub mod version;

pub use command::Command;
pub use connector::ConnectorStatus;
pub use events::{DisconnectReason, EventBody, EventSeverity, InternalEvent};
pub use meter::{MeterSample, SampledValue};
pub use version::ProtocolVersion;
