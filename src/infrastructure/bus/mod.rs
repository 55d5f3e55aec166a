//! Kafka transports for the event and command topics.

pub mod consumer;
pub mod producer;

pub use consumer::KafkaCommandSource;
pub use producer::KafkaEventTransport;
