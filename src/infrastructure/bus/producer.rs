//! Kafka event producer
//!
//! Upstream envelopes are published keyed by charge point ID so the broker
//! keeps per-CP ordering inside one partition. Leader-only acks and
//! compression; delivery is bounded by `message.timeout.ms`.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use tracing::info;

use crate::application::ports::EventTransport;
use crate::support::errors::BusError;

pub struct KafkaEventTransport {
    producer: FutureProducer,
    topic: String,
}

impl KafkaEventTransport {
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "1")
            .set("compression.type", "lz4")
            .set("message.timeout.ms", "10000")
            .set("queue.buffering.max.ms", "5")
            .create()
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        let topic = topic.into();
        info!(brokers, topic = topic.as_str(), "event producer created");
        Ok(Self { producer, topic })
    }
}

#[async_trait]
impl EventTransport for KafkaEventTransport {
    async fn publish(
        &self,
        key: &str,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<(), BusError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(&payload);

        // `deadline` bounds the wait for producer-queue space; a queue that
        // stays full past it is the downstream-overload signal.
        match self.producer.send(record, Timeout::After(deadline)).await {
            Ok(_delivery) => Ok(()),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                Err(BusError::PublishTimeout)
            }
            Err((e, _)) => Err(BusError::Unavailable(e.to_string())),
        }
    }

    async fn flush(&self, deadline: Duration) {
        let _ = self.producer.flush(Timeout::After(deadline));
    }
}
