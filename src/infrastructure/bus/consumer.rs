//! Kafka command consumer
//!
//! Consumer-group member for the command topic with auto-commit disabled:
//! the inbox commits each offset explicitly once the record reaches a
//! terminal decision. Rebalancing may hand this member partitions beyond
//! its owned set; those records are skipped-and-committed by the inbox's
//! partition filter.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use tracing::info;

use crate::application::ports::{CommandRecord, CommandSource};
use crate::support::errors::BusError;

pub struct KafkaCommandSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaCommandSource {
    pub fn new(
        brokers: &str,
        group_id: &str,
        topic: impl Into<String>,
    ) -> Result<Self, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        let topic = topic.into();
        consumer
            .subscribe(&[&topic])
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        info!(brokers, group_id, topic = topic.as_str(), "command consumer subscribed");
        Ok(Self { consumer, topic })
    }
}

#[async_trait]
impl CommandSource for KafkaCommandSource {
    async fn next(&self) -> Result<CommandRecord, BusError> {
        match self.consumer.recv().await {
            Ok(message) => Ok(CommandRecord {
                partition: message.partition(),
                offset: message.offset(),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            }),
            Err(e) => Err(BusError::Unavailable(e.to_string())),
        }
    }

    async fn commit(&self, record: &CommandRecord) -> Result<(), BusError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&self.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| BusError::Unavailable(e.to_string()))
    }
}
