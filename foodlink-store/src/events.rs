use async_trait::async_trait;
use foodlink_core::events::{EventSink, SinkError};
use foodlink_shared::EventEnvelope;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Fans envelopes out to in-process subscribers
#[derive(Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<EventEnvelope>,
    require_subscribers: bool,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            require_subscribers: false,
        }
    }

    /// Fail publishes while nobody listens, so the relay keeps the rows
    pub fn require_subscribers(mut self) -> Self {
        self.require_subscribers = true;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
        match self.tx.send(envelope.clone()) {
            Ok(receivers) => {
                debug!(
                    topic = %envelope.event.topic(),
                    donation_id = %envelope.donation_id,
                    sequence = envelope.sequence,
                    receivers,
                    "Broadcast event"
                );
                Ok(())
            }
            Err(_) if self.require_subscribers => Err(SinkError::Transport(
                "no subscribers for in-process events".to_string(),
            )),
            Err(_) => {
                warn!(
                    topic = %envelope.event.topic(),
                    donation_id = %envelope.donation_id,
                    sequence = envelope.sequence,
                    "No subscribers, event dropped"
                );
                Ok(())
            }
        }
    }
}

#[cfg(feature = "kafka")]
pub use kafka::KafkaEventSink;

#[cfg(feature = "kafka")]
mod kafka {
    use super::*;
    use rdkafka::config::ClientConfig;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use rdkafka::util::Timeout;
    use std::time::Duration;
    use tracing::{error, info};

    use crate::app_config::KafkaConfig;

    /// One topic per event type, keyed by donation id so a partition sees
    /// every event of a donation in order.
    #[derive(Clone)]
    pub struct KafkaEventSink {
        producer: FutureProducer,
    }

    impl KafkaEventSink {
        pub fn new(config: &KafkaConfig) -> Result<Self, rdkafka::error::KafkaError> {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", &config.brokers)
                .set("message.timeout.ms", config.message_timeout_ms.to_string())
                .set("enable.idempotence", "true")
                .create()?;

            Ok(Self { producer })
        }
    }

    #[async_trait]
    impl EventSink for KafkaEventSink {
        async fn publish(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
            let topic = envelope.event.topic();
            let key = envelope.donation_id.to_string();
            let payload = serde_json::to_string(envelope)?;

            let record = FutureRecord::to(&topic).key(&key).payload(&payload);

            match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
                Ok(delivery) => {
                    info!(
                        "Sent {} to {}/{}: partition {} offset {}",
                        envelope.dedup_key(),
                        topic,
                        key,
                        delivery.partition,
                        delivery.offset
                    );
                    Ok(())
                }
                Err((e, _msg)) => {
                    error!("Failed to send message to {}: {}", topic, e);
                    Err(SinkError::Transport(e.to_string()))
                }
            }
        }
    }
}
