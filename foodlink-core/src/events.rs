use async_trait::async_trait;
use foodlink_shared::EventEnvelope;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Event transport failed: {0}")]
    Transport(String),
    #[error("Event encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Downstream notification channel. Delivery is at-least-once, so
/// consumers dedupe on `EventEnvelope::dedup_key`.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), SinkError>;
}
